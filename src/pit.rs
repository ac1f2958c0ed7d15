// 8253/8254 programmable interval timer. Three channels on XT/AT class
// boards, six on the Compaq-style chipsets (second block at ports
// 0x48-0x4B). Channel 0 drives IRQ0, channel 1 clocks the DRAM refresh
// request, channel 2 feeds the PC speaker through the gate bits of port
// 0x61, channel 3 of the second block is the failsafe timer reporting
// through the NMI gate.

use crate::audio::{double_buffer, DoubleBufferReader, DoubleBufferWriter, Fifo, SoundFilter, WavSink};
use crate::devices::{ClockTick, LineEvent, IRQ_PIT0, NS_PER_SEC};
use tracing::trace;

// 14.31818 MHz divided by 12 feeds the counters.
const MHZ14_PER_PIT_TICK: u64 = 12;
const PIT_RATE: u64 = 1_193_182;

pub const SPEAKER_RATE: u32 = 44_100;
const SPEAKER_BUFFER: usize = 4096;
// 96dB range at 6dB/octave needs 16x filtering below nyquist.
const SPEAKER_LOWPASS: f32 = (SPEAKER_RATE as f32 / 2.0) / 16.0;
const SPEAKER_VOLUME: f32 = 0.5;

#[derive(Default)]
struct PitChannel {
    mode: u8,
    bcd: bool,
    reload_value: u16,
    ticker: u16,
    step: u8,
    reload: bool,
    output: bool,
    last_output: bool,
    gate_went_high: bool,
    gate_listening: bool,
    reload_listening: u8, // bit 0 armed, bit 1 mode-0 wait-for-load
    null_count: bool,
    rise_toggle: bool,
    command: u8,
    divisor: u16,
    latch: u16,
    read_latch: bool,
    latch_hi_next: bool,
    write_hi_next: bool,
    status_byte: u8,
    read_status: bool,
}

impl PitChannel {
    fn reload_ticker(&mut self) {
        self.ticker = self.reload_value;
        self.null_count = false;
    }
    fn wrap_bcd(&mut self) {
        // A decimal counter that wrapped through zero re-enters at 9999.
        if self.bcd && self.ticker > 9999 {
            self.ticker = (self.ticker as u32 + 10_000 - 0x1_0000) as u16;
        }
    }
    fn decode_bcd(value: u16) -> u16 {
        (value & 0xF)
            + ((value >> 4) & 0xF) * 10
            + ((value >> 8) & 0xF) * 100
            + ((value >> 12) & 0xF) * 1000
    }
    fn encode_bcd(value: u16) -> u16 {
        let value = value % 10_000;
        ((value / 1000) << 12) | (((value / 100) % 10) << 8) | (((value / 10) % 10) << 4) | (value % 10)
    }
    /// Counter snapshot for latching: before the first load the divider
    /// itself is what software reads back.
    fn snapshot(&self) -> u16 {
        if self.null_count {
            self.reload_value
        } else {
            self.ticker
        }
    }
    fn latched_value(&self) -> u16 {
        if self.bcd {
            Self::encode_bcd(self.latch)
        } else {
            self.latch
        }
    }
}

pub struct Pit {
    channels: Vec<PitChannel>,
    last_selected: [usize; 2],
    tick_remainder: u64,
    // Port 0x61 bits 0-1: channel 2 gate and speaker data enable.
    speaker_port: u8,
    old_speaker_port: u8,
    speaker_enabled: bool,
    raw_signal: Fifo<u8>,
    raw_consume_numerator: u64,
    speaker_sample_numerator: u64,
    speaker_filter: SoundFilter,
    speaker_sample: f32,
    speaker_out: DoubleBufferWriter<i16>,
    speaker_reader: Option<DoubleBufferReader<i16>>,
    speaker_capture: Option<WavSink>,
    // Channel 1 edges for the DRAM refresh scheduler.
    pit1_edges: Vec<bool>,
    // Failsafe timer (channel 3) state changes.
    failsafe_edges: Vec<bool>,
}

// Ports 0x48-0x4A map onto channels 3-5 sparsely on the second block.
const SECOND_BLOCK_MAP: [Option<usize>; 3] = [Some(0), None, None];

impl Pit {
    pub fn new(six_channels: bool, speaker: bool) -> Self {
        let count = if six_channels { 6 } else { 3 };
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            channels.push(PitChannel::default());
        }
        let (writer, reader) = double_buffer(SPEAKER_BUFFER, SPEAKER_RATE, 0i16);
        Pit {
            channels,
            last_selected: [0, 3],
            tick_remainder: 0,
            speaker_port: 0,
            old_speaker_port: 0,
            speaker_enabled: speaker,
            raw_signal: Fifo::new(((2048 * PIT_RATE as usize) / SPEAKER_RATE as usize) + 1),
            raw_consume_numerator: 0,
            speaker_sample_numerator: 0,
            speaker_filter: SoundFilter::new(false, SPEAKER_LOWPASS, PIT_RATE as f32),
            speaker_sample: 0.0,
            speaker_out: writer,
            speaker_reader: Some(reader),
            speaker_capture: None,
            pit1_edges: Vec::new(),
            failsafe_edges: Vec::new(),
        }
    }

    /// Host-side reader for the speaker samples, claimable once.
    pub fn take_speaker_reader(&mut self) -> Option<DoubleBufferReader<i16>> {
        self.speaker_reader.take()
    }

    /// Optional WAV tap on the rendered speaker signal.
    pub fn set_speaker_capture(&mut self, sink: Option<WavSink>) {
        self.speaker_capture = sink;
    }

    pub fn drain_pit1_edges(&mut self, out: &mut Vec<bool>) {
        out.append(&mut self.pit1_edges);
    }

    pub fn drain_failsafe_edges(&mut self, out: &mut Vec<bool>) {
        out.append(&mut self.failsafe_edges);
    }

    pub fn output(&self, channel: usize) -> bool {
        self.channels[channel].output
    }

    fn decode_port(&self, port: u16) -> Option<(usize, bool)> {
        // (channel-or-block, is_command)
        match port {
            0x40..=0x42 => Some(((port & 3) as usize, false)),
            0x43 => Some((0, true)),
            0x48..=0x4A if self.channels.len() == 6 => {
                SECOND_BLOCK_MAP[(port - 0x48) as usize].map(|slot| (slot + 3, false))
            }
            0x4B if self.channels.len() == 6 => Some((1, true)),
            _ => None,
        }
    }

    pub fn write_io(&mut self, port: u16, value: u8) -> bool {
        let (target, is_command) = match self.decode_port(port) {
            Some(decoded) => decoded,
            None => return false,
        };
        if is_command {
            self.write_command(target, value);
        } else {
            self.write_data(target, value);
        }
        true
    }

    fn write_command(&mut self, block: usize, value: u8) {
        trace!(block, value, "pit command");
        let base = block * 3;
        if value & 0xC0 == 0xC0 {
            // Read-back: latch status and/or count for up to 3 channels.
            for slot in 0..3 {
                if value & (2 << slot) == 0 {
                    continue;
                }
                let channel = &mut self.channels[base + slot];
                if value & 0x10 == 0 {
                    channel.status_byte = (channel.command & 0x3F)
                        | ((channel.output as u8) << 7)
                        | ((channel.null_count as u8) << 6);
                    channel.read_status = true;
                }
                if value & 0x20 == 0 {
                    channel.latch = channel.snapshot();
                    channel.read_latch = true;
                    channel.latch_hi_next = false;
                    channel.write_hi_next = false;
                }
            }
            return;
        }
        let slot = ((value >> 6) & 3) as usize;
        let index = base + slot;
        if value & 0x30 != 0 {
            let bcd = value & 1 != 0;
            let mode = (value >> 1) & 7;
            let channel = &mut self.channels[index];
            channel.command = value;
            channel.bcd = bcd;
            self.set_mode(index, mode);
            self.channels[index].read_latch = false;
        } else {
            // Latch command freezes a shadow copy for an atomic read.
            let channel = &mut self.channels[index];
            channel.latch = channel.snapshot();
            channel.read_latch = true;
        }
        self.last_selected[block] = index;
        let channel = &mut self.channels[index];
        channel.latch_hi_next = false;
        channel.write_hi_next = false;
    }

    fn set_mode(&mut self, index: usize, mode: u8) {
        let channel = &mut self.channels[index];
        channel.mode = mode & 7;
        channel.step = 0;
        channel.reload = false;
        channel.gate_went_high = false;
        channel.gate_listening = false;
        channel.reload_listening = 0;
        match channel.mode {
            0 | 2 | 3 | 4 => channel.reload_listening = 1,
            _ => {}
        }
        if channel.mode == 0 {
            // Mode 0 waits for the count to be loaded before running.
            channel.reload_listening |= 2;
        }
        channel.null_count = true;
    }

    fn write_data(&mut self, index: usize, value: u8) {
        let channel = &mut self.channels[index];
        let decode = |raw: u16, bcd: bool| if bcd { PitChannel::decode_bcd(raw) } else { raw };
        let encode = |cooked: u16, bcd: bool| if bcd { PitChannel::encode_bcd(cooked) } else { cooked };
        match channel.command & 0x30 {
            0x20 => {
                channel.divisor = decode((value as u16) << 8, channel.bcd);
                channel.null_count = true;
                self.load_frequency(index);
            }
            0x30 => {
                if !channel.write_hi_next {
                    let keep = encode(channel.divisor, channel.bcd) & 0xFF00;
                    channel.divisor = decode(keep | value as u16, channel.bcd);
                    channel.null_count = true;
                    channel.write_hi_next = true;
                } else {
                    let keep = encode(channel.divisor, channel.bcd) & 0xFF;
                    channel.divisor = decode(((value as u16) << 8) | keep, channel.bcd);
                    channel.null_count = true;
                    channel.write_hi_next = false;
                    self.load_frequency(index);
                }
            }
            _ => {
                // Low-only is the documented default for an unprogrammed
                // access field.
                channel.divisor = decode(value as u16, channel.bcd);
                channel.null_count = true;
                self.load_frequency(index);
            }
        }
    }

    fn load_frequency(&mut self, index: usize) {
        let channel = &mut self.channels[index];
        channel.reload_value = channel.divisor;
        if channel.reload_listening & 1 != 0 {
            channel.reload = true;
        }
        if channel.reload_listening & 2 != 0 && channel.mode == 0 && channel.reload {
            // Mode 0 loads the counter on the spot and starts low.
            channel.step = 1;
            channel.reload = false;
            channel.output = false;
            channel.reload_ticker();
        }
        channel.reload_listening &= !2;
    }

    pub fn read_io(&mut self, port: u16) -> Option<u8> {
        let (target, is_command) = self.decode_port(port)?;
        if is_command {
            let index = self.last_selected[target];
            return Some(self.channels[index].command);
        }
        let channel = &mut self.channels[target];
        if channel.read_status {
            channel.read_status = false;
            return Some(channel.status_byte);
        }
        if !channel.read_latch {
            channel.latch = channel.snapshot();
        }
        let value = channel.latched_value();
        let result = match channel.command & 0x30 {
            0x20 => {
                channel.read_latch = false;
                (value >> 8) as u8
            }
            0x30 => {
                if !channel.latch_hi_next {
                    channel.latch_hi_next = true;
                    value as u8
                } else {
                    channel.latch_hi_next = false;
                    channel.read_latch = false;
                    (value >> 8) as u8
                }
            }
            _ => {
                channel.read_latch = false;
                value as u8
            }
        };
        Some(result)
    }

    /// Port 0x61 write: bits 0-1 are ours (channel 2 gate, speaker data
    /// enable). A rising gate is latched for the mode handlers.
    pub fn write_speaker_port(&mut self, value: u8) {
        self.speaker_port = value & 3;
        if (self.old_speaker_port ^ self.speaker_port) & 1 != 0 && self.speaker_port & 1 != 0 {
            let listening = self.channels[2].gate_listening;
            self.channels[2].gate_went_high |= listening;
        }
        self.old_speaker_port = self.speaker_port;
    }

    /// The PIT's contribution to a port 0x61 read: gate bits, channel 1
    /// rise toggle on bit 4 and the live channel 2 output on bit 5.
    pub fn speaker_port_bits(&self) -> u8 {
        (self.speaker_port & 3)
            | ((self.channels[1].rise_toggle as u8) << 4)
            | ((self.channels[2].output as u8) << 5)
    }

    /// XT port 0x62 echoes channel 2 output on bit 5.
    pub fn port62_bits(&self) -> u8 {
        (self.channels[2].output as u8) << 5
    }

    pub fn tick(&mut self, clock: &ClockTick, lines: &mut Vec<LineEvent>) {
        self.tick_remainder += clock.mhz14;
        let steps = self.tick_remainder / MHZ14_PER_PIT_TICK;
        self.tick_remainder -= steps * MHZ14_PER_PIT_TICK;
        for _ in 0..steps {
            self.tick_channels(lines);
        }
        self.render_speaker(clock.ns);
    }

    fn tick_channels(&mut self, lines: &mut Vec<LineEvent>) {
        let gate2 = self.speaker_port & 1 != 0;
        let data_enable = (self.speaker_port & 2) >> 1;
        for index in 0..self.channels.len() {
            let gate = if index == 2 { gate2 } else { true };
            {
                let channel = &mut self.channels[index];
                match channel.mode {
                    0 | 1 => Self::tick_mode01(channel, gate),
                    2 | 6 => Self::tick_mode2(channel, gate),
                    3 | 7 => Self::tick_mode3(channel, gate),
                    4 | 5 => Self::tick_mode45(channel, gate),
                    _ => {}
                }
            }
            let output = self.channels[index].output;
            let changed = self.channels[index].last_output != output;
            if index > 0 && changed && output {
                self.channels[index].rise_toggle ^= true;
            }
            match index {
                0 => {
                    if changed {
                        if output {
                            lines.push(LineEvent::RaiseIrq(IRQ_PIT0));
                        } else {
                            lines.push(LineEvent::LowerIrq(IRQ_PIT0));
                        }
                    }
                }
                1 => {
                    if changed {
                        self.pit1_edges.push(output);
                    }
                }
                2 => {
                    self.raw_signal.write((output as u8) & data_enable);
                }
                3 => {
                    if changed {
                        self.failsafe_edges.push(output);
                    }
                }
                _ => {}
            }
            self.channels[index].last_output = output;
        }
    }

    fn tick_mode01(channel: &mut PitChannel, gate: bool) {
        if channel.step == 0 {
            channel.output = channel.mode == 1;
            channel.reload_listening |= 1;
            if channel.reload && channel.reload_listening & 2 == 0 {
                channel.gate_listening = channel.mode == 1;
                channel.step = 1;
            } else {
                return;
            }
        }
        if channel.step == 1 {
            if channel.mode == 0 {
                channel.step = 2;
            } else if channel.gate_went_high {
                channel.gate_went_high = false;
                channel.gate_listening = false;
                channel.step = 2;
            } else {
                return;
            }
        }
        if channel.step == 2 {
            if channel.reload {
                channel.reload = false;
                channel.output = false;
                channel.reload_ticker();
            }
            let old = channel.ticker;
            if channel.mode == 1 || gate {
                channel.ticker = channel.ticker.wrapping_sub(1);
                channel.wrap_bcd();
            }
            if channel.ticker == 0 && old != 0 {
                channel.output = true;
            }
        }
    }

    fn mode2_reload(channel: &mut PitChannel) {
        channel.reload = false;
        channel.reload_ticker();
        channel.output = true;
        channel.step = 2;
        channel.reload_listening = 0;
        channel.gate_listening = true;
    }

    fn tick_mode2(channel: &mut PitChannel, gate: bool) {
        match channel.step {
            0 | 1 => {
                if channel.step == 0 {
                    channel.output = true;
                    channel.reload_listening = 1;
                    channel.step = 1;
                }
                if channel.reload {
                    Self::mode2_reload(channel);
                }
            }
            2 => {
                if channel.gate_went_high {
                    channel.gate_went_high = false;
                    Self::mode2_reload(channel);
                    return;
                }
                if gate {
                    channel.ticker = channel.ticker.wrapping_sub(1);
                    match channel.ticker {
                        1 => channel.output = false,
                        0 => {
                            channel.output = true;
                            channel.reload_ticker();
                        }
                        _ => {}
                    }
                } else {
                    // Low gate parks the output high until the next reload.
                    channel.output = true;
                }
            }
            _ => {}
        }
    }

    fn mode3_count(channel: &mut PitChannel, gate: bool) {
        if channel.gate_went_high {
            channel.gate_went_high = false;
            channel.reload = false;
            channel.reload_ticker();
        }
        if gate {
            channel.ticker = channel.ticker.wrapping_sub(2);
            match channel.ticker {
                // Even counts reach 0, odd counts slide through to -1.
                0 | 0xFFFF => {
                    channel.output ^= true;
                    channel.reload = false;
                    channel.reload_ticker();
                }
                _ => {}
            }
        }
    }

    fn tick_mode3(channel: &mut PitChannel, gate: bool) {
        match channel.step {
            0 => {
                channel.output = true;
                channel.reload_listening = 1;
                if channel.reload {
                    channel.reload = false;
                    channel.reload_ticker();
                    channel.step = 1;
                    channel.reload_listening = 0;
                    channel.gate_listening = true;
                    Self::mode3_count(channel, gate);
                }
            }
            1 => Self::mode3_count(channel, gate),
            _ => {}
        }
    }

    fn mode45_reload(channel: &mut PitChannel) -> bool {
        if channel.mode == 4 || (channel.gate_went_high && channel.mode == 5) {
            channel.gate_went_high = false;
            channel.reload = false;
            channel.reload_ticker();
            channel.step = 2;
            return true;
        }
        false
    }

    fn tick_mode45(channel: &mut PitChannel, gate: bool) {
        match channel.step {
            0 | 1 => {
                if channel.step == 0 {
                    channel.output = true;
                    channel.step = 1;
                    channel.reload_listening = 1;
                    channel.gate_listening = true;
                }
                if channel.reload {
                    Self::mode45_reload(channel);
                }
            }
            2 | 3 => {
                if channel.reload || (channel.mode == 5 && channel.gate_went_high) {
                    Self::mode45_reload(channel);
                    return;
                }
                if gate {
                    channel.ticker = channel.ticker.wrapping_sub(1);
                    channel.wrap_bcd();
                    if channel.ticker == 0 && channel.step != 3 {
                        // Strobe low for exactly one input tick.
                        channel.output = false;
                        channel.step = 3;
                    } else {
                        channel.output = true;
                    }
                } else {
                    channel.output = true;
                }
            }
            _ => {}
        }
    }

    fn render_speaker(&mut self, ns: u64) {
        if !self.speaker_enabled {
            // Nobody listens; keep the raw FIFO from overflowing.
            while self.raw_signal.len() > self.raw_signal.capacity() / 2 {
                self.raw_signal.read();
            }
            return;
        }
        self.speaker_sample_numerator += ns * SPEAKER_RATE as u64;
        let samples = self.speaker_sample_numerator / NS_PER_SEC;
        self.speaker_sample_numerator -= samples * NS_PER_SEC;
        for _ in 0..samples {
            // Block-average the 1.19 MHz duty cycle into one host sample.
            self.raw_consume_numerator += PIT_RATE;
            let take = self.raw_consume_numerator / SPEAKER_RATE as u64;
            self.raw_consume_numerator -= take * SPEAKER_RATE as u64;
            for _ in 0..take {
                let raw = match self.raw_signal.read() {
                    Some(sample) => sample,
                    None => break,
                };
                self.speaker_sample = if raw != 0 {
                    i16::MAX as f32 * SPEAKER_VOLUME
                } else {
                    i16::MIN as f32 * SPEAKER_VOLUME
                };
                self.speaker_filter.apply(&mut self.speaker_sample);
            }
            self.speaker_out.write(self.speaker_sample as i16);
            if let Some(capture) = self.speaker_capture.as_mut() {
                capture.write_mono(self.speaker_sample as i16);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_pit(pit: &mut Pit, pit_ticks: u64) -> Vec<LineEvent> {
        let mut lines = Vec::new();
        let clock = ClockTick {
            ns: 0,
            mhz14: pit_ticks * MHZ14_PER_PIT_TICK,
            cpu_cycles: 0,
        };
        pit.tick(&clock, &mut lines);
        lines
    }

    #[test]
    fn latch_freezes_count() {
        let mut pit = Pit::new(false, false);
        pit.write_io(0x43, 0x34); // channel 0, lo/hi, mode 2
        pit.write_io(0x40, 0x10);
        pit.write_io(0x40, 0x00);
        tick_pit(&mut pit, 5);
        pit.write_io(0x43, 0x00); // latch channel 0
        let lo = pit.read_io(0x40).unwrap();
        let hi = pit.read_io(0x40).unwrap();
        let latched = ((hi as u16) << 8) | lo as u16;
        tick_pit(&mut pit, 3);
        pit.write_io(0x43, 0x00);
        let lo2 = pit.read_io(0x40).unwrap();
        let hi2 = pit.read_io(0x40).unwrap();
        let later = ((hi2 as u16) << 8) | lo2 as u16;
        assert!(later < latched);
    }

    #[test]
    fn bcd_counts_decimal() {
        let mut pit = Pit::new(false, false);
        pit.write_io(0x43, 0x31); // channel 0, lo/hi, mode 0, BCD
        pit.write_io(0x40, 0x25);
        pit.write_io(0x40, 0x00); // 25 decimal
        tick_pit(&mut pit, 5);
        pit.write_io(0x43, 0x00);
        let lo = pit.read_io(0x40).unwrap();
        let hi = pit.read_io(0x40).unwrap();
        // 25 - 5 ticks, minus the extra load tick, read back as BCD 0x19.
        assert_eq!(hi, 0x00);
        assert!(lo == 0x20 || lo == 0x19);
    }

    #[test]
    fn readback_status_reports_mode() {
        let mut pit = Pit::new(false, false);
        pit.write_io(0x43, 0x36);
        pit.write_io(0x43, 0xE2); // read-back, status only, channel 0
        let status = pit.read_io(0x40).unwrap();
        assert_eq!(status & 0x3F, 0x36 & 0x3F);
        assert!(status & 0x40 != 0); // null count until first load
    }
}
