// Sound Blaster 1.x/2.0 DSP: command state machine, the Creative ADPCM
// decoders, the DMA/IRQ interlock and the diagnostic sine generator. The
// mixer-less early cards keep this to one 8-bit mono voice; output renders
// at the crystal divided by 644 into the shared double buffer.

use crate::audio::{double_buffer, DoubleBufferReader, DoubleBufferWriter, Fifo};
use crate::devices::{ClockTick, LineEvent, IRQ_SOUNDBLASTER, MHZ14, NS_PER_SEC};
use tracing::{debug, trace};

pub const SB_VERSION_1X: u16 = 0x0105;
pub const SB_VERSION_20: u16 = 0x0201;

const DSP_IN_SIZE: usize = 16;
const DSP_OUT_SIZE: usize = 0x10000;
const OUTPUT_DIVIDER: u64 = 644; // ~22.2 kHz render rate
const OUTPUT_RATE: u32 = (MHZ14 / OUTPUT_DIVIDER) as u32;
const OUTPUT_BUFFER: usize = 2048;
const RESET_NS: u64 = 20_000;
const SOFT_IRQ_NS: u64 = 10_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ResetState {
    Reset,
    ResetWait,
    Normal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AdpcmFormat {
    None,
    TwoBit,
    TwoSixBit,
    FourBit,
}

// DREQ composite bits: 0 transfer active, 1 wait for the played sample,
// 2 DACK inhibit until the sample timer, 3 wait for IRQ acknowledge,
// 4 recording direction.
const DREQ_ACTIVE: u8 = 1;
const DREQ_SAMPLEWAIT: u8 = 2;
const DREQ_DACKWAIT: u8 = 4;
const DREQ_IRQWAIT: u8 = 8;
const DREQ_RECORDING: u8 = 0x10;

fn sample_to_i16(sample: u8) -> i16 {
    (((sample ^ 0x80) as i8) as i16) << 8
}

pub struct SoundBlaster {
    version: u16,
    dsp_in: Fifo<u8>,
    dsp_out: Fifo<u8>,
    command: u8,
    original_command: u8,
    command_step: u8,
    data_left: u32,
    busy: u8,
    irq_pending: u8, // bit 1 latched, bit 0 accepted by the PIC
    dreq: u8,
    word_param: u16,
    silence_samples: u32,
    muted: bool,
    singen: bool,
    singen_ns: u64,
    dma_disabled: u8,
    adpcm_format: AdpcmFormat,
    adpcm_reference_next: bool,
    adpcm_reference: u8,
    adpcm_step: i32,
    reset_state: ResetState,
    auto_init: bool,
    auto_init_buf: bool,
    auto_init_block: u16,
    auto_init_block_set: u8, // 0 unset, 1 set, 2 expected from parameters
    test_register: u8,
    timer: u16,
    time_constant: u8,
    time_constant_dirty: bool,
    dma_finished: bool,
    tc_seen: bool,
    left: u8,
    right: u8,
    recorded_sample: u8,
    last_result: u8,
    soft_irq_ns: u64,
    reset_ns: u64,
    sample_numerator: u64,
    render_remainder: u64,
    out: DoubleBufferWriter<(i16, i16)>,
    reader: Option<DoubleBufferReader<(i16, i16)>>,
    lines: Vec<LineEvent>,
}

impl SoundBlaster {
    pub fn new(version: u16) -> Self {
        let (out, reader) = double_buffer(OUTPUT_BUFFER, OUTPUT_RATE, (0i16, 0i16));
        let mut dsp_in = Fifo::new(DSP_IN_SIZE);
        dsp_in.write(0xAA);
        SoundBlaster {
            version,
            dsp_in,
            dsp_out: Fifo::new(DSP_OUT_SIZE),
            command: 0,
            original_command: 0,
            command_step: 0,
            data_left: 0,
            busy: 0,
            irq_pending: 0,
            dreq: 0,
            word_param: 0,
            silence_samples: 0,
            muted: true,
            singen: false,
            singen_ns: 0,
            dma_disabled: 0,
            adpcm_format: AdpcmFormat::None,
            adpcm_reference_next: false,
            adpcm_reference: 0,
            adpcm_step: 0,
            reset_state: ResetState::Normal,
            auto_init: false,
            auto_init_buf: false,
            auto_init_block: 0,
            auto_init_block_set: 0,
            test_register: 0,
            timer: 0,
            time_constant: 0,
            time_constant_dirty: false,
            dma_finished: false,
            tc_seen: false,
            left: 0x80,
            right: 0x80,
            recorded_sample: 0x80,
            last_result: 0xAA,
            soft_irq_ns: 0,
            reset_ns: 0,
            sample_numerator: 0,
            render_remainder: 0,
            out,
            reader: Some(reader),
            lines: Vec::new(),
        }
    }

    pub fn take_reader(&mut self) -> Option<DoubleBufferReader<(i16, i16)>> {
        self.reader.take()
    }

    pub fn drain_lines(&mut self, out: &mut Vec<LineEvent>) {
        out.append(&mut self.lines);
    }

    /// The host recording input, mixed down to one unsigned byte.
    pub fn set_recorded_sample(&mut self, sample: u8) {
        self.recorded_sample = sample;
    }

    pub fn current_sample(&self) -> (u8, u8) {
        if self.muted {
            (0x80, 0x80)
        } else {
            (self.left, self.right)
        }
    }

    pub fn output_samples_buffered(&self) -> usize {
        self.dsp_out.len()
    }

    /// Last raw command byte software wrote, useful for state displays.
    pub fn last_command(&self) -> u8 {
        self.original_command
    }

    /// Level for the 8-bit DMA channel request line.
    pub fn dreq_level(&self) -> bool {
        (self.dreq & !DREQ_RECORDING) == DREQ_ACTIVE && self.dma_disabled == 0
    }

    fn fire_irq(&mut self) {
        self.irq_pending |= 2;
        self.lines.push(LineEvent::RaiseIrq(IRQ_SOUNDBLASTER));
    }

    /// The PIC latched our edge; an acknowledge read may clear it now.
    pub fn irq_accepted(&mut self) {
        if self.irq_pending & 2 != 0 {
            self.irq_pending |= 1;
        }
    }

    // ---- port I/O, offsets relative to the 0x2x0 base ----

    pub fn write_io(&mut self, offset: u16, value: u8) -> bool {
        match offset & 0xE {
            0x6 => {
                self.write_reset(value);
                true
            }
            0x8 => true, // FM alias, handled by the OPL2 card when present
            0xC => {
                if self.command != 0 {
                    self.write_data(value, false);
                } else {
                    self.write_command(value);
                }
                true
            }
            _ => false,
        }
    }

    pub fn read_io(&mut self, offset: u16) -> Option<u8> {
        match offset & 0xE {
            0x8 if offset & 1 == 0 => Some(0xFF), // FM status alias
            0xA => Some(self.read_data(false)),
            0xC => {
                if self.reset_state == ResetState::Normal {
                    self.busy = self.busy.wrapping_add(1);
                    Some(if self.busy & 8 != 0 { 0xFF } else { 0x7F })
                } else {
                    Some(0xFF)
                }
            }
            0xE => {
                // Only bit 7 is wired; the rest read back as a fixed float
                // pattern. This read acknowledges a pending 8-bit IRQ.
                let result = ((!self.dsp_in.is_empty() as u8) << 7) | 0x2A;
                if self.irq_pending & 3 == 3 {
                    self.irq_pending = 0;
                    self.lines.push(LineEvent::LowerIrq(IRQ_SOUNDBLASTER));
                    self.dreq &= !DREQ_IRQWAIT;
                }
                Some(result)
            }
            _ => None, // +0, +2, +4 and reset-port reads float the bus
        }
    }

    fn write_reset(&mut self, value: u8) {
        if value & 1 != 0 && self.reset_state != ResetState::Reset {
            self.hw_reset();
            self.reset_state = ResetState::Reset;
        } else if value & 1 == 0 && self.reset_state == ResetState::Reset {
            self.reset_state = ResetState::ResetWait;
            self.reset_ns = RESET_NS;
        }
    }

    fn hw_reset(&mut self) {
        debug!("dsp reset");
        if !(self.command == 0x90 || self.command == 0x91) {
            // High-speed DMA survives everything except the command itself.
            self.busy = 0;
            self.silence_samples = 0;
            self.irq_pending = 0;
            self.singen = false;
            self.dreq = 0;
            self.adpcm_reference_next = false;
            self.adpcm_reference = 0;
            self.auto_init_block = 0;
            self.auto_init_block_set = 0;
            self.dsp_in.clear();
            self.dsp_out.clear();
            self.lines.push(LineEvent::LowerIrq(IRQ_SOUNDBLASTER));
            self.left = 0x80;
            self.right = 0x80;
        }
        self.command = 0;
    }

    fn finish_reset(&mut self) {
        self.dsp_in.write(0xAA);
        self.reset_state = ResetState::Normal;
    }

    fn require_sb2(&mut self) -> bool {
        if self.version < SB_VERSION_20 {
            self.command = 0;
            return false;
        }
        true
    }

    fn start_adpcm(&mut self, command: u8, format: AdpcmFormat, reference: bool, auto_init: bool) {
        self.command_step = 0;
        self.command = command;
        self.data_left = 0;
        self.adpcm_reference_next = reference;
        self.adpcm_format = format;
        self.auto_init_buf = auto_init;
    }

    fn transfer_length(command: u8, length: u16) -> Option<u32> {
        match command {
            0x90 | 0x1C | 0x91 | 0x14 | 0x16 | 0x17 | 0x24 | 0x98 | 0x2C | 0x74 | 0x75 | 0x76
            | 0x77 | 0x7D | 0x7F | 0x1F => Some(length as u32 + 1),
            _ => None,
        }
    }

    fn start_dma_dac(&mut self, auto_init_dma: bool, recording: bool) {
        self.dreq = DREQ_ACTIVE | ((recording as u8) << 4);
        if self.dma_disabled & 1 != 0 || auto_init_dma {
            self.dma_disabled &= !1;
        }
        self.command_step = 1;
        self.auto_init = self.auto_init_buf;
        // Starting any DMA transfer loads the block size latch too.
        self.auto_init_block = self.word_param;
        self.dma_finished = false;
        if let Some(length) = Self::transfer_length(self.command, self.word_param) {
            self.data_left = length;
        }
        if self.timer == 0 || self.time_constant_dirty {
            self.timer = 256 - self.time_constant as u16;
            self.time_constant_dirty = false;
        }
    }

    fn write_command(&mut self, command: u8) {
        self.original_command = command;
        if self.command == 0x90 {
            // High-speed transfer running: only a reset gets us back.
            return;
        }
        trace!(command, "dsp command");
        let mut auto_init = false;
        let mut reference = false;
        match command {
            0x04 => {
                if self.version < SB_VERSION_20 {
                    self.dsp_in.write(0xFF);
                } else {
                    let mut result = 8;
                    if matches!(self.command, 0x90 | 0x1C | 0x91 | 0x14) && self.dreq & DREQ_ACTIVE != 0
                    {
                        result |= 0x80;
                    }
                    self.dsp_in.write(result);
                }
            }
            0x10 => self.command = 0x10,
            0x90 | 0x1C => {
                if !self.require_sb2() {
                    return;
                }
                auto_init = true;
                self.start_plain_dma(command, auto_init);
            }
            0x91 => {
                if !self.require_sb2() {
                    return;
                }
                self.start_plain_dma(command, auto_init);
            }
            0x14 => self.start_plain_dma(command, auto_init),
            0x1F => {
                if !self.require_sb2() {
                    return;
                }
                self.start_adpcm(command, AdpcmFormat::TwoBit, true, true);
                self.start_pending_autoinit(false);
            }
            0x17 | 0x16 => {
                reference = command == 0x17;
                self.start_adpcm(command, AdpcmFormat::TwoBit, reference, false);
            }
            0x20 => {
                self.dsp_in.clear();
                let sample = self.recorded_sample;
                self.dsp_in.write(sample);
                self.command = 0;
                self.dreq = 0;
            }
            0x98 | 0x2C => {
                if !self.require_sb2() {
                    return;
                }
                auto_init = true;
                self.start_adc(command, auto_init);
            }
            0x24 => self.start_adc(command, auto_init),
            0x30 | 0x31 | 0x34 | 0x35 | 0x37 => {
                // MIDI transport modes of later DSPs, not on this chip.
            }
            0x38 => self.command = 0x38,
            0x40 => self.command = 0x40,
            0x48 => {
                if !self.require_sb2() {
                    return;
                }
                self.command_step = 0;
                self.command = command;
                self.dreq = 0;
                self.data_left = 0;
            }
            0x7D => {
                if !self.require_sb2() {
                    return;
                }
                self.start_adpcm(command, AdpcmFormat::FourBit, true, true);
                self.start_pending_autoinit(false);
            }
            0x75 | 0x74 => {
                reference = command == 0x75;
                self.start_adpcm(command, AdpcmFormat::FourBit, reference, false);
            }
            0x7F => {
                if !self.require_sb2() {
                    return;
                }
                self.start_adpcm(command, AdpcmFormat::TwoSixBit, true, true);
                self.start_pending_autoinit(false);
            }
            0x77 | 0x76 => {
                reference = command == 0x77;
                self.start_adpcm(command, AdpcmFormat::TwoSixBit, reference, false);
            }
            0x80 => {
                self.command = 0x80;
                self.command_step = 0;
            }
            0xD0 => {
                if self.dreq != 0 {
                    self.dma_disabled = 1;
                }
            }
            0xD1 => self.muted = false,
            0xD3 => {
                self.muted = true;
                self.singen = false;
            }
            0xD4 => {
                if self.dma_disabled != 0 {
                    self.dma_disabled = 0;
                }
            }
            0xD8 => {
                self.dsp_in.write(if self.muted { 0x00 } else { 0xFF });
            }
            0xDA => {
                if !self.require_sb2() {
                    return;
                }
                // The running block still plays to its end.
                self.auto_init = false;
            }
            0xE0 => self.command = 0xE0,
            0xE1 => {
                self.dsp_in.write((self.version >> 8) as u8);
                self.dsp_in.write((self.version & 0xFF) as u8);
            }
            0xE4 => {
                if !self.require_sb2() {
                    return;
                }
                self.command = 0xE4;
                self.command_step = 0;
            }
            0xE8 => {
                if !self.require_sb2() {
                    return;
                }
                let value = self.test_register;
                self.dsp_in.write(value);
            }
            0xF0 => {
                self.muted = false;
                self.singen = true;
                self.singen_ns = 0;
            }
            0xF2 => self.soft_irq_ns = SOFT_IRQ_NS,
            0xF8 => {
                self.dsp_in.write(0x00);
            }
            _ => {
                trace!(command, "dsp command ignored");
            }
        }
    }

    fn start_plain_dma(&mut self, command: u8, auto_init: bool) {
        self.command_step = 0;
        self.command = command;
        self.data_left = 0;
        self.dreq = 0;
        self.adpcm_format = AdpcmFormat::None;
        self.auto_init_buf = auto_init;
        if auto_init {
            self.start_pending_autoinit(false);
        }
    }

    fn start_adc(&mut self, command: u8, auto_init: bool) {
        self.command_step = 0;
        self.command = command;
        self.dreq = 0;
        self.data_left = 0;
        self.auto_init_buf = auto_init;
        if auto_init {
            self.start_pending_autoinit(true);
        }
    }

    /// Auto-init start helper: with a block size already set the transfer
    /// starts now, otherwise the next parameter pair sets it first.
    fn start_pending_autoinit(&mut self, recording: bool) {
        if !self.auto_init_buf {
            return;
        }
        if self.auto_init_block_set == 1 {
            self.word_param = self.auto_init_block;
            self.start_dma_dac(true, recording);
        } else {
            self.auto_init_block_set = 2;
            self.command_step = 0;
        }
    }

    fn write_data(&mut self, data: u8, is_dma: bool) {
        match self.command {
            0 => {}
            0x10 => {
                self.left = data;
                self.right = data;
                self.dma_disabled = 0;
                self.dreq = 0;
                self.command = 0;
                self.dsp_out.clear();
            }
            0x40 => {
                if data != self.time_constant {
                    self.time_constant_dirty = true;
                }
                self.time_constant = data;
                self.command = 0;
            }
            0x91 | 0x14 | 0x16 | 0x17 | 0x90 | 0x1C | 0x1F | 0x74 | 0x75 | 0x76 | 0x77 | 0x7D
            | 0x7F => {
                if self.command_step != 0 {
                    if is_dma {
                        self.consume_dma_byte(data);
                    } else {
                        // Manual writes mid-transfer start a new command;
                        // drivers rely on this chip quirk.
                        self.write_command(data);
                    }
                } else {
                    self.consume_parameter(data, false);
                }
            }
            0x98 | 0x2C | 0x24 => {
                if self.command_step != 0 {
                    if !is_dma {
                        self.write_command(data);
                    }
                    // DMA writes during recording are a misconfiguration.
                } else {
                    self.consume_parameter(data, true);
                }
            }
            0x80 => {
                self.dreq = 0;
                match self.command_step {
                    0 => {
                        self.word_param = data as u16;
                        self.command_step = 1;
                    }
                    1 => {
                        self.word_param |= (data as u16) << 8;
                        if self.timer == 0 || self.time_constant_dirty {
                            self.timer = 256 - self.time_constant as u16;
                            self.time_constant_dirty = false;
                        }
                        self.silence_samples = self.word_param as u32 + 1;
                        self.command_step = 2;
                    }
                    _ => {}
                }
            }
            0xE0 => {
                self.command = 0;
                self.dsp_in.write(!data);
            }
            0x38 => {
                // MIDI byte swallowed; no UART on this DSP.
                self.command = 0;
            }
            0x48 => {
                if is_dma {
                    return;
                }
                match self.data_left {
                    0 => {
                        self.word_param = data as u16;
                        self.data_left = 1;
                    }
                    _ => {
                        self.word_param |= (data as u16) << 8;
                        self.auto_init_block = self.word_param;
                        self.command = 0;
                        self.data_left = 0;
                        self.auto_init_block_set = 1;
                    }
                }
            }
            0xE4 => {
                self.test_register = data;
                self.command = 0;
            }
            _ => {}
        }
    }

    fn consume_parameter(&mut self, data: u8, recording: bool) {
        match self.data_left {
            0 => {
                self.word_param = data as u16;
                self.data_left = 1;
            }
            _ => {
                self.word_param |= (data as u16) << 8;
                self.data_left = 0;
                if recording {
                    self.command_step = 1;
                }
                if self.auto_init_block_set == 2 && self.auto_init_buf {
                    // The parameter pair doubles as the block size.
                    self.auto_init_block = self.word_param;
                    self.auto_init_block_set = 1;
                    self.start_dma_dac(true, recording);
                } else {
                    self.start_dma_dac(self.auto_init_buf, recording);
                }
            }
        }
    }

    fn consume_dma_byte(&mut self, data: u8) {
        if self.adpcm_format != AdpcmFormat::None {
            if self.adpcm_reference_next {
                self.adpcm_reference_next = false;
                self.adpcm_reference = data;
                self.adpcm_step = 0;
                self.dsp_out.write(data);
            } else {
                match self.adpcm_format {
                    AdpcmFormat::TwoBit => {
                        for shift in [6u8, 4, 2, 0].iter() {
                            let sample = self.decode_adpcm2((data >> shift) & 0x3);
                            self.dsp_out.write(sample);
                        }
                    }
                    AdpcmFormat::TwoSixBit => {
                        let samples = [
                            self.decode_adpcm3((data >> 5) & 0x7),
                            self.decode_adpcm3((data >> 2) & 0x7),
                            self.decode_adpcm3((data & 3) << 1),
                        ];
                        for sample in samples.iter() {
                            self.dsp_out.write(*sample);
                        }
                    }
                    AdpcmFormat::FourBit => {
                        let first = self.decode_adpcm4((data >> 4) & 0xF);
                        self.dsp_out.write(first);
                        let second = self.decode_adpcm4(data & 0xF);
                        self.dsp_out.write(second);
                    }
                    AdpcmFormat::None => {
                        self.dsp_out.write(0x80);
                    }
                }
            }
        } else {
            self.dsp_out.write(data);
        }
        if self.data_left > 0 {
            self.data_left -= 1;
        }
        if self.data_left == 0 {
            self.dma_finished = true;
            if self.auto_init {
                if let Some(length) = Self::transfer_length(self.command, self.auto_init_block) {
                    self.data_left = length;
                }
                self.dreq |= DREQ_SAMPLEWAIT;
            } else {
                self.fire_irq();
                self.timer = 0;
                self.dreq = 0;
                self.command = 0; // high-speed transfers stop here too
            }
        } else {
            self.dreq |= DREQ_SAMPLEWAIT;
        }
    }

    fn read_data(&mut self, is_dma: bool) -> u8 {
        match self.command {
            0x98 | 0x2C | 0x24 if self.command_step != 0 => {
                if is_dma {
                    if self.data_left > 0 {
                        self.data_left -= 1;
                    }
                    if self.data_left == 0 {
                        self.dma_finished = true;
                        if self.auto_init {
                            if let Some(length) =
                                Self::transfer_length(self.command, self.auto_init_block)
                            {
                                self.data_left = length;
                            }
                            self.dreq |= DREQ_SAMPLEWAIT;
                        } else {
                            self.fire_irq();
                            self.timer = 0;
                            self.dreq = 0;
                        }
                    } else {
                        self.dreq |= DREQ_SAMPLEWAIT;
                    }
                    return self.recorded_sample;
                }
                // A CPU read during DMA recording sees the stale latch.
                return self.last_result;
            }
            _ => {}
        }
        if let Some(result) = self.dsp_in.read() {
            self.last_result = result;
        }
        self.last_result
    }

    // ---- DMA channel callbacks ----

    pub fn dma_read(&mut self) -> u8 {
        self.read_data(true)
    }

    pub fn dma_write(&mut self, data: u8) {
        self.write_data(data, true);
    }

    pub fn dack(&mut self) {
        self.tc_seen = false;
        self.dreq |= DREQ_DACKWAIT;
    }

    pub fn tc(&mut self) {
        self.tc_seen = true;
    }

    pub fn eop(&mut self) -> bool {
        self.tc_seen
    }

    // ---- scheduler tick ----

    pub fn tick(&mut self, clock: &ClockTick) {
        if self.soft_irq_ns > 0 {
            if self.soft_irq_ns <= clock.ns {
                self.soft_irq_ns = 0;
                self.fire_irq();
            } else {
                self.soft_irq_ns -= clock.ns;
            }
        }
        if self.reset_ns > 0 {
            if self.reset_ns <= clock.ns {
                self.reset_ns = 0;
                self.finish_reset();
            } else {
                self.reset_ns -= clock.ns;
            }
        }

        if self.dreq != 0 || self.silence_samples != 0 {
            // The sample timer steps at 1 MHz; the programmed time constant
            // divides it down to the transfer rate.
            self.sample_numerator += clock.ns * 1_000_000;
            let mut steps = self.sample_numerator / NS_PER_SEC;
            self.sample_numerator -= steps * NS_PER_SEC;
            while steps > 0 {
                steps -= 1;
                if self.timer == 0 {
                    continue;
                }
                self.timer -= 1;
                if self.timer != 0 {
                    continue;
                }
                self.timer = 256 - self.time_constant as u16;
                self.time_constant_dirty = false;
                if self.silence_samples != 0 {
                    self.left = 0x80;
                    self.right = 0x80;
                    self.silence_samples -= 1;
                    if self.silence_samples == 0 {
                        self.timer = 0;
                        self.fire_irq();
                        self.dma_disabled |= 1;
                    }
                } else {
                    if self.dma_finished {
                        self.fire_irq();
                        self.dreq |= DREQ_IRQWAIT;
                        self.dma_finished = false;
                    }
                    if let Some(sample) = self.dsp_out.read() {
                        self.left = sample;
                        self.right = sample;
                    }
                    if self.dsp_out.is_empty() && self.dreq & DREQ_SAMPLEWAIT != 0 {
                        // Block rendered: allow the next DMA burst.
                        self.dreq &= !DREQ_SAMPLEWAIT;
                    }
                }
                if self.dreq & DREQ_DACKWAIT != 0 {
                    self.dreq &= !DREQ_DACKWAIT;
                }
            }
        }

        if self.singen {
            // 2 kHz diagnostic tone, full scale.
            self.singen_ns += clock.ns;
            self.singen_ns %= NS_PER_SEC / 2000;
            let phase = self.singen_ns as f64 / (NS_PER_SEC / 2000) as f64;
            let value = (phase * 2.0 * std::f64::consts::PI).sin();
            let sample = 0x80u8.wrapping_add((value * 127.0) as i8 as u8);
            self.left = sample;
            self.right = sample;
        }

        let (left, right) = self.current_sample();
        self.render_remainder += clock.mhz14;
        while self.render_remainder >= OUTPUT_DIVIDER {
            self.render_remainder -= OUTPUT_DIVIDER;
            self.out.write((sample_to_i16(left), sample_to_i16(right)));
        }
    }

    // ---- Creative ADPCM decoders (tables per the DOSBox reference) ----

    fn decode_adpcm4(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 64] = [
            0, 1, 2, 3, 4, 5, 6, 7, 0, -1, -2, -3, -4, -5, -6, -7, 1, 3, 5, 7, 9, 11, 13, 15, -1,
            -3, -5, -7, -9, -11, -13, -15, 2, 6, 10, 14, 18, 22, 26, 30, -2, -6, -10, -14, -18,
            -22, -26, -30, 4, 12, 20, 28, 36, 44, 52, 60, -4, -12, -20, -28, -36, -44, -52, -60,
        ];
        const ADJUST: [u8; 64] = [
            0, 0, 0, 0, 0, 16, 16, 16, 0, 0, 0, 0, 0, 16, 16, 16, 240, 0, 0, 0, 0, 16, 16, 16,
            240, 0, 0, 0, 0, 16, 16, 16, 240, 0, 0, 0, 0, 16, 16, 16, 240, 0, 0, 0, 0, 16, 16, 16,
            240, 0, 0, 0, 0, 0, 0, 0, 240, 0, 0, 0, 0, 0, 0, 0,
        ];
        self.decode_adpcm(sample, &SCALE, &ADJUST)
    }

    fn decode_adpcm2(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 24] = [
            0, 1, 0, -1, 1, 3, -1, -3, 2, 6, -2, -6, 4, 12, -4, -12, 8, 24, -8, -24, 6, 48, -16,
            -48,
        ];
        const ADJUST: [u8; 24] = [
            0, 4, 0, 4, 252, 4, 252, 4, 252, 4, 252, 4, 252, 4, 252, 4, 252, 4, 252, 4, 252, 0,
            252, 0,
        ];
        self.decode_adpcm(sample, &SCALE, &ADJUST)
    }

    fn decode_adpcm3(&mut self, sample: u8) -> u8 {
        const SCALE: [i8; 40] = [
            0, 1, 2, 3, 0, -1, -2, -3, 1, 3, 5, 7, -1, -3, -5, -7, 2, 6, 10, 14, -2, -6, -10, -14,
            4, 12, 20, 28, -4, -12, -20, -28, 5, 15, 25, 35, -5, -15, -25, -35,
        ];
        const ADJUST: [u8; 40] = [
            0, 0, 0, 8, 0, 0, 0, 8, 248, 0, 0, 8, 248, 0, 0, 8, 248, 0, 0, 8, 248, 0, 0, 8, 248,
            0, 0, 8, 248, 0, 0, 8, 248, 0, 0, 0, 248, 0, 0, 0,
        ];
        self.decode_adpcm(sample, &SCALE, &ADJUST)
    }

    fn decode_adpcm(&mut self, sample: u8, scale_map: &[i8], adjust_map: &[u8]) -> u8 {
        let index = (sample as i32 + self.adpcm_step).clamp(0, scale_map.len() as i32 - 1) as usize;
        let reference = (self.adpcm_reference as i32 + scale_map[index] as i32).clamp(0, 0xFF);
        self.adpcm_reference = reference as u8;
        self.adpcm_step = (self.adpcm_step + adjust_map[index] as i32) & 0xFF;
        self.adpcm_reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset(sb: &mut SoundBlaster) {
        sb.write_io(0x6, 1);
        sb.write_io(0x6, 0);
        sb.tick(&ClockTick { ns: RESET_NS, mhz14: 0, cpu_cycles: 0 });
        assert_eq!(sb.read_io(0xA), Some(0xAA));
    }

    #[test]
    fn reset_pushes_aa() {
        let mut sb = SoundBlaster::new(SB_VERSION_20);
        reset(&mut sb);
    }

    #[test]
    fn version_command_reports_both_bytes() {
        let mut sb = SoundBlaster::new(SB_VERSION_20);
        reset(&mut sb);
        sb.write_io(0xC, 0xE1);
        assert_eq!(sb.read_io(0xA), Some(0x02));
        assert_eq!(sb.read_io(0xA), Some(0x01));
    }

    #[test]
    fn identify_echoes_complement() {
        let mut sb = SoundBlaster::new(SB_VERSION_1X);
        reset(&mut sb);
        sb.write_io(0xC, 0xE0);
        sb.write_io(0xC, 0x5A);
        assert_eq!(sb.read_io(0xA), Some(0xA5));
    }

    #[test]
    fn sb2_commands_gated_on_version() {
        let mut sb = SoundBlaster::new(SB_VERSION_1X);
        reset(&mut sb);
        sb.write_io(0xC, 0xE4); // test register write needs 2.0+
        assert_eq!(sb.command, 0);
        sb.write_io(0xC, 0x12);
        assert_eq!(sb.test_register, 0);
    }

    #[test]
    fn adpcm_decoder_is_deterministic() {
        let mut sb = SoundBlaster::new(SB_VERSION_20);
        sb.adpcm_reference = 0x80;
        sb.adpcm_step = 0;
        let first: Vec<u8> = (0..16).map(|code| sb.decode_adpcm4(code)).collect();
        sb.adpcm_reference = 0x80;
        sb.adpcm_step = 0;
        let second: Vec<u8> = (0..16).map(|code| sb.decode_adpcm4(code)).collect();
        assert_eq!(first, second);
    }
}
