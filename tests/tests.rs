use empc::devices::{ClockTick, IrqLine, LineEvent, IRQ_PIT0};
use empc::dma::{Dma, DmaPeripherals};
use empc::gameblaster::{GameBlaster, BASE_RATE};
use empc::machine;
use empc::pic::Pic;
use empc::pit::Pit;
use empc::Emulator;

const PIT_TICK_MHZ14: u64 = 12;

fn pit_clock(pit_ticks: u64) -> ClockTick {
    ClockTick { ns: 0, mhz14: pit_ticks * PIT_TICK_MHZ14, cpu_cycles: 0 }
}

// ---- property 1: latched counts read back what was programmed ----

#[test]
fn pit_round_trip_all_modes() {
    for mode in 0u8..=5 {
        for &count in &[1u16, 2, 0x10, 0x1234, 0xFFFF] {
            let mut pit = Pit::new(false, false);
            let control = (mode << 1) | 0x30; // channel 0, lo/hi access
            pit.write_io(0x43, control);
            pit.write_io(0x40, (count & 0xFF) as u8);
            pit.write_io(0x40, (count >> 8) as u8);
            pit.write_io(0x43, 0x00); // latch
            let lo = pit.read_io(0x40).unwrap();
            let hi = pit.read_io(0x40).unwrap();
            let read_back = ((hi as u16) << 8) | lo as u16;
            assert_eq!(read_back, count, "mode {} count {:#x}", mode, count);
        }
    }
}

// ---- property 2: terminal count fires exactly once ----

#[derive(Default)]
struct RecordingClient {
    dreq: bool,
    reads: Vec<u32>,
    writes: Vec<(u32, u8)>,
    device_bytes: Vec<u8>,
    tc_count: usize,
    dack_count: usize,
}

impl DmaPeripherals for RecordingClient {
    fn has_device(&self, channel: u8) -> bool {
        channel == 1
    }
    fn dreq(&mut self, channel: u8) -> Option<bool> {
        if channel == 1 {
            Some(self.dreq)
        } else {
            None
        }
    }
    fn device_read(&mut self, _channel: u8) -> Option<u8> {
        Some(0x5A)
    }
    fn device_write(&mut self, _channel: u8, value: u8) -> bool {
        self.device_bytes.push(value);
        true
    }
    fn dack(&mut self, _channel: u8) {
        self.dack_count += 1;
    }
    fn tc(&mut self, _channel: u8) {
        self.tc_count += 1;
    }
    fn memory_read(&mut self, address: u32) -> u8 {
        self.reads.push(address);
        address as u8
    }
    fn memory_write(&mut self, address: u32, value: u8) {
        self.writes.push((address, value));
    }
    fn memory_read_word(&mut self, address: u32) -> u16 {
        self.reads.push(address);
        0
    }
    fn memory_write_word(&mut self, address: u32, value: u16) {
        self.writes.push((address, value as u8));
    }
}

fn program_channel1(dma: &mut Dma, mode: u8, address: u16, count: u16, page: u8) {
    dma.write_io(0x08, 0x00); // enable controller
    dma.write_io(0x0C, 0); // reset flip-flop
    dma.write_io(0x0B, mode);
    dma.write_io(0x02, (address & 0xFF) as u8);
    dma.write_io(0x02, (address >> 8) as u8);
    dma.write_io(0x03, (count & 0xFF) as u8);
    dma.write_io(0x03, (count >> 8) as u8);
    dma.write_io(0x83, page); // channel 1 page register
    dma.write_io(0x0A, 0x01); // unmask channel 1
}

#[test]
fn dma_terminal_count_fires_once() {
    let mut dma = Dma::new(false);
    let mut client = RecordingClient::default();
    client.dreq = true;
    let count = 7u16;
    program_channel1(&mut dma, 0x49, 0x2000, count, 0x01);
    // Plenty of bus ticks for count + 1 transfers and then some.
    for _ in 0..100 {
        dma.tick(&pit_clock(4), &mut client);
    }
    assert_eq!(client.tc_count, 1);
    assert_eq!(client.reads.len() as u16, count + 1);
    assert_eq!(client.device_bytes.len() as u16, count + 1);
    assert!(client.writes.is_empty(), "read-memory mode never writes RAM");
    // No auto-init: the channel parks with its TC status latched.
    let status = dma.read_io(0x08).unwrap();
    assert_ne!(status & 0x02, 0, "channel 1 TC status bit");
    // The status read cleared the TC nibble.
    assert_eq!(dma.read_io(0x08).unwrap() & 0x02, 0);
}

#[test]
fn dma_autoinit_reloads_base() {
    let mut dma = Dma::new(false);
    let mut client = RecordingClient::default();
    client.dreq = true;
    // Single, increment, read-memory, auto-init.
    program_channel1(&mut dma, 0x59, 0x2000, 3, 0x01);
    for _ in 0..100 {
        dma.tick(&pit_clock(4), &mut client);
    }
    assert!(client.tc_count >= 2, "auto-init keeps transferring");
    // The address restarts at the base after each terminal count.
    let first_block: Vec<u32> = client.reads[0..4].to_vec();
    let second_block: Vec<u32> = client.reads[4..8].to_vec();
    assert_eq!(first_block, second_block);
}

// ---- scenario B: single-cycle memory sweep with the documented mode ----

#[test]
fn dma_single_cycle_sweep() {
    let mut dma = Dma::new(false);
    let mut client = RecordingClient::default();
    client.dreq = true;
    program_channel1(&mut dma, 0x49, 0x1000, 0x000F, 0x0A);
    for _ in 0..200 {
        dma.tick(&pit_clock(4), &mut client);
    }
    let expected: Vec<u32> = (0..16).map(|offset| 0x0A1000 + offset).collect();
    assert_eq!(client.reads, expected);
    assert_eq!(client.tc_count, 1);
    // Every transfer saw its DACK.
    assert!(client.dack_count >= 16);
}

// ---- property 3: fixed priority, lower IR number first ----

fn programmed_pair() -> Pic {
    let mut pic = Pic::new(true);
    pic.write_io(0x20, 0x11);
    pic.write_io(0x21, 0x08);
    pic.write_io(0x21, 0x04);
    pic.write_io(0x21, 0x01);
    pic.write_io(0xA0, 0x11);
    pic.write_io(0xA1, 0x70);
    pic.write_io(0xA1, 0x02);
    pic.write_io(0xA1, 0x01);
    pic
}

#[test]
fn pic_priority_orders_vectors() {
    let mut pic = programmed_pair();
    pic.raise_irq(IrqLine::new(0, 3));
    pic.raise_irq(IrqLine::new(0, 7));
    pic.acknowledge_raises();
    assert_eq!(pic.inta(), 0x08 + 3);
    assert_eq!(pic.inta(), 0x08 + 7);
}

// ---- property 4: EOI semantics ----

#[test]
fn eoi_clears_exactly_one_bit() {
    let mut pic = programmed_pair();
    pic.raise_irq(IrqLine::new(0, 3));
    pic.raise_irq(IrqLine::new(0, 5));
    pic.acknowledge_raises();
    pic.inta();
    pic.inta();
    assert_eq!(pic.isr(0), (1 << 3) | (1 << 5));
    pic.write_io(0x20, 0x20); // non-specific EOI
    assert_eq!(pic.isr(0), 1 << 5);
    // Specific EOI naming an idle IR is a no-op.
    pic.write_io(0x20, 0x60 | 3);
    assert_eq!(pic.isr(0), 1 << 5);
    pic.write_io(0x20, 0x60 | 5);
    assert_eq!(pic.isr(0), 0);
}

// ---- spurious IR7 ----

#[test]
fn spurious_inta_returns_ir7() {
    let mut pic = programmed_pair();
    assert_eq!(pic.inta(), 0x08 | 7);
    assert_eq!(pic.isr(0), 0, "spurious vector leaves no service bit");
}

// ---- scenario D: cascaded delivery through the pair ----

#[test]
fn cascade_delivers_slave_vector() {
    let mut emulator = Emulator::new(machine::ibm_at());
    let chipset = &mut emulator.chipset;
    chipset.io_write(0x20, 0x11);
    chipset.io_write(0x21, 0x08);
    chipset.io_write(0x21, 0x04); // slave on IR2
    chipset.io_write(0x21, 0x01);
    chipset.io_write(0xA0, 0x11);
    chipset.io_write(0xA1, 0x70);
    chipset.io_write(0xA1, 0x02);
    chipset.io_write(0xA1, 0x01);
    chipset.pic.raise_irq(IrqLine::new(0, 9)); // slave IR1
    chipset.pic.acknowledge_raises();
    assert!(chipset.interrupt_pending());
    // The CPU ends up with the slave's vector; the master holds IR2.
    assert_eq!(chipset.inta(), 0x70 + 1);
    assert_eq!(chipset.pic.isr(0), 1 << 2);
    assert_eq!(chipset.pic.isr(1), 1 << 1);
}

// ---- scenario A: PIT square-wave edges at the programmed divisor ----

#[test]
fn pit_divisor_spaces_irq0_edges() {
    let mut pit = Pit::new(false, false);
    let mut lines = Vec::new();
    pit.write_io(0x43, 0x36);
    pit.write_io(0x40, 0x9B);
    pit.write_io(0x40, 0x0E); // divisor 0x0E9B = 3739
    let mut rise_ticks = Vec::new();
    for tick in 0u64..40_000 {
        lines.clear();
        pit.tick(&pit_clock(1), &mut lines);
        if lines.contains(&LineEvent::RaiseIrq(IRQ_PIT0)) {
            rise_ticks.push(tick);
        }
    }
    assert!(rise_ticks.len() >= 9, "got {} edges", rise_ticks.len());
    for pair in rise_ticks.windows(2) {
        // An odd divisor stretches the square wave by one input clock.
        assert_eq!(pair[1] - pair[0], 3740, "square-wave full period");
    }
}

// ---- property 5 via the silence command: the time-constant law ----

fn dsp_reset(emulator: &mut Emulator) {
    emulator.chipset.io_write(0x226, 0x01);
    emulator.chipset.io_write(0x226, 0x00);
    emulator.run_for(30_000);
    assert_eq!(emulator.chipset.io_read(0x22A), Some(0xAA));
}

#[test]
fn sb_time_constant_law() {
    for &tc in &[0u16, 128, 210, 239, 255] {
        let mut emulator = Emulator::new(machine::ibm_at());
        dsp_reset(&mut emulator);
        emulator.chipset.io_write(0x22C, 0x40);
        emulator.chipset.io_write(0x22C, tc as u8);
        // N+1 = 100 silent samples, then an IRQ.
        let samples = 100u64;
        emulator.chipset.io_write(0x22C, 0x80);
        emulator.chipset.io_write(0x22C, (samples - 1) as u8);
        emulator.chipset.io_write(0x22C, 0x00);
        let start = emulator.chipset.total_ns();
        let mut fired_at = None;
        for _ in 0..60_000 {
            emulator.run_for(1_000);
            if emulator.chipset.pic.irr(0) & 0x80 != 0 {
                fired_at = Some(emulator.chipset.total_ns());
                break;
            }
        }
        let fired_at = fired_at.expect("silence block must raise the 8-bit IRQ");
        // sample_rate = 1e6 / (256 - tc), so the block spans this long:
        let expected_ns = samples * (256 - tc as u64) * 1_000;
        let elapsed = fired_at - start;
        let tolerance = expected_ns / 50 + 2_000; // 2% plus slice jitter
        assert!(
            elapsed + tolerance >= expected_ns && elapsed <= expected_ns + tolerance,
            "tc {}: elapsed {} expected {}",
            tc,
            elapsed,
            expected_ns
        );
    }
}

// ---- scenario C: 8-bit single-cycle DMA playback end to end ----

#[test]
fn sb_dma_playback_renders_and_interrupts() {
    let mut emulator = Emulator::new(machine::ibm_at());
    dsp_reset(&mut emulator);
    // Feed four samples through system memory.
    for (offset, &byte) in [0x10u8, 0x40, 0x80, 0xC0].iter().enumerate() {
        emulator.chipset.memory.write(0x1000 + offset as u32, byte);
    }
    // DMA channel 1: single, increment, read memory.
    emulator.chipset.io_write(0x0B, 0x49);
    emulator.chipset.io_write(0x0C, 0x00);
    emulator.chipset.io_write(0x02, 0x00);
    emulator.chipset.io_write(0x02, 0x10);
    emulator.chipset.io_write(0x03, 0x03);
    emulator.chipset.io_write(0x03, 0x00);
    emulator.chipset.io_write(0x83, 0x00);
    emulator.chipset.io_write(0x08, 0x00);
    emulator.chipset.io_write(0x0A, 0x01);
    // Unmute, set the rate and start a 4-byte transfer.
    emulator.chipset.io_write(0x22C, 0xD1);
    emulator.chipset.io_write(0x22C, 0x40);
    emulator.chipset.io_write(0x22C, 0x83);
    emulator.chipset.io_write(0x22C, 0x14);
    emulator.chipset.io_write(0x22C, 0x03);
    emulator.chipset.io_write(0x22C, 0x00);
    let mut saw_irq = false;
    for _ in 0..20_000 {
        emulator.run_for(1_000);
        if emulator.chipset.pic.irr(0) & 0x80 != 0 {
            saw_irq = true;
            break;
        }
    }
    assert!(saw_irq, "transfer end raises IRQ7");
    // The DMA hit terminal count on the fourth byte.
    let status = emulator.chipset.io_read(0x08).unwrap();
    assert_ne!(status & 0x02, 0);
    // Acknowledging through the status port drops the line.
    emulator.chipset.io_read(0x22E);
    emulator.run_for(2_000);
    assert_eq!(emulator.chipset.pic.irr(0) & 0x80, 0);
}

// ---- property 6: ADPCM decode is reference-deterministic ----

#[test]
fn adpcm_stream_is_reproducible() {
    let stream: Vec<u8> = vec![0x80, 0x13, 0x57, 0x9B, 0xDF, 0x24, 0x68, 0xAC];
    let render = |input: &[u8]| -> Vec<(i16, i16)> {
        let mut emulator = Emulator::new(machine::ibm_at());
        let mut reader = emulator.chipset.sb.take_reader().unwrap();
        dsp_reset(&mut emulator);
        for (offset, &byte) in input.iter().enumerate() {
            emulator.chipset.memory.write(0x2000 + offset as u32, byte);
        }
        emulator.chipset.io_write(0x0B, 0x49);
        emulator.chipset.io_write(0x0C, 0x00);
        emulator.chipset.io_write(0x02, 0x00);
        emulator.chipset.io_write(0x02, 0x20);
        emulator.chipset.io_write(0x03, (input.len() - 1) as u8);
        emulator.chipset.io_write(0x03, 0x00);
        emulator.chipset.io_write(0x83, 0x00);
        emulator.chipset.io_write(0x08, 0x00);
        emulator.chipset.io_write(0x0A, 0x01);
        emulator.chipset.io_write(0x22C, 0xD1);
        emulator.chipset.io_write(0x22C, 0x40);
        emulator.chipset.io_write(0x22C, 0x83);
        // 4-bit ADPCM with a leading reference byte, single cycle.
        emulator.chipset.io_write(0x22C, 0x75);
        emulator.chipset.io_write(0x22C, (input.len() - 1) as u8);
        emulator.chipset.io_write(0x22C, 0x00);
        // Long enough for the private output FIFO to migrate into the
        // shared ring the reader drains.
        emulator.run_for(200_000_000);
        (0..64).map(|_| reader.read()).collect()
    };
    let first = render(&stream);
    let second = render(&stream);
    assert_eq!(first, second);
    assert!(first.iter().any(|&sample| sample != (0, 0)), "audio was rendered");
}

// ---- scenario E: LAPIC one-shot timer ----

#[test]
fn lapic_timer_one_shot() {
    let mut emulator = Emulator::new(machine::compaq_deskpro());
    let lapic = 0xFEE0_0000u32;
    emulator.chipset.mem_write32(lapic + 0xF0, 0x1FF); // software enable
    emulator.chipset.mem_write32(lapic + 0x3E0, 0x0B); // divide by 1
    emulator.chipset.mem_write32(lapic + 0x320, 0x20); // one-shot, vector 0x20
    emulator.chipset.mem_write32(lapic + 0x380, 100);
    let mut vectors = Vec::new();
    for _ in 0..1_000 {
        emulator.run_for(1_000);
        emulator.service_interrupts(|vector| vectors.push(vector));
        if !vectors.is_empty() {
            // Retire the delivery so a second one would be visible.
            emulator.chipset.mem_write32(lapic + 0xB0, 0);
        }
    }
    assert_eq!(vectors, vec![0x20], "exactly one timer delivery");
    assert_eq!(emulator.chipset.mem_read32(lapic + 0x390), 0, "counter stopped");
}

#[test]
fn lapic_periodic_timer_reloads() {
    let mut emulator = Emulator::new(machine::compaq_deskpro());
    let lapic = 0xFEE0_0000u32;
    emulator.chipset.mem_write32(lapic + 0xF0, 0x1FF);
    emulator.chipset.mem_write32(lapic + 0x3E0, 0x0B);
    emulator.chipset.mem_write32(lapic + 0x320, 0x20020); // periodic, vector 0x20
    emulator.chipset.mem_write32(lapic + 0x380, 1_000);
    let mut deliveries = 0;
    for _ in 0..2_000 {
        emulator.run_for(1_000);
        emulator.service_interrupts(|_| deliveries += 1);
        emulator.chipset.mem_write32(lapic + 0xB0, 0);
    }
    assert!(deliveries >= 2, "periodic mode keeps firing, got {}", deliveries);
}

// ---- APIC error latching ----

#[test]
fn lapic_illegal_vector_sets_esr() {
    let mut emulator = Emulator::new(machine::compaq_deskpro());
    let lapic = 0xFEE0_0000u32;
    emulator.chipset.mem_write32(lapic + 0xF0, 0x1FF);
    // Self-IPI with an illegal vector below 0x10.
    emulator.chipset.mem_write32(lapic + 0x300, (1 << 18) | 0x05);
    emulator.run_for(10_000);
    // Rearming the ESR surfaces the latched error bits.
    emulator.chipset.mem_write32(lapic + 0x280, 0);
    let esr = emulator.chipset.mem_read32(lapic + 0x280);
    assert_ne!(esr & (1 << 6), 0, "receive illegal vector, esr {:#x}", esr);
}

// ---- scenario F: SAA-1099 tone within a hertz of 440 ----

#[test]
fn gameblaster_renders_440hz() {
    let mut card = GameBlaster::new(false);
    let chip_write = |card: &mut GameBlaster, reg: u8, value: u8| {
        card.write_io(1, reg);
        card.write_io(0, value);
    };
    // (14318180/2/512) << 4 / (511 - 3) = 440.4 Hz on channel 0.
    chip_write(&mut card, 0x08, 3);
    chip_write(&mut card, 0x10, 4);
    chip_write(&mut card, 0x00, 0xFF); // full amplitude both sides
    chip_write(&mut card, 0x14, 0x01); // tone enable channel 0
    chip_write(&mut card, 0x1C, 0x01); // all channels enable
    assert!((card.chips[0].channel_frequency(0) - 440.4).abs() < 0.5);
    // Step the synth one 3.58 MHz sample at a time for 0.2 s and measure
    // the average distance between rising edges of channel 0.
    let clock = ClockTick { ns: 0, mhz14: 4, cpu_cycles: 0 };
    let mut last_level = false;
    let mut rises = Vec::new();
    let total = (BASE_RATE / 5) as u64;
    for tick in 0..total {
        card.tick(&clock);
        let level = card.chips[0].channel_level(0);
        if level && !last_level {
            rises.push(tick);
        }
        last_level = level;
    }
    assert!(rises.len() > 80, "tone is running, {} rises", rises.len());
    let span = (rises[rises.len() - 1] - rises[0]) as f64;
    let periods = (rises.len() - 1) as f64;
    let frequency = BASE_RATE as f64 / (span / periods);
    assert!(
        (frequency - 440.4).abs() < 1.0,
        "measured {:.2} Hz over {} periods",
        frequency,
        periods
    );
}

// ---- port contract: floating Sound Blaster positions ----

#[test]
fn sb_floating_ports_are_unhandled() {
    let mut emulator = Emulator::new(machine::ibm_at());
    assert_eq!(emulator.chipset.io_read(0x220), None);
    assert_eq!(emulator.chipset.io_read(0x222), None);
    assert_eq!(emulator.chipset.io_read(0x224), None);
    // The write-buffer status and data-available ports always answer.
    assert!(emulator.chipset.io_read(0x22C).is_some());
    assert!(emulator.chipset.io_read(0x22E).is_some());
}

// ---- keyboard path ----

#[test]
fn keyboard_scancode_raises_irq1() {
    let mut emulator = Emulator::new(machine::ibm_xt());
    emulator.chipset.io_write(0x20, 0x13); // ICW1: single mode, ICW4 follows
    emulator.chipset.io_write(0x21, 0x08);
    emulator.chipset.io_write(0x21, 0x01);
    emulator.chipset.ppi.key_event(0x1C);
    emulator.run_for(10_000);
    assert!(emulator.chipset.interrupt_pending());
    assert_eq!(emulator.chipset.inta(), 0x08 + 1);
    assert_eq!(emulator.chipset.io_read(0x60), Some(0x1C));
}

// ---- DRAM refresh rides PIT channel 1 ----

#[test]
fn dram_refresh_requests_channel0() {
    let mut emulator = Emulator::new(machine::ibm_xt());
    emulator.chipset.io_write(0x08, 0x00); // enable DMA controller 0
    // Channel 1, rate generator, short period, as the BIOS programs it.
    emulator.chipset.io_write(0x43, 0x54);
    emulator.chipset.io_write(0x41, 18);
    // Channel 0 stays masked, so the request parks on the line.
    emulator.run_for(1_000_000);
    assert!(emulator.chipset.dma.dreq(0), "refresh DREQ pending");
}

// ---- Sound Source on LPT1 ----

#[test]
fn sound_source_fifo_full_via_ports() {
    let mut emulator = Emulator::new(machine::ibm_at());
    // Raw control bit 2 high puts INIT low on the wire: power on.
    emulator.chipset.io_write(0x37A, 0x04);
    for byte in 0..16u8 {
        emulator.chipset.io_write(0x378, byte);
        // Strobe the FIFO clock: device-side bit 3 falls on the second
        // write because the control nibble drives inverted.
        emulator.chipset.io_write(0x37A, 0x04);
        emulator.chipset.io_write(0x37A, 0x0C);
    }
    let status = emulator.chipset.io_read(0x379).unwrap();
    assert_eq!(status & 0x40, 0x40, "full FIFO reads busy on the ACK bit");
}

// ---- WAV capture sink round-trips samples ----

#[test]
fn wav_sink_writes_playable_file() {
    use empc::audio::WavSink;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("speaker.wav");
    {
        let mut sink = WavSink::create(&path, 1, 44_100).unwrap();
        for n in 0..100i16 {
            sink.write_mono(n * 256);
        }
        sink.finish();
    }
    let mut reader = hound::WavReader::open(&path).unwrap();
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 100);
    assert_eq!(samples[1], 256);
}

// ---- MPU-401 reachable at its fixed ports ----

#[test]
fn mpu401_responds_on_bus() {
    let mut emulator = Emulator::new(machine::ibm_at());
    emulator.chipset.io_write(0x331, 0xFF); // reset
    let status = emulator.chipset.io_read(0x331).unwrap();
    assert_eq!(status & 0x80, 0, "ACK waiting");
    assert_eq!(emulator.chipset.io_read(0x330), Some(0xFE));
}
