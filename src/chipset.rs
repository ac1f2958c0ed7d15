// The chipset owns every device and plays bus: ranged port dispatch, the
// memory mapped APIC window, hardware line routing between devices and the
// fixed tick order PIT, DMA, interrupt controllers, audio generators.

use crate::apic::Apic;
use crate::audio::DoubleBufferReader;
use crate::devices::{IrqEvent, LineEvent, MasterClock, Signal, IRQ_SOUNDBLASTER};
use crate::dma::{Dma, DmaPeripherals};
use crate::gameblaster::GameBlaster;
use crate::machine::MachineConfig;
use crate::memory::Memory;
use crate::mpu401::Mpu401;
use crate::parallel::Parallel;
use crate::pic::Pic;
use crate::pit::Pit;
use crate::ppi::Ppi;
use crate::soundblaster::SoundBlaster;
use crate::ssource::SoundSource;
use tracing::trace;

/// DRAM refresh request on DMA channel 0, clocked by PIT channel 1 rising
/// edges. DACK drops the request; there is no terminal count handling.
struct DramRefresh {
    line: bool,
    pending: bool,
}

impl DramRefresh {
    fn new() -> Self {
        DramRefresh { line: false, pending: false }
    }
    fn pit1_edge(&mut self, level: bool) {
        if level && !self.line {
            self.pending = true;
        }
        self.line = level;
    }
    fn dack(&mut self) {
        self.pending = false;
    }
    fn dreq(&self) -> bool {
        self.pending
    }
}

/// Legacy XT expansion unit probe latches at 0x210-0x217.
struct XtExpansionUnit {
    expansion_pending: bool,
    expansion_address: u32,
    receiver_pending: bool,
    receiver_address: u32,
    receiver_data: u32,
    receiver_flipflop: bool,
}

impl XtExpansionUnit {
    fn new() -> Self {
        XtExpansionUnit {
            expansion_pending: false,
            expansion_address: 0,
            receiver_pending: false,
            receiver_address: 0,
            receiver_data: 0,
            receiver_flipflop: false,
        }
    }
    fn write_io(&mut self, port: u16, value: u8) -> bool {
        match port {
            0x210 => {
                self.expansion_pending = true;
                true
            }
            // Clear-wait/test latch and the enable register take the write
            // without further effect here.
            0x211 | 0x213 => true,
            0x214 => {
                self.receiver_pending = true;
                true
            }
            _ => false,
        }
    }
    fn read_io(&mut self, port: u16) -> Option<u8> {
        match port {
            0x210 => Some(if self.expansion_pending { 0x00 } else { 0xFF }),
            0x211 => Some((self.expansion_address >> 8) as u8),
            0x212 => Some(self.expansion_address as u8),
            0x214 => Some(self.receiver_data as u8),
            0x215 => {
                let shift = (self.receiver_flipflop as u32) << 3;
                self.receiver_flipflop = !self.receiver_flipflop;
                Some((self.receiver_address >> shift) as u8)
            }
            _ => None,
        }
    }
    /// Bus snoop for the pending probe latches.
    fn latch_bus(&mut self, address: u32, data: u32) {
        if self.expansion_pending {
            self.expansion_pending = false;
            self.expansion_address = address;
        }
        if self.receiver_pending {
            self.receiver_pending = false;
            self.receiver_address = address;
            self.receiver_data = data;
        }
    }
}

struct DmaClients<'a> {
    memory: &'a mut Memory,
    sb: &'a mut SoundBlaster,
    dram: &'a mut DramRefresh,
    xt_expansion: &'a mut XtExpansionUnit,
}

impl<'a> DmaPeripherals for DmaClients<'a> {
    fn has_device(&self, channel: u8) -> bool {
        matches!(channel, 0 | 1)
    }
    fn dreq(&mut self, channel: u8) -> Option<bool> {
        match channel {
            0 => Some(self.dram.dreq()),
            1 => Some(self.sb.dreq_level()),
            _ => None,
        }
    }
    fn device_read(&mut self, channel: u8) -> Option<u8> {
        match channel {
            1 => Some(self.sb.dma_read()),
            _ => None,
        }
    }
    fn device_write(&mut self, channel: u8, value: u8) -> bool {
        match channel {
            1 => {
                self.sb.dma_write(value);
                true
            }
            _ => false,
        }
    }
    fn dack(&mut self, channel: u8) {
        match channel {
            0 => self.dram.dack(),
            1 => self.sb.dack(),
            _ => {}
        }
    }
    fn tc(&mut self, channel: u8) {
        if channel == 1 {
            self.sb.tc();
        }
    }
    fn eop(&mut self, channel: u8) -> bool {
        if channel == 1 {
            self.sb.eop()
        } else {
            false
        }
    }
    fn memory_read(&mut self, address: u32) -> u8 {
        let value = self.memory.read(address);
        self.xt_expansion.latch_bus(address, value as u32);
        value
    }
    fn memory_write(&mut self, address: u32, value: u8) {
        self.xt_expansion.latch_bus(address, value as u32);
        self.memory.write(address, value);
    }
    fn memory_read_word(&mut self, address: u32) -> u16 {
        let value = self.memory.read_word(address);
        self.xt_expansion.latch_bus(address, value as u32);
        value
    }
    fn memory_write_word(&mut self, address: u32, value: u16) {
        self.xt_expansion.latch_bus(address, value as u32);
        self.memory.write_word(address, value);
    }
}

pub struct Chipset {
    pub config: MachineConfig,
    pub memory: Memory,
    pub dma: Dma,
    pub pic: Pic,
    pub apic: Option<Apic>,
    pub pit: Pit,
    pub ppi: Ppi,
    pub parallel: Parallel,
    pub sb: SoundBlaster,
    pub gameblaster: GameBlaster,
    pub mpu: Mpu401,
    clock: MasterClock,
    dram: DramRefresh,
    xt_expansion: XtExpansionUnit,
    lines: Vec<LineEvent>,
    irq_events: Vec<IrqEvent>,
    apic_lines: Vec<(u8, bool)>,
    pit1_edges: Vec<bool>,
    failsafe_edges: Vec<bool>,
    ssource_reader: Option<DoubleBufferReader<i16>>,
    covox_reader: Option<DoubleBufferReader<(i16, i16)>>,
}

impl Chipset {
    pub fn new(config: MachineConfig) -> Self {
        let mut parallel = Parallel::new(config.parallel_ports);
        let mut ssource = SoundSource::new();
        let ssource_reader = ssource.take_ssource_reader();
        let covox_reader = ssource.take_covox_reader();
        if config.parallel_ports > 0 {
            parallel.attach(0, Box::new(ssource));
        }
        Chipset {
            memory: Memory::new(),
            dma: Dma::new(!config.is_xt),
            pic: Pic::new(config.has_slave_pic),
            apic: if config.apic {
                let mut apic = Apic::new(config.num_cpus);
                apic.enable_ioapic(true);
                Some(apic)
            } else {
                None
            },
            pit: Pit::new(config.six_channel_pit, config.enable_speaker),
            ppi: Ppi::new(config.is_xt),
            parallel,
            sb: SoundBlaster::new(config.sb_version),
            gameblaster: GameBlaster::new(config.gb_sb_compatible),
            mpu: Mpu401::new(),
            clock: MasterClock::new(config.cpu_hz),
            dram: DramRefresh::new(),
            xt_expansion: XtExpansionUnit::new(),
            lines: Vec::new(),
            irq_events: Vec::new(),
            apic_lines: Vec::new(),
            pit1_edges: Vec::new(),
            failsafe_edges: Vec::new(),
            ssource_reader,
            covox_reader,
            config,
        }
    }

    pub fn take_ssource_reader(&mut self) -> Option<DoubleBufferReader<i16>> {
        self.ssource_reader.take()
    }

    pub fn take_covox_reader(&mut self) -> Option<DoubleBufferReader<(i16, i16)>> {
        self.covox_reader.take()
    }

    // ---- port I/O ----

    pub fn io_read(&mut self, port: u16) -> Option<u8> {
        let result = self.io_read_inner(port);
        trace!(port, value = ?result, "in");
        result
    }

    fn io_read_inner(&mut self, port: u16) -> Option<u8> {
        if let Some(value) = self.dma.read_io(port) {
            return Some(value);
        }
        match port {
            0x20 | 0x21 | 0x22 | 0x23 => return self.pic.read_io(port),
            0xA0 | 0xA1 if !self.config.is_xt => return self.pic.read_io(port),
            0x40..=0x43 | 0x48..=0x4B => {
                if let Some(value) = self.pit.read_io(port) {
                    return Some(value);
                }
            }
            0x61 => return Some(self.ppi.port61_bits() | self.pit.speaker_port_bits()),
            0x62 if self.config.is_xt => {
                let switches = self.ppi.read_io(port)?;
                return Some(switches | self.pit.port62_bits());
            }
            _ => {}
        }
        if let Some(value) = self.ppi.read_io(port) {
            return Some(value);
        }
        if (0x210..=0x217).contains(&port) {
            if let Some(value) = self.xt_expansion.read_io(port) {
                return Some(value);
            }
        }
        if port & !0xF == self.config.gb_base {
            if let Some(value) = self.gameblaster.read_io(port & 0xF) {
                return Some(value);
            }
        }
        if port & !0xF == self.config.sb_base {
            if let Some(value) = self.sb.read_io(port & 0xF) {
                return Some(value);
            }
        }
        if let Some(value) = self.mpu.read_io(port) {
            return Some(value);
        }
        if let Some(value) = self.parallel.read_io(port) {
            return Some(value);
        }
        None
    }

    pub fn io_write(&mut self, port: u16, value: u8) -> Signal {
        trace!(port, value, "out");
        let mut signal = Signal::NoOp;
        let mut handled = self.dma.write_io(port, value);
        match port {
            0x20 | 0x21 | 0x22 | 0x23 => handled |= self.pic.write_io(port, value),
            0xA0 | 0xA1 if !self.config.is_xt => handled |= self.pic.write_io(port, value),
            0x40..=0x43 | 0x48..=0x4B => handled |= self.pit.write_io(port, value),
            0x61 => {
                self.pit.write_speaker_port(value);
                self.ppi.write_port61(value);
                handled = true;
            }
            _ => {}
        }
        if !handled || port == 0x80 || port == 0x84 {
            // Ports 0x80/0x84 double as the POST diagnostics latch next to
            // the DMA scratch register.
            if let Some(ppi_signal) = self.ppi.write_io(port, value) {
                signal.add(&ppi_signal);
                handled = true;
            }
        }
        if !handled && (0x210..=0x217).contains(&port) {
            handled = self.xt_expansion.write_io(port, value);
        }
        if !handled && port & !0xF == self.config.gb_base {
            handled = self.gameblaster.write_io(port & 0xF, value);
        }
        if !handled && port & !0xF == self.config.sb_base {
            handled = self.sb.write_io(port & 0xF, value);
        }
        if !handled {
            handled = self.mpu.write_io(port, value);
        }
        if !handled {
            handled = self.parallel.write_io(port, value);
        }
        if !handled {
            trace!(port, value, "unmapped out");
        }
        self.route_device_lines();
        if signal == Signal::NoOp && handled {
            signal = Signal::Ok;
        }
        signal
    }

    // ---- memory mapped I/O ----

    pub fn mem_read32(&mut self, address: u32) -> u32 {
        if let Some(apic) = self.apic.as_mut() {
            if apic.owns(address) {
                return apic.mmio_read32(address).unwrap_or(0);
            }
        }
        u32::from_le_bytes([
            self.memory.read(address),
            self.memory.read(address.wrapping_add(1)),
            self.memory.read(address.wrapping_add(2)),
            self.memory.read(address.wrapping_add(3)),
        ])
    }

    pub fn mem_write32(&mut self, address: u32, value: u32) {
        if let Some(apic) = self.apic.as_mut() {
            if apic.owns(address) {
                apic.mmio_write32(address, value);
                return;
            }
        }
        for (offset, byte) in value.to_le_bytes().iter().enumerate() {
            self.memory.write(address.wrapping_add(offset as u32), *byte);
        }
    }

    pub fn mem_read8(&mut self, address: u32) -> u8 {
        if let Some(apic) = self.apic.as_mut() {
            if apic.owns(address) {
                let dword = apic.mmio_read32(address & !3).unwrap_or(0);
                return (dword >> ((address & 3) * 8)) as u8;
            }
        }
        self.memory.read(address)
    }

    pub fn mem_write8(&mut self, address: u32, value: u8) {
        if let Some(apic) = self.apic.as_mut() {
            if apic.owns(address) {
                let aligned = address & !3;
                let shift = (address & 3) * 8;
                let dword = apic.mmio_read32(aligned).unwrap_or(0);
                let merged = (dword & !(0xFFu32 << shift)) | ((value as u32) << shift);
                apic.mmio_write32(aligned, merged);
                return;
            }
        }
        self.memory.write(address, value);
    }

    // ---- line routing ----

    fn route_device_lines(&mut self) {
        self.sb.drain_lines(&mut self.lines);
        self.mpu.drain_lines(&mut self.lines);
        self.apply_lines();
    }

    fn apply_lines(&mut self) {
        let mut lines = std::mem::replace(&mut self.lines, Vec::new());
        for event in lines.drain(..) {
            match event {
                LineEvent::RaiseIrq(line) => self.pic.raise_irq(line),
                LineEvent::LowerIrq(line) | LineEvent::AckIrq(line) => self.pic.lower_irq(line),
                LineEvent::Dreq { channel, level } => self.dma.set_dreq(channel, level),
            }
        }
        self.lines = lines;
        self.pic.acknowledge_raises();
        let mut events = std::mem::replace(&mut self.irq_events, Vec::new());
        self.pic.drain_events(&mut events);
        for event in events.drain(..) {
            if let IrqEvent::Accepted(line) = event {
                if line == IRQ_SOUNDBLASTER {
                    self.sb.irq_accepted();
                }
            }
        }
        self.irq_events = events;
        if self.apic.is_some() {
            self.pic.intr_raw();
            self.pic.drain_apic_lines(&mut self.apic_lines);
            let apic = self.apic.as_mut().unwrap();
            for (irq, level) in self.apic_lines.drain(..) {
                apic.set_line(irq, level);
            }
        } else {
            self.pic.drain_apic_lines(&mut self.apic_lines);
            self.apic_lines.clear();
        }
    }

    // ---- interrupt surface towards the imaginary CPU ----

    pub fn interrupt_pending(&mut self) -> bool {
        if let Some(apic) = self.apic.as_mut() {
            if apic.interrupt_pending(0, &mut self.pic) {
                return true;
            }
        }
        self.pic.intr()
    }

    /// INTA cycle: the APIC fabric answers first, the legacy pair second.
    pub fn inta(&mut self) -> u8 {
        if let Some(apic) = self.apic.as_mut() {
            if apic.interrupt_pending(0, &mut self.pic) {
                if let Some(vector) = apic.take_vector(0) {
                    return vector;
                }
            }
        }
        let vector = self.pic.inta();
        self.apply_lines();
        vector
    }

    // ---- scheduler ----

    /// Advance emulated time. Device order per cycle: PIT, DMA, interrupt
    /// controllers, audio generators.
    pub fn tick(&mut self, ns: u64) -> Signal {
        let clock = self.clock.advance(ns);

        // 1. PIT consumes input clocks and schedules IRQ0 edges.
        self.pit.tick(&clock, &mut self.lines);
        let mut edges = std::mem::replace(&mut self.pit1_edges, Vec::new());
        self.pit.drain_pit1_edges(&mut edges);
        for level in edges.drain(..) {
            self.dram.pit1_edge(level);
        }
        self.pit1_edges = edges;
        let mut failsafe = std::mem::replace(&mut self.failsafe_edges, Vec::new());
        self.pit.drain_failsafe_edges(&mut failsafe);
        let had_failsafe = !failsafe.is_empty();
        failsafe.clear();
        self.failsafe_edges = failsafe;
        if had_failsafe {
            self.ppi.failsafe_edge();
        }
        if self.ppi.service_nmi() {
            if let Some(apic) = self.apic.as_mut() {
                apic.nmi(0);
            }
        }

        // 2. DMA may take the bus from the CPU.
        {
            let Chipset {
                ref mut dma,
                ref mut memory,
                ref mut sb,
                ref mut dram,
                ref mut xt_expansion,
                ..
            } = *self;
            let mut clients = DmaClients { memory, sb, dram, xt_expansion };
            dma.tick(&clock, &mut clients);
        }
        self.route_device_lines();

        // 3. Interrupt controllers fold edges and poll the APIC fabric.
        self.ppi.tick(&mut self.lines);
        self.parallel.tick(&clock, &mut self.lines);
        self.apply_lines();
        if let Some(apic) = self.apic.as_mut() {
            apic.tick(&clock);
            apic.poll(&mut self.pic);
        }

        // 4. Audio generators render the elapsed samples.
        self.sb.tick(&clock);
        self.gameblaster.tick(&clock);
        self.route_device_lines();

        Signal::Ok
    }

    pub fn total_ns(&self) -> u64 {
        self.clock.total_ns
    }
}
