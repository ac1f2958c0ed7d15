// 8237A DMA controller pair. Controller 0 carries the four 8-bit channels,
// controller 1 the word-addressed channels 4-7 with channel 4 hardwired as
// the cascade input. The transfer engine is the six-state machine
// SI -> S0 -> S1 -> S2 -> S3 -> S4 advanced one state per bus tick.

use crate::devices::ClockTick;
use tracing::trace;

/// Access to everything the engine touches outside its own registers:
/// per-channel device handlers and the linear memory image. Channels
/// without a device report `has_device == false` and are skipped during
/// request sampling; a transfer on such a channel still advances address
/// and count without a bus action.
pub trait DmaPeripherals {
    fn has_device(&self, channel: u8) -> bool;
    /// Live DREQ level of the device on the channel, if it drives one.
    fn dreq(&mut self, channel: u8) -> Option<bool>;
    fn device_read(&mut self, channel: u8) -> Option<u8>;
    fn device_write(&mut self, channel: u8, value: u8) -> bool;
    fn device_read_word(&mut self, _channel: u8) -> Option<u16> {
        None
    }
    fn device_write_word(&mut self, _channel: u8, _value: u16) -> bool {
        false
    }
    fn dack(&mut self, channel: u8);
    fn tc(&mut self, channel: u8);
    /// End-of-process poll; the return value asks for an auto-init reload.
    fn eop(&mut self, _channel: u8) -> bool {
        false
    }
    fn memory_read(&mut self, address: u32) -> u8;
    fn memory_write(&mut self, address: u32, value: u8);
    fn memory_read_word(&mut self, address: u32) -> u16;
    fn memory_write_word(&mut self, address: u32, value: u16);
}

#[derive(Default)]
pub struct DmaChannel {
    pub mode: u8,
    pub current_address: u16,
    pub base_address: u16,
    pub current_count: u16,
    pub base_count: u16,
    pub page: u8,
    page_shifted: u32, // page register preshifted to bit 16
    verify_byte: u8,   // verify transfers park the device data here
    verify_word: u16,
}

impl DmaChannel {
    fn set_page(&mut self, value: u8) {
        self.page = value;
        self.page_shifted = (value as u32) << 16;
    }
    fn transfer_kind(&self) -> u8 {
        (self.mode >> 6) & 3
    }
    fn is_cascade(&self) -> bool {
        (self.mode & 0xC0) == 0xC0
    }
}

#[derive(Default)]
pub struct DmaController {
    pub channels: [DmaChannel; 4],
    pub status: u8,  // TC flags low nibble, live DREQ mirrored on read
    pub dreq: u8,
    pub dack: u8,
    pub command: u8,
    pub mask: u8,    // bit set = channel masked off
    pub request: u8, // software requests, block mode only
    flipflop: bool,
    intermediate: u8,
    extra_storage: [u8; 4], // scratch page bytes the 286 BIOS reads back
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DmaState {
    Si,
    S0,
    S1,
    S2,
    S3,
    S4,
}

pub struct Dma {
    pub controllers: [DmaController; 2],
    state: DmaState,
    active_channel: u8, // 0-7, latched during S0
    active_mode: u8,
    tc_hit: bool,
    wait_state: u8,
    bus_held: bool,
    timing: u64,
    half_cpu_clock: bool, // AT and later pace on half the CPU clock
}

// Page register port offsets (port - 0x80) to channel, nibble-swapped on
// the real board.
const PAGE_CHANNEL: [i8; 8] = [-1, 2, 3, 1, -1, -1, -1, 0];

impl Dma {
    pub fn new(half_cpu_clock: bool) -> Self {
        let mut dma = Dma {
            controllers: [DmaController::default(), DmaController::default()],
            state: DmaState::Si,
            active_channel: 0,
            active_mode: 0,
            tc_hit: false,
            wait_state: 0,
            bus_held: false,
            timing: 0,
            half_cpu_clock,
        };
        for controller in dma.controllers.iter_mut() {
            controller.mask = 0xF;
            controller.command = 0x4; // disabled until programmed
        }
        // Channel 4 couples the controllers and must never be selected as a
        // real channel.
        dma.controllers[1].channels[0].mode = 0xC0;
        dma
    }

    /// Hardware DREQ line input.
    pub fn set_dreq(&mut self, channel: u8, level: bool) {
        let controller = &mut self.controllers[(channel >> 2) as usize];
        let bit = 1 << (channel & 3);
        if level {
            controller.dreq |= bit;
        } else {
            controller.dreq &= !bit;
        }
    }

    pub fn dreq(&self, channel: u8) -> bool {
        self.controllers[(channel >> 2) as usize].dreq & (1 << (channel & 3)) != 0
    }

    /// Data captured by the last verify transfer on a channel.
    pub fn verify_latch(&self, channel: u8) -> (u8, u16) {
        let target = &self.controllers[(channel >> 2) as usize].channels[(channel & 3) as usize];
        (target.verify_byte, target.verify_word)
    }

    fn decode(port: u16) -> Option<(usize, u8)> {
        if port < 0x10 {
            return Some((0, port as u8));
        }
        if (0x80..=0x8F).contains(&port) {
            // Page registers decode separately.
            return Some((if port & 0xF8 == 0x88 { 1 } else { 0 }, port as u8));
        }
        if (0xC0..=0xDE).contains(&port) {
            if port & 1 != 0 {
                return None; // odd second-controller ports are unmapped
            }
            return Some((1, ((port - 0xC0) >> 1) as u8));
        }
        None
    }

    pub fn write_io(&mut self, port: u16, value: u8) -> bool {
        let (index, reg) = match Self::decode(port) {
            Some(decoded) => decoded,
            None => return false,
        };
        if (0x80..=0x8F).contains(&port) {
            return self.write_page(index, (port as u8 - 0x80) & 7, value);
        }
        let controller = &mut self.controllers[index];
        match reg {
            0x00 | 0x02 | 0x04 | 0x06 => {
                let channel = (reg >> 1) as usize;
                let target = &mut controller.channels[channel];
                if controller.flipflop {
                    target.current_address = (target.current_address & 0xFF) | ((value as u16) << 8);
                    target.base_address = (target.base_address & 0xFF) | ((value as u16) << 8);
                } else {
                    target.current_address = (target.current_address & 0xFF00) | value as u16;
                    target.base_address = (target.base_address & 0xFF00) | value as u16;
                }
                controller.flipflop = !controller.flipflop;
            }
            0x01 | 0x03 | 0x05 | 0x07 => {
                let channel = (reg >> 1) as usize;
                let target = &mut controller.channels[channel];
                if controller.flipflop {
                    target.current_count = (target.current_count & 0xFF) | ((value as u16) << 8);
                    target.base_count = (target.base_count & 0xFF) | ((value as u16) << 8);
                } else {
                    target.current_count = (target.current_count & 0xFF00) | value as u16;
                    target.base_count = (target.base_count & 0xFF00) | value as u16;
                }
                controller.flipflop = !controller.flipflop;
            }
            0x08 => controller.command = value,
            0x09 => {
                // Software requests are honoured in block mode only.
                let channel = (value & 3) as usize;
                if controller.channels[channel].transfer_kind() == 2 {
                    controller.request &= !(1 << channel);
                    controller.request |= ((value & 4) >> 2) << channel;
                }
            }
            0x0A => {
                controller.mask &= !(1 << (value & 3));
                controller.mask |= ((value & 4) >> 2) << (value & 3);
            }
            0x0B => controller.channels[(value & 3) as usize].mode = value,
            0x0C => controller.flipflop = false,
            0x0D => {
                // Master reset.
                controller.flipflop = false;
                controller.status = 0;
                controller.mask |= 0xF;
            }
            0x0E => controller.mask &= !0xF,
            0x0F => controller.mask = value,
            _ => return false,
        }
        trace!(port, value, "dma write");
        true
    }

    fn write_page(&mut self, index: usize, reg: u8, value: u8) -> bool {
        let controller = &mut self.controllers[index];
        match PAGE_CHANNEL[(reg & 7) as usize] {
            -1 => match reg & 7 {
                0 => controller.extra_storage[3] = value,
                4..=6 => controller.extra_storage[(reg & 7) as usize - 4] = value,
                _ => return false,
            },
            channel => controller.channels[channel as usize].set_page(value),
        }
        true
    }

    pub fn read_io(&mut self, port: u16) -> Option<u8> {
        let (index, reg) = Self::decode(port)?;
        if (0x80..=0x8F).contains(&port) {
            return self.read_page(index, (port as u8 - 0x80) & 7);
        }
        let controller = &mut self.controllers[index];
        match reg {
            // Not documented as readable, but the XT BIOS reads these back.
            0x00 | 0x02 | 0x04 | 0x06 => {
                let address = controller.channels[(reg >> 1) as usize].current_address;
                let result = if controller.flipflop { (address >> 8) as u8 } else { address as u8 };
                controller.flipflop = !controller.flipflop;
                Some(result)
            }
            0x01 | 0x03 | 0x05 | 0x07 => {
                let count = controller.channels[(reg >> 1) as usize].current_count;
                let result = if controller.flipflop { (count >> 8) as u8 } else { count as u8 };
                controller.flipflop = !controller.flipflop;
                Some(result)
            }
            0x08 => {
                let result = (controller.status & 0xF) | (controller.dreq << 4);
                controller.status &= !0xF; // TC bits clear on read
                Some(result)
            }
            0x0D => Some(controller.intermediate),
            0x0F => Some(controller.mask),
            _ => None,
        }
    }

    fn read_page(&mut self, index: usize, reg: u8) -> Option<u8> {
        let controller = &self.controllers[index];
        match PAGE_CHANNEL[(reg & 7) as usize] {
            -1 => match reg & 7 {
                0 => Some(controller.extra_storage[3]),
                4..=6 => Some(controller.extra_storage[(reg & 7) as usize - 4]),
                _ => None,
            },
            channel => Some(controller.channels[channel as usize].page),
        }
    }

    fn controller_enabled(&self, index: usize) -> bool {
        self.controllers[index].command & 0x4 == 0
    }

    fn sample_dreq(&mut self, bus: &mut dyn DmaPeripherals) {
        for channel in 0..8u8 {
            let index = (channel >> 2) as usize;
            if !self.controller_enabled(index) {
                continue;
            }
            let slot = (channel & 3) as usize;
            if self.controllers[index].channels[slot].is_cascade() || !bus.has_device(channel) {
                continue;
            }
            if let Some(level) = bus.dreq(channel) {
                self.set_dreq(channel, level);
            }
        }
    }

    /// Fixed linear priority scan: channel 0 of controller 0 wins.
    fn find_runnable(&self) -> Option<u8> {
        for channel in 0..8u8 {
            let index = (channel >> 2) as usize;
            let controller = &self.controllers[index];
            let slot = (channel & 3) as usize;
            let bit = 1u8 << slot;
            let unmasked = controller.mask & bit == 0;
            let software_request = controller.request & bit != 0;
            let requested = (controller.dreq & bit != 0 && unmasked) || software_request;
            if !requested {
                continue;
            }
            let runnable = match controller.channels[slot].transfer_kind() {
                0 => controller.dreq & bit != 0,
                1 | 2 => unmasked && (controller.dack | controller.dreq) & bit != 0,
                _ => false, // cascade is never selected
            };
            if runnable || software_request {
                return Some(channel);
            }
        }
        None
    }

    pub fn is_idle(&self) -> bool {
        self.state == DmaState::Si
    }

    pub fn tick(&mut self, clock: &ClockTick, bus: &mut dyn DmaPeripherals) {
        self.timing += if self.half_cpu_clock { clock.cpu_cycles } else { clock.mhz14 };
        let period = if self.half_cpu_clock { 2 } else { 3 };
        let mut idle = false;
        while self.timing >= period {
            self.timing -= period;
            if idle {
                continue;
            }
            let was_si = self.state == DmaState::Si;
            self.step(bus);
            // An SI tick that stays in SI means no channel wants the bus;
            // burn the rest of the slice without rescanning.
            idle = was_si && self.state == DmaState::Si;
        }
    }

    fn step(&mut self, bus: &mut dyn DmaPeripherals) {
        match self.state {
            DmaState::Si => self.state_si(bus),
            DmaState::S0 => self.state_s0(),
            DmaState::S1 => self.state = DmaState::S2,
            DmaState::S2 => self.state_s2(bus),
            DmaState::S3 => self.state_s3(bus),
            DmaState::S4 => self.state_s4(bus),
        }
    }

    fn state_si(&mut self, bus: &mut dyn DmaPeripherals) {
        self.sample_dreq(bus);
        if self.find_runnable().is_some() {
            self.state = DmaState::S0;
        }
    }

    fn state_s0(&mut self) {
        if !self.bus_held {
            // Bus granted; one wait state lets the imaginary CPU reach a
            // safe point before the transfer starts.
            self.bus_held = true;
            self.wait_state = 1;
            return;
        }
        if self.wait_state > 0 {
            self.wait_state -= 1;
            return;
        }
        match self.find_runnable() {
            Some(channel) => {
                self.active_channel = channel;
                self.active_mode =
                    self.controllers[(channel >> 2) as usize].channels[(channel & 3) as usize].mode;
                self.state = DmaState::S1;
            }
            None => {
                self.bus_held = false;
                self.state = DmaState::Si;
            }
        }
    }

    fn state_s2(&mut self, bus: &mut dyn DmaPeripherals) {
        let channel = self.active_channel;
        bus.dack(channel);
        // Single and block transfers latch the DACK bit until completion.
        if matches!((self.active_mode >> 6) & 3, 1 | 2) {
            self.controllers[(channel >> 2) as usize].dack |= 1 << (channel & 3);
        }
        self.state = DmaState::S3;
    }

    fn state_s3(&mut self, bus: &mut dyn DmaPeripherals) {
        let channel = self.active_channel;
        let index = (channel >> 2) as usize;
        let slot = (channel & 3) as usize;
        let bit = 1u8 << slot;
        let mode = self.active_mode;

        // Second-controller channels are word addressed: channel address
        // shifted up one and OR'd with the page to form the bus address.
        let address = {
            let target = &self.controllers[index].channels[slot];
            let base = if index == 1 {
                ((target.current_address as u32) << 1) & 0xFFFF
            } else {
                target.current_address as u32
            };
            base | target.page_shifted
        };

        {
            let target = &mut self.controllers[index].channels[slot];
            if mode & 0x20 != 0 {
                target.current_address = target.current_address.wrapping_sub(1);
            } else {
                target.current_address = target.current_address.wrapping_add(1);
            }
            target.current_count = target.current_count.wrapping_sub(1);
            self.tc_hit = target.current_count == 0xFFFF;
        }

        if self.tc_hit {
            self.controllers[index].request &= !bit;
            bus.tc(channel);
            self.controllers[index].status |= bit;
        }

        match mode & 0xC {
            0 => {
                // Verify exercises the device cycle without touching memory.
                if index == 1 {
                    if let Some(word) = bus.device_read_word(channel) {
                        self.controllers[index].channels[slot].verify_word = word;
                    }
                } else if let Some(byte) = bus.device_read(channel) {
                    self.controllers[index].channels[slot].verify_byte = byte;
                }
            }
            4 => {
                if index == 1 {
                    if let Some(word) = bus.device_read_word(channel) {
                        bus.memory_write_word(address, word);
                    }
                } else if let Some(byte) = bus.device_read(channel) {
                    bus.memory_write(address, byte);
                }
            }
            8 => {
                if index == 1 {
                    let word = bus.memory_read_word(address);
                    bus.device_write_word(channel, word);
                } else {
                    let byte = bus.memory_read(address);
                    bus.device_write(channel, byte);
                }
            }
            _ => {} // 0xC is invalid, treated as a NOP cycle
        }
        self.state = DmaState::S4;
    }

    fn state_s4(&mut self, bus: &mut dyn DmaPeripherals) {
        let channel = self.active_channel;
        let index = (channel >> 2) as usize;
        let slot = (channel & 3) as usize;
        let bit = 1u8 << slot;
        let mode = self.active_mode;
        let auto_init = mode & 0x10 != 0;

        match (mode >> 6) & 3 {
            0 => {
                // Demand transfers keep the channel armed; EOP may still ask
                // for a reload mid-stream.
                if self.tc_hit {
                    self.controllers[index].dack &= !bit;
                }
                if auto_init && bus.eop(channel) {
                    self.autoinit(index, slot);
                }
            }
            1 | 2 => {
                if (mode >> 6) & 3 == 1 {
                    self.controllers[index].dack &= !bit;
                }
                if self.tc_hit {
                    self.controllers[index].dack &= !bit;
                    bus.eop(channel);
                    if auto_init {
                        self.autoinit(index, slot);
                    } else {
                        // Terminal count parks the channel behind its mask
                        // until software reprograms it.
                        self.controllers[index].mask |= bit;
                    }
                } else if (mode >> 6) & 3 == 2 && bus.eop(channel) {
                    self.autoinit(index, slot);
                }
            }
            _ => {}
        }
        self.tc_hit = false;
        self.bus_held = false;
        self.state = DmaState::Si;
        // Re-enter the scan immediately so back-to-back requests chain
        // without an idle bus cycle.
        self.state_si(bus);
        if self.state == DmaState::S0 {
            self.state_s0();
        }
    }

    fn autoinit(&mut self, index: usize, slot: usize) {
        let target = &mut self.controllers[index].channels[slot];
        target.current_address = target.base_address;
        target.current_count = target.base_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoDevices;
    impl DmaPeripherals for NoDevices {
        fn has_device(&self, _channel: u8) -> bool {
            false
        }
        fn dreq(&mut self, _channel: u8) -> Option<bool> {
            None
        }
        fn device_read(&mut self, _channel: u8) -> Option<u8> {
            None
        }
        fn device_write(&mut self, _channel: u8, _value: u8) -> bool {
            false
        }
        fn dack(&mut self, _channel: u8) {}
        fn tc(&mut self, _channel: u8) {}
        fn memory_read(&mut self, _address: u32) -> u8 {
            0xFF
        }
        fn memory_write(&mut self, _address: u32, _value: u8) {}
        fn memory_read_word(&mut self, _address: u32) -> u16 {
            0xFFFF
        }
        fn memory_write_word(&mut self, _address: u32, _value: u16) {}
    }

    #[test]
    fn page_registers_map_nibble_swapped() {
        let mut dma = Dma::new(false);
        assert!(dma.write_io(0x87, 0x12)); // channel 0
        assert!(dma.write_io(0x83, 0x34)); // channel 1
        assert!(dma.write_io(0x81, 0x56)); // channel 2
        assert!(dma.write_io(0x82, 0x78)); // channel 3
        assert_eq!(dma.controllers[0].channels[0].page, 0x12);
        assert_eq!(dma.controllers[0].channels[1].page, 0x34);
        assert_eq!(dma.controllers[0].channels[2].page, 0x56);
        assert_eq!(dma.controllers[0].channels[3].page, 0x78);
        assert_eq!(dma.read_io(0x83), Some(0x34));
    }

    #[test]
    fn flipflop_orders_address_bytes() {
        let mut dma = Dma::new(false);
        dma.write_io(0x0C, 0);
        dma.write_io(0x02, 0x34);
        dma.write_io(0x02, 0x12);
        assert_eq!(dma.controllers[0].channels[1].current_address, 0x1234);
        assert_eq!(dma.read_io(0x02), Some(0x34));
        assert_eq!(dma.read_io(0x02), Some(0x12));
    }

    #[test]
    fn masked_channel_never_runs() {
        let mut dma = Dma::new(false);
        dma.write_io(0x08, 0); // enable controller
        dma.write_io(0x0B, 0x49); // single mode, channel 1
        dma.set_dreq(1, true);
        // Channel 1 still masked from reset.
        let clock = ClockTick { ns: 10_000, mhz14: 143, cpu_cycles: 47 };
        dma.tick(&clock, &mut NoDevices);
        assert!(dma.is_idle());
    }

    #[test]
    fn second_controller_ports_are_word_strided() {
        let mut dma = Dma::new(false);
        assert!(dma.write_io(0xC4, 0x77)); // channel 6 address low
        assert!(!dma.write_io(0xC5, 0x77)); // odd alias floats
        assert_eq!(dma.controllers[1].channels[2].current_address & 0xFF, 0x77);
    }
}
