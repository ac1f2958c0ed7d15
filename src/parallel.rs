// Parallel port controller. Each LPT slot carries an optional attached
// device behind the ParallelDevice capability; the controller owns the
// line inversions (ACK and BUSY read back inverted, INIT drives inverted)
// and the ACK-edge interrupt plumbing.

use crate::devices::{ClockTick, IrqLine, LineEvent, NS_PER_SEC};
use tracing::trace;

/// A peripheral hanging off a parallel port. Control nibbles arrive with
/// the INIT inversion already applied.
pub trait ParallelDevice {
    fn data_out(&mut self, value: u8);
    fn control_out(&mut self, control: u8);
    fn control_in(&mut self) -> u8;
    fn status(&mut self) -> u8;
    fn tick(&mut self, _clock: &ClockTick) {}
}

struct ParallelPort {
    device: Option<Box<dyn ParallelDevice>>,
    output_data: u8,
    control_data: u8,
    irq_enabled: bool,
    irq_raised: u8, // bit 0 request, bit 1 delivered
    status_register: u8,
}

impl ParallelPort {
    fn new() -> Self {
        ParallelPort {
            device: None,
            output_data: 0,
            control_data: 0,
            irq_enabled: false,
            irq_raised: 0,
            status_register: 0xC0, // floating bus before a device answers
        }
    }
}

// Port slots to their ISA interrupt lines: LPT1 IRQ7, LPT2 IRQ6 shared
// slot 1, LPT3 IRQ5.
const PORT_IRQS: [IrqLine; 3] = [IrqLine(0x07), IrqLine(0x16), IrqLine(0x05)];

pub struct Parallel {
    ports: Vec<ParallelPort>,
    timing: u64,
    // Status lines resample at printer-port speed, 150 kbit/s.
    period_ns: u64,
    pending: Vec<LineEvent>,
}

impl Parallel {
    pub fn new(num_ports: usize) -> Self {
        let mut ports = Vec::new();
        for _ in 0..num_ports.min(3) {
            ports.push(ParallelPort::new());
        }
        Parallel { ports, timing: 0, period_ns: NS_PER_SEC / 150_000, pending: Vec::new() }
    }

    pub fn attach(&mut self, slot: usize, mut device: Box<dyn ParallelDevice>) {
        // The device sees the idle control lines before any software runs.
        device.control_out(0 ^ 0xF);
        self.ports[slot].device = Some(device);
    }

    fn decode(&self, port: u16) -> Option<(usize, u16)> {
        let slot = match port & !3 {
            0x378 => 0,
            0x278 => 1,
            0x3BC => 2,
            _ => return None,
        };
        if slot >= self.ports.len() {
            return None;
        }
        Some((slot, port & 3))
    }

    pub fn write_io(&mut self, port: u16, value: u8) -> bool {
        let (slot, offset) = match self.decode(port) {
            Some(decoded) => decoded,
            None => return false,
        };
        match offset {
            0 => {
                trace!(slot, value, "lpt data");
                if let Some(device) = self.ports[slot].device.as_mut() {
                    device.data_out(value);
                }
                self.ports[slot].output_data = value;
                true
            }
            2 => {
                if let Some(device) = self.ports[slot].device.as_mut() {
                    // INIT is active low on the wire.
                    device.control_out((value ^ 0xF) & 0xF);
                }
                self.update_status(slot);
                self.ports[slot].control_data = value & 0x30;
                self.ports[slot].irq_enabled = value & 0x10 != 0;
                true
            }
            _ => false,
        }
    }

    pub fn read_io(&mut self, port: u16) -> Option<u8> {
        let (slot, offset) = self.decode(port)?;
        match offset {
            0 => Some(self.ports[slot].output_data),
            1 => {
                let mut result = self.ports[slot].status_register;
                // Bit 2 reads low once an interrupt occurred.
                result &= !4;
                result |= ((!self.ports[slot].irq_raised) & 2) << 1;
                Some(result)
            }
            2 => {
                let mut result = 0;
                if let Some(device) = self.ports[slot].device.as_mut() {
                    result = (device.control_in() ^ 0xF) & 0xF;
                }
                Some(result | self.ports[slot].control_data)
            }
            _ => None,
        }
    }

    fn update_status(&mut self, slot: usize) {
        let fresh = match self.ports[slot].device.as_mut() {
            // ACK and BUSY are inverted between connector and register.
            Some(device) => device.status() ^ 0xC0,
            None => 0xC0,
        };
        let old = self.ports[slot].status_register;
        let ack_dropped = (fresh ^ old) & old & 0x40 != 0;
        let ack_rose = (fresh ^ old) & fresh & 0x40 != 0;
        if ack_dropped && self.ports[slot].irq_enabled {
            self.ports[slot].irq_raised |= 1;
        } else if ack_rose || (!self.ports[slot].irq_enabled && self.ports[slot].irq_raised != 0) {
            if self.ports[slot].irq_raised & 2 != 0 {
                self.pending.push(LineEvent::LowerIrq(PORT_IRQS[slot]));
            }
            self.ports[slot].irq_raised = 0;
        }
        self.ports[slot].status_register = fresh;
    }

    pub fn tick(&mut self, clock: &ClockTick, lines: &mut Vec<LineEvent>) {
        for port in self.ports.iter_mut() {
            if let Some(device) = port.device.as_mut() {
                device.tick(clock);
            }
        }
        if self.ports.is_empty() {
            return;
        }
        self.timing += clock.ns;
        while self.timing >= self.period_ns {
            self.timing -= self.period_ns;
            for slot in 0..self.ports.len() {
                self.update_status(slot);
                if self.ports[slot].irq_enabled && self.ports[slot].irq_raised & 3 == 1 {
                    self.pending.push(LineEvent::RaiseIrq(PORT_IRQS[slot]));
                    self.ports[slot].irq_raised |= 2;
                }
            }
        }
        lines.append(&mut self.pending);
    }
}
