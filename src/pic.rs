// 8259A interrupt controller pair plus the IMCR routing gate at ports
// 0x22/0x23. Beyond the architectural IRR/ISR/IMR, a per-source request
// matrix (irr2/irr3 families) tracks which device is behind each shared IR
// line so accept and finish notifications reach the right owner.

use crate::devices::{IrqEvent, IrqLine};
use tracing::{debug, trace};

// Cascade requests onto master IR2 use a reserved source slot.
const CASCADE_SOURCE: u8 = 8;

pub struct Pic {
    imr: [u8; 2],
    irr: [u8; 2],
    isr: [u8; 2],
    // Live line level per (chip, source).
    irr2: [[u8; 16]; 2],
    // Rising edges not yet folded into the architectural IRR.
    irr3: [[u8; 16]; 2],
    // Edges already folded (accept callback fired).
    irr3_a: [[u8; 16]; 2],
    // Edges eligible for INTA selection.
    irr3_b: [[u8; 16]; 2],
    // In-service ownership per source, mirrors isr.
    isr2: [[u8; 16]; 2],
    icw: [[u8; 4]; 2],
    icw_step: [usize; 2],
    read_isr: [bool; 2],
    polling: [bool; 2],
    last_interrupt_ir: [u8; 2],
    cascade_tracked: bool,
    irr3_dirty: bool,
    intr_tracked: bool,
    // Events for sharing devices, drained by the chipset.
    events: Vec<IrqEvent>,
    // Line transitions to mirror into the APIC fabric.
    apic_lines: Vec<(u8, bool)>,
    addr22: u8,
    imcr: u8,
    has_slave: bool,
}

impl Pic {
    pub fn new(has_slave: bool) -> Self {
        Pic {
            imr: [0xFF; 2], // everything masked until the BIOS programs us
            irr: [0; 2],
            isr: [0; 2],
            irr2: [[0; 16]; 2],
            irr3: [[0; 16]; 2],
            irr3_a: [[0; 16]; 2],
            irr3_b: [[0; 16]; 2],
            isr2: [[0; 16]; 2],
            icw: [[0; 4]; 2],
            icw_step: [4; 2],
            read_isr: [false; 2],
            polling: [false; 2],
            last_interrupt_ir: [0; 2],
            cascade_tracked: false,
            irr3_dirty: false,
            intr_tracked: false,
            events: Vec::new(),
            apic_lines: Vec::new(),
            addr22: 0,
            imcr: 0,
            has_slave,
        }
    }

    pub fn imcr(&self) -> u8 {
        self.imcr
    }

    pub fn drain_events(&mut self, out: &mut Vec<IrqEvent>) {
        out.append(&mut self.events);
    }

    pub fn drain_apic_lines(&mut self, out: &mut Vec<(u8, bool)>) {
        out.append(&mut self.apic_lines);
    }

    fn chip_for_port(&self, port: u16) -> Option<usize> {
        match port & !1 {
            0x20 => Some(0),
            0xA0 if self.has_slave => Some(1),
            _ => None,
        }
    }

    pub fn write_io(&mut self, port: u16, value: u8) -> bool {
        match port {
            0x22 => {
                self.addr22 = value;
                return true;
            }
            0x23 => {
                if self.addr22 == 0x70 {
                    self.imcr = value;
                }
                return true;
            }
            _ => {}
        }
        let chip = match self.chip_for_port(port) {
            Some(chip) => chip,
            None => return false,
        };
        if port & 1 == 0 {
            if value & 0x10 != 0 {
                // ICW1 restarts the whole initialization sequence.
                debug!(chip, value, "pic icw1");
                self.icw_step[chip] = 0;
                self.irr[chip] = 0;
                self.irr3[chip] = [0; 16];
                self.irr3_a[chip] = [0; 16];
                self.irr3_b[chip] = [0; 16];
                self.irr3_dirty = false;
                self.imr[chip] = 0;
                self.icw[chip][0] = value;
                self.icw_step[chip] = 1;
                self.icw[chip][2] = 7;
                if value & 1 == 0 {
                    self.icw[chip][3] = 0; // no ICW4 means all its modes off
                }
                self.read_isr[chip] = false;
                return true;
            }
            if value & 0x98 == 0x08 {
                // OCW3.
                self.polling[chip] = value & 4 != 0;
                if value & 2 != 0 {
                    self.read_isr[chip] = value & 1 != 0;
                }
                return true;
            }
            if value & 0x18 == 0 {
                // OCW2. Rotate variants degrade to their plain EOI.
                if value & 0x20 != 0 {
                    if value & 0x40 != 0 {
                        self.specific_eoi(chip, value & 7);
                    } else {
                        self.nonspecific_eoi(chip);
                    }
                }
            }
            true
        } else {
            if self.icw_step[chip] < 4 {
                let step = self.icw_step[chip];
                self.icw[chip][step] = value;
                self.icw_step[chip] += 1;
                if self.icw_step[chip] == 2 && self.icw[chip][0] & 2 != 0 {
                    self.icw_step[chip] += 1; // single mode skips ICW3
                }
                if self.icw_step[chip] == 3 && self.icw[chip][0] & 1 == 0 {
                    self.icw_step[chip] += 1; // no ICW4 requested
                }
                return true;
            }
            // OCW1.
            self.imr[chip] = value;
            true
        }
    }

    pub fn read_io(&mut self, port: u16) -> Option<u8> {
        match port {
            0x22 => return Some(self.addr22),
            0x23 => return Some(if self.addr22 == 0x70 { self.imcr } else { 0xFF }),
            _ => {}
        }
        let chip = self.chip_for_port(port)?;
        if self.polling[chip] {
            let result = self.poll_read(chip);
            self.polling[chip] = false;
            return Some(result);
        }
        Some(if port & 1 == 0 {
            if self.read_isr[chip] {
                self.isr[chip]
            } else {
                self.irr[chip]
            }
        } else {
            self.imr[chip]
        })
    }

    fn vector(&self, chip: usize, ir: u8) -> u8 {
        (self.icw[chip][1] & 0xF8) | (ir & 7)
    }

    /// EOI that retires exactly the highest-priority in-service bit.
    fn nonspecific_eoi(&mut self, chip: usize) {
        for ir in 0..8 {
            let bit = 1u8 << ir;
            if self.isr[chip] & bit != 0 {
                self.retire(chip, ir, bit);
                return;
            }
        }
    }

    /// Specific EOI: an index without an in-service bit is a no-op.
    fn specific_eoi(&mut self, chip: usize, ir: u8) {
        let bit = 1u8 << ir;
        if self.isr[chip] & bit != 0 {
            self.retire(chip, ir, bit);
        }
    }

    fn retire(&mut self, chip: usize, ir: u8, bit: u8) {
        self.isr[chip] ^= bit;
        for source in 0..16u8 {
            if self.isr2[chip][source as usize] & bit != 0 {
                self.isr2[chip][source as usize] ^= bit;
                self.events
                    .push(IrqEvent::Finished(IrqLine::new(source, ((chip as u8) << 3) | ir)));
            }
        }
    }

    /// Hardware raise of an encoded line. Only the 0 to 1 transition of a
    /// source's level latches a new edge.
    pub fn raise_irq(&mut self, line: IrqLine) {
        let chip = line.chip();
        let source = line.source() as usize;
        let bit = 1u8 << line.ir();
        let was_high = self.irr2[chip][source] & bit != 0;
        self.irr2[chip][source] |= bit;
        if !was_high {
            if line.irq() != 2 {
                self.apic_lines.push((line.irq(), true));
            }
            self.irr3[chip][source] |= bit;
            self.irr3_dirty = true;
        }
    }

    pub fn lower_irq(&mut self, line: IrqLine) {
        let chip = line.chip();
        let source = line.source() as usize;
        let bit = 1u8 << line.ir();
        if self.irr2[chip][source] & bit == 0 {
            return;
        }
        self.irr2[chip][source] &= !bit;
        let was_pending = self.irr3[chip][source] & bit;
        let was_accepted = self.irr3_a[chip][source] & bit;
        self.irr3[chip][source] &= !bit;
        self.irr3_a[chip][source] &= !bit;
        self.irr3_b[chip][source] &= !bit;
        self.irr3_dirty = true;
        if line.irq() != 2 {
            self.apic_lines.push((line.irq(), false));
        }
        if was_pending & was_accepted != 0 {
            self.irr[chip] &= !bit;
        }
    }

    fn unprocessed(&self, chip: usize) -> u8 {
        self.irr[chip] & !self.imr[chip] & !self.isr[chip]
    }

    /// Fold freshly-latched source edges into the architectural IRR, firing
    /// each source's accept notification exactly once per edge, then mirror
    /// the cascade and INTR lines.
    pub fn acknowledge_raises(&mut self) {
        if self.irr3_dirty {
            let mut all_clean = true;
            for chip in 0..2 {
                for ir in 0..8u8 {
                    let bit = 1u8 << ir;
                    for source in 0..16u8 {
                        if self.irr3_a[chip][source as usize] & bit == 0
                            && self.irr3[chip][source as usize] & bit != 0
                        {
                            self.events.push(IrqEvent::Accepted(IrqLine::new(
                                source,
                                ((chip as u8) << 3) | ir,
                            )));
                            self.irr3_a[chip][source as usize] |= bit;
                            self.irr3_b[chip][source as usize] |= bit;
                            self.irr[chip] |= bit;
                            all_clean = false;
                        }
                    }
                }
            }
            if all_clean {
                self.irr3_dirty = false;
            }
        }
        self.update_cascade();
    }

    fn update_cascade(&mut self) {
        if !self.has_slave {
            return;
        }
        if self.unprocessed(1) != 0 {
            if !self.cascade_tracked {
                self.raise_irq(IrqLine::new(CASCADE_SOURCE, 2));
                self.cascade_tracked = true;
                // Fold the cascade edge in right away so INTR follows.
                let bit = 1u8 << 2;
                let source = CASCADE_SOURCE as usize;
                if self.irr3[0][source] & bit != 0 && self.irr3_a[0][source] & bit == 0 {
                    self.irr3_a[0][source] |= bit;
                    self.irr3_b[0][source] |= bit;
                    self.irr[0] |= bit;
                }
            }
        } else if self.cascade_tracked {
            self.lower_irq(IrqLine::new(CASCADE_SOURCE, 2));
            self.cascade_tracked = false;
        }
    }

    /// Level of the INTR pin towards the CPU socket, after the IMCR gate.
    pub fn intr(&self) -> bool {
        self.unprocessed(0) != 0 && self.imcr & 1 == 0
    }

    /// Raw INTR level before the IMCR gate, for the APIC's LINT0 wire.
    pub fn intr_raw(&mut self) -> bool {
        let level = self.unprocessed(0) != 0;
        if level != self.intr_tracked {
            self.intr_tracked = level;
            self.apic_lines.push((2, level));
        }
        level
    }

    fn select_request(&self, chip: usize) -> Option<(u8, u8)> {
        let pending = self.unprocessed(chip);
        for ir in 0..8u8 {
            let bit = 1u8 << ir;
            for source in 0..16u8 {
                if pending & self.irr3_b[chip][source as usize] & bit != 0 {
                    return Some((ir, source));
                }
            }
        }
        None
    }

    fn accept(&mut self, chip: usize, ir: u8, source: u8) {
        let bit = 1u8 << ir;
        self.irr3[chip][source as usize] &= !bit;
        self.irr3_a[chip][source as usize] &= !bit;
        self.irr3_b[chip][source as usize] &= !bit;
        self.irr3_dirty = true;
        self.irr[chip] &= !bit;
        self.isr[chip] |= bit;
        self.isr2[chip][source as usize] |= bit;
        if self.icw[chip][3] & 2 != 0 {
            // Automatic EOI retires the service bit immediately.
            self.nonspecific_eoi(chip);
        }
        if chip == 1 {
            self.lower_irq(IrqLine::new(CASCADE_SOURCE, 2));
            self.cascade_tracked = false;
        }
    }

    /// Full INTA cycle: master responds, hands over to the slave when the
    /// accepted IR is marked cascaded in ICW3, and falls back to the
    /// spurious IR7 vector when nothing is pending anymore.
    pub fn inta(&mut self) -> u8 {
        self.inta_inner(false).0
    }

    /// INTA for the APIC's ExtINT path: spurious delivery substitutes the
    /// LAPIC spurious vector, so report whether the read was genuine.
    pub fn inta_checked(&mut self) -> (u8, bool) {
        self.inta_inner(false)
    }

    fn inta_inner(&mut self, mut on_slave: bool) -> (u8, bool) {
        let mut chip = if on_slave { 1 } else { 0 };
        loop {
            if let Some((ir, source)) = self.select_request(chip) {
                self.accept(chip, ir, source);
                if chip == 0
                    && self.icw[0][2] & (1 << ir) != 0
                    && self.icw[0][0] & 2 == 0
                    && self.has_slave
                    && !on_slave
                {
                    // Cascaded line: the slave supplies the vector.
                    on_slave = true;
                    chip = 1;
                    continue;
                }
                self.last_interrupt_ir[chip] = ir;
                trace!(chip, ir, vector = self.vector(chip, ir), "inta");
                return (self.vector(chip, ir), true);
            }
            break;
        }
        // Spurious: nothing pending by the time INTA arrived.
        self.last_interrupt_ir[chip] = 7;
        debug!(chip, "spurious ir7");
        (self.vector(chip, 7), false)
    }

    /// OCW3 polling-mode read: highest pending IR with bit 7 set, and the
    /// request is consumed as if INTA had run.
    fn poll_read(&mut self, chip: usize) -> u8 {
        if let Some((ir, source)) = self.select_request(chip) {
            self.accept(chip, ir, source);
            self.last_interrupt_ir[chip] = ir;
            return 0x80 | ir;
        }
        0
    }

    pub fn last_ir(&self, chip: usize) -> u8 {
        self.last_interrupt_ir[chip]
    }

    pub fn isr(&self, chip: usize) -> u8 {
        self.isr[chip]
    }

    pub fn irr(&self, chip: usize) -> u8 {
        self.irr[chip]
    }

    pub fn imr(&self, chip: usize) -> u8 {
        self.imr[chip]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn programmed() -> Pic {
        let mut pic = Pic::new(true);
        pic.write_io(0x20, 0x11);
        pic.write_io(0x21, 0x08); // master base
        pic.write_io(0x21, 0x04); // slave on IR2
        pic.write_io(0x21, 0x01);
        pic.write_io(0xA0, 0x11);
        pic.write_io(0xA1, 0x70); // slave base
        pic.write_io(0xA1, 0x02); // slave id 2
        pic.write_io(0xA1, 0x01);
        pic
    }

    #[test]
    fn icw_sequence_skips_icw3_in_single_mode() {
        let mut pic = Pic::new(false);
        pic.write_io(0x20, 0x13); // ICW1, single, ICW4 follows
        pic.write_io(0x21, 0x20);
        pic.write_io(0x21, 0x01); // lands in ICW4, not ICW3
        assert_eq!(pic.icw[0][1], 0x20);
        assert_eq!(pic.icw[0][3], 0x01);
    }

    #[test]
    fn lower_priority_waits_for_eoi() {
        let mut pic = programmed();
        pic.raise_irq(IrqLine::new(0, 3));
        pic.raise_irq(IrqLine::new(0, 7));
        pic.acknowledge_raises();
        assert_eq!(pic.inta(), 0x08 + 3);
        assert_eq!(pic.isr(0), 1 << 3);
        // IR7 stays pending until the EOI retires IR3.
        pic.write_io(0x20, 0x20);
        assert_eq!(pic.isr(0), 0);
        assert_eq!(pic.inta(), 0x08 + 7);
    }

    #[test]
    fn polling_mode_consumes_request() {
        let mut pic = programmed();
        pic.raise_irq(IrqLine::new(0, 5));
        pic.acknowledge_raises();
        pic.write_io(0x20, 0x0C); // OCW3, poll
        assert_eq!(pic.read_io(0x20), Some(0x85));
        assert_eq!(pic.isr(0), 1 << 5);
        // Second read is a plain register read again.
        assert_eq!(pic.read_io(0x20), Some(0));
    }
}
