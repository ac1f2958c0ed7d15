// MPU-401 MIDI interface at 0x330/0x331, covering the command subset DOS
// software probes plus dumb UART passthrough. Intelligent-mode commands are
// acknowledged and, where they report something, answered through the data
// queue; sequencer playback itself is not wired up.

use crate::audio::Fifo;
use crate::devices::{IrqLine, LineEvent, IRQ_MPU401};
use tracing::trace;

const RX_QUEUE: usize = 64;
const ACK: u8 = 0xFE;
const CMD_UART_MODE: u8 = 0x3F;
const CMD_RESET: u8 = 0xFF;
const CMD_VERSION: u8 = 0xAC;
const CMD_REVISION: u8 = 0xAD;
const MPU_VERSION: u8 = 0x15;
const MPU_REVISION: u8 = 0x01;

pub struct Mpu401 {
    uart_mode: bool,
    queue: Fifo<u8>,
    irq_line: IrqLine,
    irq_high: bool,
    tx: Vec<u8>,
    lines: Vec<LineEvent>,
}

impl Mpu401 {
    pub fn new() -> Self {
        Mpu401 {
            uart_mode: false,
            queue: Fifo::new(RX_QUEUE),
            irq_line: IRQ_MPU401,
            irq_high: false,
            tx: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn drain_lines(&mut self, out: &mut Vec<LineEvent>) {
        out.append(&mut self.lines);
    }

    /// Bytes the UART sent towards the synthesizer since the last call.
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.tx, Vec::new())
    }

    /// A MIDI byte arriving from the outside world.
    pub fn receive_midi(&mut self, byte: u8) {
        if self.uart_mode {
            self.push_result(byte);
        }
    }

    fn push_result(&mut self, byte: u8) {
        self.queue.write(byte);
        if !self.irq_high {
            self.irq_high = true;
            self.lines.push(LineEvent::RaiseIrq(self.irq_line));
        }
    }

    fn pop_result(&mut self) -> u8 {
        let result = self.queue.read().unwrap_or(ACK);
        if self.queue.is_empty() && self.irq_high {
            self.irq_high = false;
            self.lines.push(LineEvent::LowerIrq(self.irq_line));
        }
        result
    }

    pub fn write_io(&mut self, port: u16, value: u8) -> bool {
        match port {
            0x330 => {
                if self.uart_mode {
                    self.tx.push(value);
                }
                // Outside UART mode data bytes belong to sequencer
                // commands this card subset does not run.
                true
            }
            0x331 => {
                self.command(value);
                true
            }
            _ => false,
        }
    }

    pub fn read_io(&mut self, port: u16) -> Option<u8> {
        match port {
            0x330 => Some(self.pop_result()),
            0x331 => {
                // Bit 7 low: data ready. Bit 6 low: ready for a command.
                let dsr = if self.queue.is_empty() { 0x80 } else { 0x00 };
                Some(dsr | 0x3F)
            }
            _ => None,
        }
    }

    fn command(&mut self, command: u8) {
        trace!(command, "mpu command");
        match command {
            CMD_RESET => {
                self.uart_mode = false;
                self.queue.clear();
                if self.irq_high {
                    self.irq_high = false;
                    self.lines.push(LineEvent::LowerIrq(self.irq_line));
                }
                self.push_result(ACK);
            }
            CMD_UART_MODE => {
                self.uart_mode = true;
                self.push_result(ACK);
            }
            CMD_VERSION => {
                self.push_result(ACK);
                self.push_result(MPU_VERSION);
            }
            CMD_REVISION => {
                self.push_result(ACK);
                self.push_result(MPU_REVISION);
            }
            _ => {
                // Everything else acknowledges and keeps quiet.
                self.push_result(ACK);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_acknowledges() {
        let mut mpu = Mpu401::new();
        mpu.write_io(0x331, CMD_RESET);
        assert_eq!(mpu.read_io(0x331).unwrap() & 0x80, 0); // data ready
        assert_eq!(mpu.read_io(0x330), Some(ACK));
        assert_eq!(mpu.read_io(0x331).unwrap() & 0x80, 0x80);
    }

    #[test]
    fn uart_mode_passes_data_through() {
        let mut mpu = Mpu401::new();
        mpu.write_io(0x331, CMD_UART_MODE);
        assert_eq!(mpu.read_io(0x330), Some(ACK));
        mpu.write_io(0x330, 0x90);
        mpu.write_io(0x330, 0x45);
        mpu.write_io(0x330, 0x7F);
        assert_eq!(mpu.take_tx(), vec![0x90, 0x45, 0x7F]);
        mpu.receive_midi(0xF8);
        assert_eq!(mpu.read_io(0x330), Some(0xF8));
    }

    #[test]
    fn version_query() {
        let mut mpu = Mpu401::new();
        mpu.write_io(0x331, CMD_VERSION);
        assert_eq!(mpu.read_io(0x330), Some(ACK));
        assert_eq!(mpu.read_io(0x330), Some(MPU_VERSION));
    }
}
