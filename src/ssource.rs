// Disney Sound Source and Covox Speech Thing, both riding the data and
// control lines of a parallel port. The Sound Source is a powered 16-byte
// FIFO DAC drained at 7 kHz; the Covox is a bare resistor ladder latched by
// the control-line pulses, sampled here at the host rate. Five data writes
// with no control traffic flip the Covox into mono mode.

use crate::audio::{double_buffer, DoubleBufferReader, DoubleBufferWriter, Fifo};
use crate::devices::{ClockTick, NS_PER_SEC};
use crate::parallel::ParallelDevice;

const SSOURCE_RATE: u32 = 7_000;
const COVOX_RATE: u32 = 44_100;
const SSOURCE_FIFO: usize = 16;
const SSOURCE_BUFFER: usize = 651 * 4;
const COVOX_BUFFER: usize = 4096 * 4;
// Powering the DAC down takes a little over 10us before the FIFO drains.
const POWERDOWN_NS: u64 = 15_000;

fn dac_to_i16(sample: u8) -> i16 {
    (((sample ^ 0x80) as i8) as i16) << 8
}

pub struct SoundSource {
    stream: Fifo<u8>,
    out_buffer: u8,
    last_control: u8,
    powered_up: bool,
    powerdown_ns: u64,
    // ACK status latch: 0 reads as full, 0x40 as room available.
    empty_status: u8,
    covox_left: u8,
    covox_right: u8,
    covox_mono: bool,
    covox_ticking: u8,
    ssource_numerator: u64,
    covox_numerator: u64,
    ssource_out: DoubleBufferWriter<i16>,
    ssource_reader: Option<DoubleBufferReader<i16>>,
    covox_out: DoubleBufferWriter<(i16, i16)>,
    covox_reader: Option<DoubleBufferReader<(i16, i16)>>,
}

impl SoundSource {
    pub fn new() -> Self {
        let (ssource_out, ssource_reader) = double_buffer(SSOURCE_BUFFER, SSOURCE_RATE, 0i16);
        let (covox_out, covox_reader) = double_buffer(COVOX_BUFFER, COVOX_RATE, (0i16, 0i16));
        SoundSource {
            stream: Fifo::new(SSOURCE_FIFO),
            out_buffer: 0,
            last_control: 0,
            powered_up: false,
            powerdown_ns: 0,
            empty_status: 0,
            covox_left: 0x80,
            covox_right: 0x80,
            covox_mono: false,
            covox_ticking: 0,
            ssource_numerator: 0,
            covox_numerator: 0,
            ssource_out,
            ssource_reader: Some(ssource_reader),
            covox_out,
            covox_reader: Some(covox_reader),
        }
    }

    pub fn take_ssource_reader(&mut self) -> Option<DoubleBufferReader<i16>> {
        self.ssource_reader.take()
    }

    pub fn take_covox_reader(&mut self) -> Option<DoubleBufferReader<(i16, i16)>> {
        self.covox_reader.take()
    }
}

impl ParallelDevice for SoundSource {
    fn data_out(&mut self, value: u8) {
        self.out_buffer = value;
        if self.covox_mono {
            self.covox_left = value;
            self.covox_right = value;
        } else {
            self.covox_ticking += 1;
            if self.covox_ticking == 5 {
                // Untimed write burst: software treats us as a mono Covox.
                self.covox_mono = true;
                self.covox_ticking = 4;
            }
        }
    }

    fn control_out(&mut self, control: u8) {
        let bits_on = (control ^ self.last_control) & control;
        let bits_off = (control ^ self.last_control) & self.last_control;
        if control & 4 == 0 {
            // INIT low powers the Sound Source; the strobe on bit 3 clocks
            // the FIFO.
            if bits_off & 8 != 0 {
                self.stream.write(self.out_buffer);
                self.covox_ticking = 0;
                self.covox_mono = false;
            }
            self.powerdown_ns = 0;
            self.powered_up = true;
        } else if bits_on & 4 != 0 {
            self.powerdown_ns = POWERDOWN_NS;
        }
        if bits_on & 1 != 0 {
            self.covox_left = self.out_buffer;
            self.covox_ticking = 0;
            self.covox_mono = false;
        }
        if bits_on & 2 != 0 {
            self.covox_right = self.out_buffer;
            self.covox_ticking = 0;
            self.covox_mono = false;
        }
        self.last_control = control;
    }

    fn control_in(&mut self) -> u8 {
        self.last_control
    }

    fn status(&mut self) -> u8 {
        // Bits 0-1 always read set for detection, bit 7 mirrors data bit 7.
        let result = 3 | (self.out_buffer & 0x80);
        if self.powered_up {
            self.empty_status = if self.stream.free() == 0 { 0 } else { 0x40 };
        } else {
            // Unpowered, ACK simply follows the inverted INIT line.
            self.empty_status = 0;
        }
        result | ((((!self.last_control) << 4) & self.empty_status) & 0x40)
    }

    fn tick(&mut self, clock: &ClockTick) {
        if self.powerdown_ns > 0 {
            if self.powerdown_ns <= clock.ns {
                self.powerdown_ns = 0;
                self.stream.clear();
                self.empty_status = 0x40;
                self.powered_up = false;
            } else {
                self.powerdown_ns -= clock.ns;
            }
        }
        self.ssource_numerator += clock.ns * SSOURCE_RATE as u64;
        let ssource_samples = self.ssource_numerator / NS_PER_SEC;
        self.ssource_numerator -= ssource_samples * NS_PER_SEC;
        for _ in 0..ssource_samples {
            let sample = if self.powered_up {
                self.stream.read().unwrap_or(0x80)
            } else {
                0x80
            };
            self.ssource_out.write(dac_to_i16(sample));
        }
        self.covox_numerator += clock.ns * COVOX_RATE as u64;
        let covox_samples = self.covox_numerator / NS_PER_SEC;
        self.covox_numerator -= covox_samples * NS_PER_SEC;
        for _ in 0..covox_samples {
            self.covox_out
                .write((dac_to_i16(self.covox_left), dac_to_i16(self.covox_right)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strobe_queues_fifo_byte_when_powered() {
        let mut source = SoundSource::new();
        source.control_out(0x0); // INIT low: power on
        source.data_out(0x55);
        source.control_out(0x8); // strobe high
        source.control_out(0x0); // falling edge clocks the byte
        assert_eq!(source.stream.len(), 1);
    }

    #[test]
    fn full_fifo_reports_through_ack() {
        let mut source = SoundSource::new();
        source.control_out(0x0);
        for _ in 0..SSOURCE_FIFO {
            source.control_out(0x8);
            source.control_out(0x0);
        }
        assert_eq!(source.stream.free(), 0);
        // Full buffer: ACK bit reads low.
        assert_eq!(source.status() & 0x40, 0);
    }

    #[test]
    fn covox_mono_detection() {
        let mut source = SoundSource::new();
        for _ in 0..5 {
            source.data_out(0x10);
        }
        source.data_out(0x42);
        assert_eq!(source.covox_left, 0x42);
        assert_eq!(source.covox_right, 0x42);
    }
}
