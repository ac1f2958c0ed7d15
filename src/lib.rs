pub mod apic;
pub mod audio;
pub mod chipset;
pub mod devices;
pub mod dma;
pub mod gameblaster;
pub mod machine;
pub mod memory;
pub mod mpu401;
pub mod parallel;
pub mod pic;
pub mod pit;
pub mod ppi;
pub mod soundblaster;
pub mod ssource;

use chipset::Chipset;
use devices::Signal;
use machine::MachineConfig;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no audio output device available")]
    NoAudioDevice,
    #[error("audio playback failed: {0}")]
    Audio(String),
    #[error("capture file error: {0}")]
    Capture(#[from] hound::Error),
}

/// Scheduler slice: the chipset observes every clock at least this often.
const SLICE_NS: u64 = 1_000;

pub struct Emulator {
    pub chipset: Chipset,
    slice_remainder: u64,
}

impl Emulator {
    pub fn new(config: MachineConfig) -> Emulator {
        info!(
            xt = config.is_xt,
            apic = config.apic,
            pit_channels = if config.six_channel_pit { 6 } else { 3 },
            "machine configured"
        );
        Emulator { chipset: Chipset::new(config), slice_remainder: 0 }
    }

    /// Advance emulated time by `ns`, in deterministic fixed slices so the
    /// device tick order of a long jump matches many small ones.
    pub fn run_for(&mut self, ns: u64) -> Signal {
        let mut signal = Signal::Ok;
        self.slice_remainder += ns;
        while self.slice_remainder >= SLICE_NS {
            self.slice_remainder -= SLICE_NS;
            signal.add(&self.chipset.tick(SLICE_NS));
        }
        signal
    }

    /// Drain pending interrupts the way a CPU INTA sequence would, handing
    /// each vector to the supplied service routine.
    pub fn service_interrupts<F: FnMut(u8)>(&mut self, mut service: F) {
        while self.chipset.interrupt_pending() {
            let vector = self.chipset.inta();
            service(vector);
        }
    }
}
