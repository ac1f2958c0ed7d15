// Machine descriptions for the boards we emulate. The port map below is
// the byte-granular decode the chipset implements; everything not listed
// floats the bus.

use crate::devices::MHZ14;
use crate::soundblaster::{SB_VERSION_1X, SB_VERSION_20};

// I/O port map (byte-granular)
//
//   0x000-0x00F   DMA controller 0 (channels 0-3)
//   0x020-0x021   PIC master
//   0x022-0x023   IMCR / addr22 (APIC routing gate)
//   0x040-0x043   PIT block 0
//   0x048-0x04B   PIT block 1 (six-channel chipsets)
//   0x060         Keyboard data (XT: diagnostics on write)
//   0x061         System control port B (speaker gate / PPI bits)
//   0x062-0x063   PPI switches / mode (XT)
//   0x080-0x08F   DMA page registers (+ 0x80/0x84 POST diagnostics latch)
//   0x092         System control port A (fast A20 / fast reset)
//   0x0A0-0x0A1   PIC slave (AT), NMI gate (XT)
//   0x0C0-0x0DE   DMA controller 1, word-strided even ports
//   0x210-0x217   XT expansion unit probe latches
//   0x220-0x22F   Sound Blaster DSP (+6 reset, +A read, +C write, +E status)
//   0x230-0x23F   Game Blaster (CT-1302: value/addr pairs, detect on +4,
//                 store latches on +6/+7 read back at +A/+B)
//   0x278-0x27A   LPT2
//   0x330-0x331   MPU-401 data/command
//   0x378-0x37A   LPT1 (Sound Source / Covox attach here)
//   0x3BC-0x3BE   LPT3
//
//   0xFEC00000    I/O APIC window (AT with APIC fabric enabled)
//   0xFEE00000    Local APIC window, one page per CPU

/// Everything the chipset needs to know about the board it lives on.
#[derive(Clone)]
pub struct MachineConfig {
    pub is_xt: bool,
    pub has_slave_pic: bool,
    pub cpu_hz: u64,
    pub six_channel_pit: bool,
    pub apic: bool,
    pub num_cpus: usize,
    pub sb_base: u16,
    pub sb_version: u16,
    pub gb_base: u16,
    pub gb_sb_compatible: bool,
    pub parallel_ports: usize,
    pub enable_speaker: bool,
}

/// 8088-class XT: one PIC, one DMA controller in use, DMA clocked from the
/// 4.77 MHz bus pipeline, Sound Blaster 1.x with a standalone Game Blaster.
pub fn ibm_xt() -> MachineConfig {
    MachineConfig {
        is_xt: true,
        has_slave_pic: false,
        cpu_hz: MHZ14 / 3, // 4.77 MHz
        six_channel_pit: false,
        apic: false,
        num_cpus: 1,
        sb_base: 0x220,
        sb_version: SB_VERSION_1X,
        gb_base: 0x230,
        gb_sb_compatible: false,
        parallel_ports: 1,
        enable_speaker: true,
    }
}

/// 286+-class AT: cascaded PICs, DMA on half the CPU clock, DSP 2.01.
pub fn ibm_at() -> MachineConfig {
    MachineConfig {
        is_xt: false,
        has_slave_pic: true,
        cpu_hz: 8_000_000,
        six_channel_pit: false,
        apic: false,
        num_cpus: 1,
        sb_base: 0x220,
        sb_version: SB_VERSION_20,
        gb_base: 0x230,
        gb_sb_compatible: false,
        parallel_ports: 1,
        enable_speaker: true,
    }
}

/// Compaq-style AT flavor: six PIT channels (failsafe timer on the second
/// block) and the xAPIC fabric present for multiprocessor experiments.
pub fn compaq_deskpro() -> MachineConfig {
    MachineConfig {
        six_channel_pit: true,
        apic: true,
        num_cpus: 2,
        cpu_hz: 16_000_000,
        ..ibm_at()
    }
}
