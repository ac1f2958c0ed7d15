// Real-time frontend for the chipset: rodio carries the audio channels to
// the host, a repeating timer paces emulated time against the wall clock
// and a termion status screen shows the device state. `--debug` switches
// to single-stepped execution with a small command prompt.

use empc::audio::{MonoRingSource, StereoRingSource, WavSink};
use empc::devices::Signal;
use empc::gameblaster::OUTPUT_RATE as GB_RATE;
use empc::machine::{self, MachineConfig};
use empc::pit::SPEAKER_RATE;
use empc::{Emulator, MachineError};
use rodio::{OutputStream, Sink};
use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use termion::{clear, cursor};
use tracing::{info, trace};

const FRAME_MS: i64 = 5;
const FRAME_NS: u64 = FRAME_MS as u64 * 1_000_000;
const SB_RATE: u32 = 22_233;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let mut config = machine::ibm_at();
    let mut debug = false;
    let mut silent = false;
    let mut capture = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--xt" => config = machine::ibm_xt(),
            "--at" => config = machine::ibm_at(),
            "--compaq" => config = machine::compaq_deskpro(),
            "--debug" => debug = true,
            "--silent" => silent = true,
            "--capture" => capture = true,
            other => {
                eprintln!("mypc: unknown argument {}", other);
                return;
            }
        }
    }
    if let Err(error) = run(config, debug, silent, capture) {
        eprintln!("mypc: {}", error);
    }
}

fn run(config: MachineConfig, debug: bool, silent: bool, capture: bool) -> Result<(), MachineError> {
    let mut emulator = Emulator::new(config);
    if capture {
        // Tap the speaker and the synth mix into wave files next to us.
        emulator
            .chipset
            .pit
            .set_speaker_capture(Some(WavSink::create("speaker.wav", 1, SPEAKER_RATE)?));
        emulator
            .chipset
            .gameblaster
            .set_capture(Some(WavSink::create("gameblaster.wav", 2, GB_RATE)?));
    }

    // Keep the stream alive for as long as we play; sinks feed from the
    // double-buffered rings the devices write into.
    let audio = if silent {
        None
    } else {
        let (stream, handle) =
            OutputStream::try_default().map_err(|error| MachineError::Audio(error.to_string()))?;
        let mut sinks = Vec::new();
        if let Some(reader) = emulator.chipset.pit.take_speaker_reader() {
            let sink = Sink::try_new(&handle).map_err(|error| MachineError::Audio(error.to_string()))?;
            sink.append(MonoRingSource::new(reader, SPEAKER_RATE));
            sinks.push(sink);
        }
        if let Some(reader) = emulator.chipset.sb.take_reader() {
            let sink = Sink::try_new(&handle).map_err(|error| MachineError::Audio(error.to_string()))?;
            sink.append(StereoRingSource::new(reader, SB_RATE));
            sinks.push(sink);
        }
        if let Some(reader) = emulator.chipset.gameblaster.take_reader() {
            let sink = Sink::try_new(&handle).map_err(|error| MachineError::Audio(error.to_string()))?;
            sink.append(StereoRingSource::new(reader, GB_RATE));
            sinks.push(sink);
        }
        Some((stream, sinks))
    };

    boot_beep(&mut emulator);
    info!("machine running, q + enter quits");

    if debug {
        debug_loop(&mut emulator);
    } else {
        free_run(&mut emulator);
    }
    drop(audio);
    Ok(())
}

/// Program a short 440 Hz attention beep through PIT channel 2 and the
/// speaker gate, the way the BIOS does after POST.
fn boot_beep(emulator: &mut Emulator) {
    let divisor: u16 = 2_711; // 1.193182 MHz / 440 Hz
    emulator.chipset.io_write(0x43, 0xB6); // channel 2, lo/hi, square wave
    emulator.chipset.io_write(0x42, (divisor & 0xFF) as u8);
    emulator.chipset.io_write(0x42, (divisor >> 8) as u8);
    emulator.chipset.io_write(0x61, 0x03); // gate on, data on
}

fn free_run(emulator: &mut Emulator) {
    let timer = timer::Timer::new();
    let (tick_tx, tick_rx) = mpsc::channel();
    let _guard = timer.schedule_repeating(chrono::Duration::milliseconds(FRAME_MS), move || {
        let _ = tick_tx.send(());
    });
    let (input_tx, input_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if input_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    let mut frames = 0u64;
    loop {
        if tick_rx.recv().is_err() {
            break;
        }
        let signal = emulator.run_for(FRAME_NS);
        emulator.service_interrupts(|vector| trace!(vector, "interrupt serviced"));
        if signal == Signal::Quit {
            break;
        }
        frames += 1;
        if frames % 100 == 0 {
            draw_status(emulator);
        }
        if let Ok(line) = input_rx.try_recv() {
            if line.trim() == "q" {
                break;
            }
        }
        // Silence the boot beep after half a second.
        if frames == 100 {
            emulator.chipset.io_write(0x61, 0x00);
        }
    }
}

fn debug_loop(emulator: &mut Emulator) {
    let mut last_command = String::from("n");
    loop {
        draw_status(emulator);
        print!("n to step {}ms, c to run a second, q to quit > ", FRAME_MS);
        io::stdout().flush().expect("");
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return;
        }
        let command = match input.trim() {
            "" => last_command.clone(),
            other => other.to_string(),
        };
        match command.as_str() {
            "q" => return,
            "c" => {
                for _ in 0..(1000 / FRAME_MS) {
                    emulator.run_for(FRAME_NS);
                    emulator.service_interrupts(|vector| trace!(vector, "interrupt serviced"));
                }
            }
            _ => {
                emulator.run_for(FRAME_NS);
                emulator.service_interrupts(|vector| trace!(vector, "interrupt serviced"));
            }
        }
        last_command = command;
    }
}

fn draw_status(emulator: &mut Emulator) {
    let chipset = &emulator.chipset;
    print!("{}{}", clear::All, cursor::Goto(1, 1));
    println!("╔══════════════════════════════════════════════╗");
    println!(
        "║ mypc  t={:>12} ns                        ║",
        chipset.total_ns()
    );
    println!("╟──────────────────────────────────────────────╢");
    println!(
        "║ PIC  irr {:02x}/{:02x} isr {:02x}/{:02x} imr {:02x}/{:02x}          ║",
        chipset.pic.irr(0),
        chipset.pic.irr(1),
        chipset.pic.isr(0),
        chipset.pic.isr(1),
        chipset.pic.imr(0),
        chipset.pic.imr(1),
    );
    println!(
        "║ PIT  out0={} out1={} out2={}                    ║",
        chipset.pit.output(0) as u8,
        chipset.pit.output(1) as u8,
        chipset.pit.output(2) as u8,
    );
    println!(
        "║ DMA  {}  NMIs {:>4}  POST {:02x}                 ║",
        if chipset.dma.is_idle() { "idle" } else { "busy" },
        chipset.ppi.nmi_count,
        chipset.ppi.diagnostics_code(),
    );
    println!("╚══════════════════════════════════════════════╝");
}
