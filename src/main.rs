//! midiplay - play a Standard MIDI File through the sequencer.
//!
//! Loads a .mid file, connects to an output port and plays it in real
//! time, optionally looping. While playing, commands typed on stdin
//! control the session.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- song.mid                 # Play once, events logged to stderr
//! cargo run -- --loops 2 song.mid       # Play three times
//! RUST_LOG=midiplay=debug cargo run -- song.mid
//! ```

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use midiplay::transport::{PortCaps, PortType};
use midiplay::{LogSink, PlayerConfig, Song, SoftSequencer, Transport};
use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// How often the main thread checks whether playback ended by itself.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command-line options for the application.
#[derive(Debug, Default)]
struct CliOptions {
    /// MIDI file to play.
    file: Option<PathBuf>,
    /// 0 plays once, N repeats N times, negative loops forever.
    loops: i32,
    /// Explicit output address.
    port: Option<String>,
    no_connect: bool,
    allow_pause: bool,
    /// JSON configuration file.
    config: Option<PathBuf>,
    /// Print the available ports and exit.
    list_ports: bool,
    /// SoundFont to render with instead of logging events.
    soundfont: Option<PathBuf>,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--loops N` or `-l N`: Extra passes (negative loops forever)
    /// - `--port ADDR` or `-p ADDR`: Connect to this port first
    /// - `--no-connect`: Do not connect the output anywhere
    /// - `--allow-pause`: Enable pause emulation
    /// - `--config FILE`: Read settings from a JSON file
    /// - `--list-ports`: Print ports and exit
    /// - `--soundfont PATH` or `-sf PATH`: Render through a SoundFont
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        Self::parse_from(std::env::args().skip(1))
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--loops" | "-l" => {
                    let value = args.next().context("--loops requires a number")?;
                    options.loops = value
                        .parse()
                        .with_context(|| format!("Invalid loop count: {}", value))?;
                }
                "--port" | "-p" => {
                    options.port = Some(args.next().context("--port requires an address")?);
                }
                "--no-connect" => options.no_connect = true,
                "--allow-pause" => options.allow_pause = true,
                "--config" => {
                    options.config = Some(PathBuf::from(
                        args.next().context("--config requires a path")?,
                    ));
                }
                "--list-ports" => options.list_ports = true,
                "--soundfont" | "-sf" => {
                    options.soundfont = Some(PathBuf::from(
                        args.next().context("--soundfont requires a path")?,
                    ));
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    bail!("Unknown option: {} (use --help for usage information)", other)
                }
                other => {
                    if options.file.is_some() {
                        bail!("Only one MIDI file can be played at a time");
                    }
                    options.file = Some(PathBuf::from(other));
                }
            }
        }

        Ok(options)
    }

    /// Builds the player configuration: environment, then config file, then flags.
    fn player_config(&self) -> Result<PlayerConfig> {
        let mut config = PlayerConfig::from_env();
        if let Some(path) = &self.config {
            config = config.merge(PlayerConfig::load_json(path)?);
        }
        config = config.merge(PlayerConfig {
            client_name: None,
            output_ports: self.port.clone(),
            no_connect: self.no_connect.then_some(true),
            allow_pause: self.allow_pause.then_some(true),
        });
        Ok(config)
    }
}

fn print_help() {
    eprintln!("midiplay - Real-time MIDI file player");
    eprintln!();
    eprintln!("Usage: midiplay [OPTIONS] FILE");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -l, --loops N          Play N extra times (negative loops forever)");
    eprintln!("  -p, --port ADDR        Connect to ADDR (client:port or client name)");
    eprintln!("      --no-connect       Do not connect the output to any port");
    eprintln!("      --allow-pause      Enable pause emulation");
    eprintln!("      --config FILE      Read settings from a JSON file");
    eprintln!("      --list-ports       Print available ports and exit");
    eprintln!("  -sf, --soundfont PATH  Render through a SoundFont (.sf2)");
    eprintln!("  -h, --help             Print this help message");
    eprintln!();
    print_commands();
}

fn print_commands() {
    eprintln!("While playing: p pause, r resume, v N volume (0-127), s or q stop");
}

/// A command typed on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Pause,
    Resume,
    Volume(i32),
    Stop,
    Help,
}

impl Input {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let input = match words.next()? {
            "p" | "pause" => Self::Pause,
            "r" | "resume" => Self::Resume,
            "v" | "volume" => Self::Volume(words.next()?.parse().ok()?),
            "s" | "q" | "stop" | "quit" => Self::Stop,
            "h" | "?" | "help" => Self::Help,
            _ => return None,
        };
        Some(input)
    }
}

/// Reads commands from stdin on a background thread.
fn spawn_stdin_reader() -> Result<Receiver<Input>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match Input::parse(&line) {
                    Some(input) => {
                        if tx.send(input).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("Unknown command: {}", line.trim()),
                }
            }
        })
        .context("Failed to start input thread")?;
    Ok(rx)
}

/// Registers the destination port that receives the music.
///
/// Returns a guard that must outlive playback.
fn add_output(seq: &SoftSequencer, cli: &CliOptions) -> Result<Box<dyn std::any::Any>> {
    let caps = PortCaps::WRITE | PortCaps::SUBS_WRITE;

    if let Some(path) = &cli.soundfont {
        #[cfg(feature = "synth")]
        {
            let engine = midiplay::transport::synth::SynthEngine::new(path)?;
            seq.add_sink_port(
                "SoundFont Synth",
                "Synth Input",
                caps,
                PortType::MIDI_GENERIC | PortType::SYNTHESIZER | PortType::SOFTWARE,
                engine.sink(),
            )
            .context("Failed to register synthesizer port")?;
            return Ok(Box::new(engine));
        }
        #[cfg(not(feature = "synth"))]
        bail!(
            "Cannot play through {}: built without the \"synth\" feature",
            path.display()
        );
    }

    seq.add_sink_port(
        "MIDI Monitor",
        "Monitor Input",
        caps,
        PortType::MIDI_GENERIC | PortType::SOFTWARE,
        LogSink::new(),
    )
    .context("Failed to register monitor port")?;
    Ok(Box::new(()))
}

fn list_ports(seq: &SoftSequencer) -> Result<()> {
    let client = seq.open_client()?;
    println!(" Port    Client                           Port");
    for info in client.ports()? {
        if info.addr.client == client.client_id() {
            continue;
        }
        println!(
            "{:>3}:{:<3} {:<32} {}",
            info.addr.client, info.addr.port, info.client_name, info.name
        );
    }
    Ok(())
}

/// Plays the song until it ends or the user stops it.
fn run<T: Transport + 'static>(song: &mut Song<T>, loops: i32) -> Result<()> {
    let input = spawn_stdin_reader()?;
    song.start(loops).context("Failed to start playback")?;
    print_commands();

    loop {
        if song.is_finished() {
            break;
        }
        match input.recv_timeout(POLL_INTERVAL) {
            Ok(Input::Pause) => {
                if !song.pause() {
                    eprintln!("Pause is not available (see --allow-pause)");
                }
            }
            Ok(Input::Resume) => {
                if !song.resume() {
                    eprintln!("Not paused");
                }
            }
            Ok(Input::Volume(volume)) => {
                if !song.set_volume(volume) {
                    eprintln!("Volume can only be changed while playing");
                }
            }
            Ok(Input::Stop) => {
                song.stop().context("Playback failed")?;
                return Ok(());
            }
            Ok(Input::Help) => print_commands(),
            Err(RecvTimeoutError::Timeout) => {}
            // No more input: just let the song play out
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(report) = song.join().context("Playback failed")? {
        eprintln!(
            "Played {} pass(es), {} events",
            report.passes, report.events_sent
        );
    }
    Ok(())
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = cli.player_config()?;
    let seq = SoftSequencer::new().context("Failed to start sequencer")?;
    if !seq.detect() {
        bail!("The sequencer is not usable");
    }
    let _output = add_output(&seq, &cli)?;

    if cli.list_ports {
        return list_ports(&seq);
    }

    let Some(path) = &cli.file else {
        print_help();
        bail!("No MIDI file given");
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let client = seq.open_client().context("Failed to open sequencer client")?;
    let mut song = Song::load(&bytes, client, &config)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    match song.connected_to() {
        Some(addr) => eprintln!("Playing {} to {}", path.display(), addr),
        None => eprintln!("Playing {} (no output connected)", path.display()),
    }

    let result = run(&mut song, cli.loops);
    song.free().context("Failed to release the sequencer")?;
    result
}
