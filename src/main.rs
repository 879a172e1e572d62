//! Nirstream - NIRS acquisition pipeline
//!
//! Runs a recording from the simulated instrument into the in-memory store
//! and optionally serves it through the export server.

use anyhow::Result;
use nirstream::config::AppConfig;
use nirstream::device::probe::{Probe, StaticCalibration};
use nirstream::export::{ExportServer, ServerEvent};
use nirstream::session::events::DisplayEvent;
use nirstream::session::SessionHandle;
use nirstream::{MemoryStore, SimulatedInstrument};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const RECORDING_ID: u64 = 1;

/// Command line options
#[derive(Debug, Default)]
struct Options {
    simulate: bool,
    seconds: Option<u64>,
    rate: Option<u32>,
    serve: bool,
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

enum Parsed {
    Run(Options),
    Exit,
}

fn parse_args(args: &[String]) -> Parsed {
    let mut opts = Options::default();
    let mut i = 1;

    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("nirstream {} ({})", nirstream::VERSION, nirstream_core::BUILD_DATE);
                return Parsed::Exit;
            }
            "--help" | "-h" => {
                print_help();
                return Parsed::Exit;
            }
            "--simulate" | "-s" => opts.simulate = true,
            "--serve" => opts.serve = true,
            "--seconds" | "--rate" | "--config" | "--log-dir" => {
                let Some(value) = value else {
                    eprintln!("Error: {} requires a value", args[i]);
                    return Parsed::Exit;
                };
                match args[i].as_str() {
                    "--seconds" => match value.parse() {
                        Ok(n) => opts.seconds = Some(n),
                        Err(_) => {
                            eprintln!("Error: Invalid duration: {}", value);
                            return Parsed::Exit;
                        }
                    },
                    "--rate" => match value.parse() {
                        Ok(r) => opts.rate = Some(r),
                        Err(_) => {
                            eprintln!("Error: Invalid sampling rate: {}", value);
                            return Parsed::Exit;
                        }
                    },
                    "--config" => opts.config = Some(PathBuf::from(value)),
                    _ => opts.log_dir = Some(PathBuf::from(value)),
                }
                i += 2;
                continue;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Parsed::Exit;
            }
        }
        i += 1;
    }
    Parsed::Run(opts)
}

fn print_help() {
    println!("Usage: nirstream [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -s, --simulate        Record from the simulated instrument");
    println!("      --seconds N       Stop after N seconds (default: until Ctrl+C)");
    println!("      --rate HZ         Recording rate; must divide the raw rate");
    println!("      --serve           Serve the recording through the export server");
    println!("      --config PATH     Config file (default: <data dir>/nirstream/config.json)");
    println!("      --log-dir DIR     Also write daily rolling logs to DIR");
    println!("  -v, --version         Show version");
    println!("  -h, --help            Show this help");
    println!();
    println!("Examples:");
    println!("  nirstream --simulate --seconds 30 --rate 25");
    println!("  nirstream --simulate --serve");
}

fn demo_probe(rate: u32) -> Probe {
    Probe {
        name: "Simulated adult probe".to_string(),
        intensities: vec![40, 40, 40, 40, 40],
        gain: 2,
        pre_gain: 1,
        sampling_rate: rate,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Parsed::Run(opts) => opts,
        Parsed::Exit => return Ok(()),
    };

    let mut config = match &opts.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if let Some(rate) = opts.rate {
        config.sampling_rate = rate;
    }
    if opts.log_dir.is_some() {
        config.log_dir = opts.log_dir.clone();
    }
    let _log_guard = nirstream::logging::init(config.log_dir.as_deref())?;

    if !opts.simulate {
        println!("No hardware instrument driver is available in this build.");
        println!("Run with --simulate to record from the simulated instrument.");
        return Ok(());
    }

    run(opts, config).await
}

async fn run(opts: Options, config: AppConfig) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let calibration = Arc::new(StaticCalibration::new(Some(demo_probe(config.sampling_rate))));
    let (display_tx, mut display_rx) = mpsc::unbounded_channel();
    let (instrument, _control) = SimulatedInstrument::paced();

    let session = SessionHandle::spawn(
        Box::new(instrument),
        calibration,
        store.clone(),
        display_tx,
        config.session_options(),
    )?;

    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    let server = if opts.serve {
        let server =
            ExportServer::start(config.export_config(), store.clone(), Some(server_tx)).await?;
        server.state().follow_recording(RECORDING_ID);
        println!("Export server listening on port {}", server.port());
        Some(server)
    } else {
        drop(server_tx);
        None
    };

    if let Err(e) = session.start_recording(RECORDING_ID, false).await {
        error!("Failed to start recording: {}", e);
        println!("Error: {}", e);
        if let Some(server) = server {
            server.stop().await;
        }
        return Ok(());
    }

    println!("Recording at {} Hz. Press Ctrl+C to stop.", config.sampling_rate);
    println!("────────────────────────────────────────");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let started = Instant::now();
    let limit = opts.seconds.map(Duration::from_secs);
    let mut poll = tokio::time::interval(Duration::from_millis(100));

    while running.load(Ordering::SeqCst) && limit.map_or(true, |l| started.elapsed() < l) {
        tokio::select! {
            Some(event) = display_rx.recv() => match event {
                DisplayEvent::Toi(toi) => println!("TOI: {:>6.2} %", toi),
                DisplayEvent::Error(message) => {
                    println!("Error: {}", message);
                    break;
                }
                DisplayEvent::StateChanged(state) => info!(?state, "Session state"),
                _ => {}
            },
            Some(event) = server_rx.recv() => match event {
                ServerEvent::ClientConnected { client, addr } => {
                    println!("Export client {} connected from {}", client, addr);
                    if let Some(server) = &server {
                        if let Err(e) = server.state().start_stream() {
                            warn!("Could not start export stream: {}", e);
                        }
                    }
                }
                ServerEvent::ClientDisconnected { client } => {
                    println!("Export client {} disconnected", client);
                }
                ServerEvent::ClientMessage { client, message } => {
                    info!(%client, %message, "Export client message");
                }
                ServerEvent::Error(message) => warn!("Export server: {}", message),
                ServerEvent::StatusChanged(_) => {}
            },
            _ = poll.tick() => {}
        }
    }

    println!();
    println!("Stopping...");
    session.stop().await?;
    println!("Recorded {} rows.", store.row_count(RECORDING_ID));
    if let Some(server) = &server {
        server.state().finish_recording();
    }
    if let Some(server) = server {
        server.stop().await;
    }
    session.shutdown().await?;
    println!("Done.");

    Ok(())
}
