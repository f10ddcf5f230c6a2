//! glcd-emu - A graphical LCD controller emulator
//!
//! glcd-emu listens on a serial port or TCP endpoint for the framed command
//! and data stream a microcontroller would send to a monochrome GLCD, and
//! keeps an in-memory copy of the panel up to date.
//!
//! # Quick Start
//!
//! ```text
//! glcd-emu                          # Connect to the configured endpoint
//! glcd-emu -e 192.168.1.50:3580     # Connect to a device bridged over TCP
//! glcd-emu --demo                   # Drive the decoder from a simulated device
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use glcd_emu::config::{Config, LogConfig};
use glcd_emu::core::glcd::{encode_frame, BitOrder, InstructionFlag, StrategyKind, PAGE_HEIGHT};
use glcd_emu::core::listener::{ConnectionState, ListenerEvent, MSG_ACK, MSG_REQ};
use glcd_emu::core::options::{keys, ListenerOptions};
use glcd_emu::core::session::EmulatorSession;
use glcd_emu::core::transport::{MemoryPortService, PortService, TcpPortService};

/// Command line overrides
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    endpoint: Option<String>,
    width: Option<usize>,
    height: Option<usize>,
    strategy: Option<StrategyKind>,
    demo: bool,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("glcd-emu {}", VERSION);
}

fn print_help() {
    eprintln!("glcd-emu {} - A graphical LCD controller emulator", VERSION);
    eprintln!();
    eprintln!("Usage: glcd-emu [OPTIONS]");
    eprintln!();
    eprintln!("Connection options:");
    eprintln!("  -e, --endpoint <ADDR>  Device endpoint (host:port)");
    eprintln!("  -c, --config <PATH>    Config file (default: ~/.glcd-emu/config.toml)");
    eprintln!();
    eprintln!("Display options:");
    eprintln!("  -W, --width <N>        Display width in pixels (default: 128)");
    eprintln!("  -H, --height <N>       Display height in pixels (default: 64)");
    eprintln!("  --paged                Paged buffering, vertical bytes (default)");
    eprintln!("  --simple               Simple buffering, horizontal bytes");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  --demo                 Run against a simulated device and print the result");
    eprintln!("  -v, --version          Show version");
    eprintln!("  -h, --help             Show this help");
    eprintln!();
    eprintln!("Logging: set RUST_LOG (e.g. RUST_LOG=glcd_emu=debug) to override [log] level");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    // Fetch the value following a flag
    let value = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("Missing value for {}", flag))
    };

    while i < args.len() {
        let arg = args[i].clone();
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                parsed.config = Some(PathBuf::from(value(&mut i, &arg)?));
            }
            "-e" | "--endpoint" => {
                parsed.endpoint = Some(value(&mut i, &arg)?);
            }
            "-W" | "--width" => {
                let v = value(&mut i, &arg)?;
                parsed.width = Some(v.parse().map_err(|_| format!("Invalid width: {}", v))?);
            }
            "-H" | "--height" => {
                let v = value(&mut i, &arg)?;
                parsed.height = Some(v.parse().map_err(|_| format!("Invalid height: {}", v))?);
            }
            "--paged" => parsed.strategy = Some(StrategyKind::Paged),
            "--simple" => parsed.strategy = Some(StrategyKind::Simple),
            "--demo" => parsed.demo = true,
            other => {
                return Err(format!("Unknown argument: {}. Use -h for help.", other));
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// Log to the configured file, or stderr when none is set
fn init_logging(log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    match &log.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(),
    };

    // Command line overrides the config file
    if let Some(endpoint) = &args.endpoint {
        config.connection.endpoint = endpoint.clone();
    }
    if let Some(width) = args.width {
        config.display.width = width;
    }
    if let Some(height) = args.height {
        config.display.height = height;
    }
    if let Some(strategy) = args.strategy {
        config.display.strategy = strategy;
    }

    init_logging(&config.log)?;
    info!("glcd-emu {} starting...", VERSION);

    if args.demo {
        return run_demo(&config);
    }
    run(&config)
}

/// Listen on the configured endpoint until the connection ends
fn run(config: &Config) -> anyhow::Result<()> {
    let mut session = EmulatorSession::new(
        config.pixel_buffer(),
        config.display.strategy,
        config.display.bit_order,
        config.timing(),
    );

    let service: Arc<dyn PortService> = Arc::new(TcpPortService);
    let options = config.to_listener_options(service);
    session
        .start(&options)
        .with_context(|| format!("Failed to start listener on {}", config.connection.endpoint))?;

    while session.is_running() {
        match session.next_event(Duration::from_millis(200)) {
            Some(ListenerEvent::Message(text)) => info!("{}", text),
            Some(ListenerEvent::DisplayChanged(flags)) => info!("Display flags: {:?}", flags),
            Some(ListenerEvent::BufferUpdated(region)) => {
                debug!("Updated {}x{} at ({}, {})", region.width(), region.height(), region.x0, region.y0)
            }
            Some(_) | None => {}
        }
    }

    match session.stop() {
        Some(result) => result.context("Listener failed")?,
        None => warn!("Listener was not running"),
    }
    println!("{}", session.buffer().read());
    Ok(())
}

/// Bits of a paged frame: a border and a diagonal
fn demo_frame(width: usize, height: usize, bit_order: BitOrder) -> Vec<u8> {
    let pages = height.div_ceil(PAGE_HEIGHT);
    let mask = |row: usize| match bit_order {
        BitOrder::MsbFirst => 0x80u8 >> row,
        BitOrder::LsbFirst => 0x01u8 << row,
    };

    let mut frame = Vec::with_capacity(width * pages);
    for page in 0..pages {
        for column in 0..width {
            let mut byte = 0u8;
            for row in 0..PAGE_HEIGHT {
                let y = page * PAGE_HEIGHT + row;
                if y >= height {
                    break;
                }
                let border = column == 0 || column + 1 == width || y == 0 || y + 1 == height;
                let diagonal = width > 0 && y == column * height / width;
                if border || diagonal {
                    byte |= mask(row);
                }
            }
            frame.push(byte);
        }
    }
    frame
}

/// Drive a full session from a simulated device over an in-memory port
fn run_demo(config: &Config) -> anyhow::Result<()> {
    let (width, height) = (config.display.width, config.display.height);
    let mut session = EmulatorSession::new(
        config.pixel_buffer(),
        StrategyKind::Paged,
        config.display.bit_order,
        config.timing(),
    );

    let service = Arc::new(MemoryPortService::new());
    let device = service.register("demo");
    device.reply_on(MSG_ACK, &[0x00]);
    device.send(&[MSG_REQ]);

    let port_service: Arc<dyn PortService> = service;
    let options = ListenerOptions::builder()
        .put(keys::PORT_SERVICE, port_service)
        .put(keys::PORT_NAME, "demo".to_string())
        .build();
    session.start(&options)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != ConnectionState::Streaming {
        if !session.is_running() || Instant::now() >= deadline {
            anyhow::bail!("Demo device never connected (state: {})", session.state());
        }
        session.next_event(Duration::from_millis(50));
    }

    // Display on, home the cursor, then one full frame
    device.send(&encode_frame(InstructionFlag::Command, &[0xAF, 0xB0, 0x00, 0x10]));
    device.send(&encode_frame(InstructionFlag::Data, &demo_frame(width, height, config.display.bit_order)));

    while device.pending() > 0 {
        if Instant::now() >= deadline {
            anyhow::bail!("Demo device stalled with {} bytes pending", device.pending());
        }
        for event in session.poll_events() {
            if let ListenerEvent::Message(text) = event {
                info!("{}", text);
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));

    if let Some(result) = session.stop() {
        result?;
    }

    let buffer = session.buffer().read();
    println!("=== glcd-emu demo ({}x{}, {} pixels lit) ===\n", width, height, buffer.count_lit());
    println!("{}", buffer);
    Ok(())
}
