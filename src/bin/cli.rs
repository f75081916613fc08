//! Benchlink CLI - Command-line interface
//!
//! Headless access to discovery, serial sessions, cameras and the relay box.

use benchlink_core::cli::{ExitStatus, Outcome};
use benchlink_core::config::{captures_dir, log_dir};
use benchlink_core::core::capture::{BackendKind, SyntheticBackend, SyntheticCamera};
use benchlink_core::core::hub::FrameSink;
use benchlink_core::core::logger::{init_logging, mirror_bus_log};
use benchlink_core::core::relay::SimulatedRelay;
use benchlink_core::{
    AppConfig, BackendSet, CameraSettings, DeviceHub, Event, Frame, HubError, PortProvider,
    SimulatedPorts, SystemPorts, Topic,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Benchlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "benchlink",
    version,
    about = "Bench device orchestration: serial discovery, sessions, cameras, relay",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Config file (.toml, .yaml); defaults to the platform config dir
    #[arg(short, long, global = true, env = "BENCHLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Use simulated ports, cameras and relay instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports and how discovery would treat them
    Ports,

    /// Probe every port and report which one answers
    Scan,

    /// Open a port (or the scan winner) and print everything it sends
    Monitor {
        /// Serial port name (e.g., COM3, /dev/ttyUSB0); scans when omitted
        #[arg(short, long)]
        port: Option<String>,

        /// Exit after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Send one command line and print the replies
    Send {
        /// Serial port name; scans when omitted
        #[arg(short, long)]
        port: Option<String>,

        /// How long to wait for replies (ms)
        #[arg(long, default_value = "1000")]
        wait: u64,

        /// Command text
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Run a camera for a while, optionally saving a snapshot
    Camera {
        /// Camera name from the config
        #[arg(short, long)]
        name: String,

        /// Device index when the camera is not configured
        #[arg(long, default_value = "0")]
        index: u32,

        /// Backend override (auto, dshow, msmf, v4l2, avfoundation, any)
        #[arg(long)]
        backend: Option<String>,

        /// Capture duration
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Save the last frame as PNG into this folder
        #[arg(long)]
        snapshot: Option<Option<PathBuf>>,
    },

    /// Run a relay action (USB_ON, USB_OFF, LIGHT_ON, LIGHT_OFF)
    Relay {
        /// Action name
        action: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match run(&cli).await {
        Ok(result) => result,
        Err(e) => match e.downcast_ref::<HubError>() {
            Some(hub_error) => Outcome::from(hub_error),
            None => Outcome::fail(ExitStatus::Error, e.to_string()),
        },
    };

    match (result.is_success(), result.message()) {
        (true, Some(msg)) => println!("{msg}"),
        (false, Some(msg)) => eprintln!("error: {msg}"),
        (_, None) => {}
    }
    result.into()
}

async fn run(cli: &Cli) -> anyhow::Result<Outcome> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    } else if cli.quiet {
        config.logging.level = "error".to_string();
    }
    if config.logging.folder.is_none() {
        config.logging.folder = log_dir();
    }
    let _log = init_logging(&config.logging)?;
    tracing::debug!("Benchlink v{}", benchlink_core::VERSION);

    match &cli.command {
        Commands::Ports => list_ports(cli, &config),
        Commands::Scan => scan(cli, config).await,
        Commands::Monitor { port, seconds } => monitor(cli, config, port.as_deref(), *seconds).await,
        Commands::Send {
            port,
            wait,
            command,
        } => send(cli, config, port.as_deref(), *wait, &command.join(" ")).await,
        Commands::Camera {
            name,
            index,
            backend,
            seconds,
            snapshot,
        } => {
            camera(
                cli,
                config,
                name,
                *index,
                backend.as_deref(),
                *seconds,
                snapshot.clone(),
            )
            .await
        }
        Commands::Relay { action } => tokio::task::block_in_place(|| relay(cli, config, action)),
    }
}

fn port_provider(cli: &Cli, config: &AppConfig) -> Arc<dyn PortProvider> {
    if cli.simulate {
        Arc::new(SimulatedPorts::demo(&config.serial.pong_prefix))
    } else {
        Arc::new(SystemPorts::new())
    }
}

fn capture_backends(cli: &Cli, config: &AppConfig) -> BackendSet {
    if !cli.simulate {
        // no OS capture backend is built in; cameras report "not available"
        return BackendSet::new();
    }
    let mut set = BackendSet::new();
    for kind in [BackendKind::Any, BackendKind::Synthetic] {
        let backend = SyntheticBackend::new(kind);
        for camera in &config.cameras {
            backend.set_camera(camera.index, SyntheticCamera::streaming());
        }
        set.register(Arc::new(backend));
    }
    set
}

fn build_hub(cli: &Cli, config: AppConfig) -> Result<DeviceHub, HubError> {
    let ports = port_provider(cli, &config);
    let backends = capture_backends(cli, &config);
    let mirror = config.logging.also_log_serial;
    let hub = DeviceHub::new(config, ports, Arc::new(backends), None)?;
    if mirror {
        mirror_bus_log(hub.bus());
    }
    Ok(hub)
}

fn install_ctrlc() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn list_ports(cli: &Cli, config: &AppConfig) -> anyhow::Result<Outcome> {
    let ports = port_provider(cli, config).list_ports()?;

    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&ports)?);
        }
        OutputFormat::Text => {
            if ports.is_empty() {
                if !cli.quiet {
                    println!("No serial ports found.");
                }
                return Ok(Outcome::ok());
            }
            println!("{:<20} {:<40} {}", "Port", "Description", "Probed");
            println!("{:-<70}", "");
            for port in &ports {
                println!(
                    "{:<20} {:<40} {}",
                    port.device_name,
                    port.description,
                    if port.bluetooth { "no (bluetooth)" } else { "yes" }
                );
            }
        }
    }
    Ok(Outcome::ok())
}

async fn next_scan_result(rx: &mut UnboundedReceiver<Event>, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn scan_budget(config: &AppConfig, ports: usize) -> Duration {
    let per_port = config.serial.settle_delay() + config.serial.scan_timeout();
    per_port * ports.max(1) as u32 + Duration::from_secs(5)
}

async fn scan(cli: &Cli, config: AppConfig) -> anyhow::Result<Outcome> {
    let hub = build_hub(cli, config)?;
    let (_id, mut results) = hub.bus().subscribe_channel(Topic::ScanResult);
    let visible = port_provider(cli, hub.config()).list_ports().map(|p| p.len()).unwrap_or(0);

    if !cli.quiet {
        eprintln!("Scanning {visible} port(s)...");
    }
    hub.scan();

    let Some(Event::ScanResult(report)) =
        next_scan_result(&mut results, scan_budget(hub.config(), visible)).await
    else {
        tokio::task::block_in_place(|| hub.shutdown());
        return Ok(Outcome::fail(ExitStatus::Timeout, "Scan did not finish"));
    };
    tokio::task::block_in_place(|| hub.shutdown());

    match cli.format {
        OutputFormat::Json => println!("{}", Event::ScanResult(report.clone()).to_json()),
        OutputFormat::Text => {
            println!("Ports: {}", report.ports.join(", "));
            println!("Best:  {}", report.best.as_deref().unwrap_or("-"));
        }
    }
    Ok(match report.best {
        Some(_) => Outcome::ok(),
        None => Outcome::fail(ExitStatus::NoResponder, "No device answered the probe"),
    })
}

/// Open `port`, or scan and open the winner
async fn open_session(
    cli: &Cli,
    hub: &DeviceHub,
    port: Option<&str>,
) -> anyhow::Result<Option<Outcome>> {
    if let Some(port) = port {
        let opened = tokio::task::block_in_place(|| hub.connect(Some(port)));
        return Ok(opened.err().map(|e| Outcome::from(&e)));
    }

    let (_id, mut results) = hub.bus().subscribe_channel(Topic::ScanResult);
    let visible = port_provider(cli, hub.config()).list_ports().map(|p| p.len()).unwrap_or(0);
    hub.scan();
    let best = match next_scan_result(&mut results, scan_budget(hub.config(), visible)).await {
        Some(Event::ScanResult(report)) => report.best,
        _ => None,
    };
    let Some(best) = best else {
        return Ok(Some(Outcome::fail(
            ExitStatus::NoResponder,
            "No device answered the probe",
        )));
    };
    if !cli.quiet {
        eprintln!("Found device on {best}");
    }
    let opened = tokio::task::block_in_place(|| hub.connect(Some(&best)));
    Ok(opened.err().map(|e| Outcome::from(&e)))
}

fn print_line(cli: &Cli, line: &str) {
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "line": line })),
        OutputFormat::Text => println!("{line}"),
    }
}

async fn monitor(
    cli: &Cli,
    config: AppConfig,
    port: Option<&str>,
    seconds: Option<u64>,
) -> anyhow::Result<Outcome> {
    let hub = build_hub(cli, config)?;
    let (_id, mut lines) = hub.bus().subscribe_channel(Topic::LogLine);
    let (_state_id, mut states) = hub.bus().subscribe_channel(Topic::ConnState);
    let running = install_ctrlc()?;

    if let Some(failure) = open_session(cli, &hub, port).await? {
        tokio::task::block_in_place(|| hub.shutdown());
        return Ok(failure);
    }
    if !cli.quiet {
        eprintln!("Connected. Press Ctrl+C to exit.");
    }

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut lost = false;
    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        tokio::select! {
            Some(event) = lines.recv() => {
                if let Some(line) = event.as_log_line() {
                    print_line(cli, line);
                }
            }
            Some(Event::ConnState(state)) = states.recv() => {
                if !state.connected {
                    lost = true;
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    tokio::task::block_in_place(|| hub.shutdown());
    Ok(if lost {
        Outcome::fail(ExitStatus::ConnectionFailed, "Connection lost")
    } else if running.load(Ordering::SeqCst) {
        Outcome::ok()
    } else {
        Outcome::fail(ExitStatus::Cancelled, "Interrupted")
    })
}

async fn send(
    cli: &Cli,
    config: AppConfig,
    port: Option<&str>,
    wait: u64,
    command: &str,
) -> anyhow::Result<Outcome> {
    let hub = build_hub(cli, config)?;
    if let Some(failure) = open_session(cli, &hub, port).await? {
        tokio::task::block_in_place(|| hub.shutdown());
        return Ok(failure);
    }

    let (_id, mut lines) = hub.bus().subscribe_channel(Topic::LogLine);
    if let Err(e) = hub.send(command) {
        tokio::task::block_in_place(|| hub.shutdown());
        return Ok(Outcome::from(&e));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(wait);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, lines.recv()).await {
        if let Some(line) = event.as_log_line() {
            print_line(cli, line);
        }
    }

    tokio::task::block_in_place(|| hub.shutdown());
    Ok(Outcome::ok())
}

async fn camera(
    cli: &Cli,
    mut config: AppConfig,
    name: &str,
    index: u32,
    backend: Option<&str>,
    seconds: u64,
    snapshot: Option<Option<PathBuf>>,
) -> anyhow::Result<Outcome> {
    if config.camera(name).is_none() {
        config.cameras.push(CameraSettings::new(name, index));
    }
    if let Some(backend) = backend {
        let kind: BackendKind = backend.parse()?;
        for camera in config.cameras.iter_mut().filter(|c| c.name == name) {
            camera.backend = kind;
        }
    }

    let frames = Arc::new(AtomicU64::new(0));
    let counter = frames.clone();
    let sink: FrameSink = Arc::new(move |_: &str, _: &Frame| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let ports = port_provider(cli, &config);
    let backends = capture_backends(cli, &config);
    let hub = DeviceHub::new(config, ports, Arc::new(backends), Some(sink))?;
    let (_id, mut lines) = hub.bus().subscribe_channel(Topic::LogLine);
    let running = install_ctrlc()?;

    hub.start_camera(name)?;
    let Some(worker) = hub.camera(name) else {
        return Ok(Outcome::fail(ExitStatus::InvalidArgs, format!("Unknown camera: {name}")));
    };

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while running.load(Ordering::SeqCst) && Instant::now() < deadline && worker.is_running() {
        while let Ok(event) = lines.try_recv() {
            if cli.quiet {
                continue;
            }
            if let Some(line) = event.as_log_line() {
                eprintln!("{line}");
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let opened = worker.is_opened();
    let backend = worker.actual_backend();
    let saved = match (&snapshot, opened) {
        (Some(dir), true) => {
            let dir = dir.clone().or_else(captures_dir).unwrap_or_else(|| PathBuf::from("."));
            Some(worker.snapshot(&dir)?)
        }
        _ => None,
    };
    tokio::task::block_in_place(|| hub.shutdown());

    if !opened {
        return Ok(Outcome::fail(
            ExitStatus::CameraUnavailable,
            format!("Camera {name} not available"),
        ));
    }

    let count = frames.load(Ordering::Relaxed);
    match cli.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "camera": name,
                "backend": backend.map(|b| b.label()),
                "frames": count,
                "snapshot": saved,
            })
        ),
        OutputFormat::Text => {
            println!(
                "{name}: {count} frame(s) via {}",
                backend.map_or("-", |b| b.label())
            );
            if let Some(path) = saved {
                println!("Snapshot: {}", path.display());
            }
        }
    }
    Ok(Outcome::ok())
}

fn relay(cli: &Cli, config: AppConfig, action: &str) -> anyhow::Result<Outcome> {
    let simulated = SimulatedRelay::new();
    let mut hub = build_hub(cli, config)?;
    if cli.simulate {
        hub.attach_relay(Box::new(simulated.clone()));
    }
    let result = hub.relay_action(action);
    hub.shutdown();
    result?;
    if cli.simulate && !cli.quiet {
        eprintln!("Relay received: {}", simulated.commands().join(", "));
    }
    Ok(Outcome::ok())
}
