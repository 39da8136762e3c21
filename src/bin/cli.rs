//! Botlink CLI - Command-line interface
//!
//! Headless front end for discovery and sequence runs, for automation and
//! for driving the robot without the block editor.

use anyhow::Context;
use botlink_core::cli::print_exit_codes;
use botlink_core::config::{config_file, log_dir, AppConfig};
use botlink_core::core::transport::{
    EndpointScanner, HardwareFactory, TransportFactory, VirtualFactory, VirtualLog, VirtualScanner,
};
use botlink_core::utils::init_logging;
use botlink_core::{
    CliResult, Command, CommandSequence, ConnectionEvent, ConnectionManager, DeviceRegistry,
    DiscoveryOptions, Endpoint, EndpointKind, ExecutionEvent, ExecutionPhase, ExitCodes,
    OutputFormat, RegistryEvent, SequenceExecutor,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Botlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "botlink",
    version,
    about = "Drive a Bluetooth robot with timed motion-command sequences",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "BOTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Also write a JSON log file (default directory unless `logging.directory` is set)
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover Bluetooth serial ports and BLE peripherals
    Scan {
        /// BLE scan window (seconds)
        #[arg(long)]
        ble_timeout: Option<u64>,

        /// Serial enumeration bound (milliseconds)
        #[arg(long)]
        serial_timeout_ms: Option<u64>,

        /// Report the virtual robot instead of scanning
        #[arg(long)]
        dry_run: bool,
    },

    /// Connect and run a command sequence
    ///
    /// Steps use the form `action[:value]`, e.g. `forward:2 speed:9 left:90 stop`.
    Run {
        /// Serial device path of a Bluetooth SPP module
        #[arg(long, conflicts_with = "ble", required_unless_present_any = ["ble", "dry_run"])]
        serial: Option<String>,

        /// BLE peripheral address
        #[arg(long)]
        ble: Option<String>,

        /// Send frames to the in-memory virtual robot
        #[arg(long)]
        dry_run: bool,

        /// Sequence steps
        #[arg(required = true)]
        steps: Vec<Command>,
    },

    /// Show the effective configuration
    Config {
        /// Print only the configuration file path
        #[arg(long)]
        path: bool,
    },

    /// List exit codes
    ExitCodes,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return CliResult::from(e).to_exit_code();
        }
    };

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    } else if cli.quiet {
        logging.level = "error".to_string();
    }
    if cli.log_file && logging.directory.is_none() {
        logging.directory = log_dir();
    }
    let _log_guard = match init_logging(&logging) {
        Ok(guard) => {
            if let (true, Some(dir)) = (cli.verbose, guard.log_dir()) {
                eprintln!("Logging to {}", dir.display());
            }
            Some(guard)
        }
        Err(e) => {
            eprintln!("Warning: {e:#}");
            None
        }
    };

    tracing::debug!("Starting botlink v{}", botlink_core::VERSION);

    let result = match &cli.command {
        Commands::Scan { ble_timeout, serial_timeout_ms, dry_run } => {
            scan(&cli, &config, *ble_timeout, *serial_timeout_ms, *dry_run).await
        }
        Commands::Run { serial, ble, dry_run, steps } => {
            run(&cli, &config, serial.as_deref(), ble.as_deref(), *dry_run, steps).await
        }
        Commands::Config { path } => show_config(&cli, &config, *path),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    };

    let result =
        result.unwrap_or_else(|e| CliResult::error(ExitCodes::ERROR, format!("{e:#}")));
    match &result {
        CliResult::Success(Some(msg)) if !cli.quiet => eprintln!("{msg}"),
        CliResult::Error(_, msg) => eprintln!("Error: {msg}"),
        _ => {}
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> Result<AppConfig, botlink_core::ConfigError> {
    match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

fn virtual_endpoints() -> (Endpoint, Endpoint) {
    (
        Endpoint::serial("virtual0", "Virtual robot (SPP)"),
        Endpoint::ble("00:00:00:00:00:01", "Virtual robot (BLE)"),
    )
}

async fn scan(
    cli: &Cli,
    config: &AppConfig,
    ble_timeout: Option<u64>,
    serial_timeout_ms: Option<u64>,
    dry_run: bool,
) -> anyhow::Result<CliResult> {
    let registry = if dry_run {
        let (spp, ble) = virtual_endpoints();
        let serial: Arc<dyn EndpointScanner> =
            Arc::new(VirtualScanner::new(EndpointKind::Serial, vec![spp]));
        let ble: Arc<dyn EndpointScanner> = Arc::new(
            VirtualScanner::new(EndpointKind::Ble, vec![ble]).with_interval(Duration::from_millis(300)),
        );
        DeviceRegistry::new(vec![serial, ble])
    } else {
        DeviceRegistry::with_hardware(config)
    };

    let mut options = DiscoveryOptions::from_config(config);
    if let Some(secs) = ble_timeout {
        options.ble_scan_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = serial_timeout_ms {
        options.serial_timeout = Duration::from_millis(ms);
    }

    if !cli.quiet && cli.format == OutputFormat::Text {
        eprintln!("Scanning ({}s BLE window)...", options.ble_scan_timeout.as_secs());
    }

    let mut events = registry.subscribe();
    let discovery = registry.spawn_discover(options);
    loop {
        match events.recv().await {
            Ok(RegistryEvent::EndpointFound(endpoint)) => match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&endpoint)?),
                OutputFormat::Text => println!("{endpoint}"),
            },
            Ok(RegistryEvent::ScanFailed { message, .. }) => {
                if !cli.quiet {
                    eprintln!("Warning: {message}");
                }
            }
            Ok(RegistryEvent::DiscoveryFinished { .. }) | Err(RecvError::Closed) => break,
            Ok(RegistryEvent::DiscoveryStarted) | Err(RecvError::Lagged(_)) => {}
        }
    }

    let endpoints = discovery.await.context("Discovery task failed")?;
    if endpoints.is_empty() {
        return Ok(CliResult::success_with_message("No devices found."));
    }
    Ok(CliResult::success_with_message(format!("{} device(s) found.", endpoints.len())))
}

fn print_connection_event(cli: &Cli, event: &ConnectionEvent) -> anyhow::Result<()> {
    if cli.quiet {
        return Ok(());
    }
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => {
            let target = event.endpoint_description.as_deref().unwrap_or("-");
            match &event.error_message {
                Some(err) => eprintln!("[{}] {target}: {err}", event.status),
                None => eprintln!("[{}] {target}", event.status),
            }
        }
    }
    Ok(())
}

fn print_execution_event(format: OutputFormat, quiet: bool, event: &ExecutionEvent) {
    if quiet {
        return;
    }
    match format {
        OutputFormat::Json => {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
        }
        OutputFormat::Text => {
            let message = event.message.as_deref().unwrap_or_default();
            match event.step_index {
                Some(index) => println!("  {:>3}. {message}", index + 1),
                None => println!("{}: {message}", event.phase),
            }
        }
    }
}

async fn run(
    cli: &Cli,
    config: &AppConfig,
    serial: Option<&str>,
    ble: Option<&str>,
    dry_run: bool,
    steps: &[Command],
) -> anyhow::Result<CliResult> {
    let endpoint = match (serial, ble) {
        (Some(path), _) => Endpoint::serial(path, path),
        (None, Some(address)) => Endpoint::ble(address, address),
        (None, None) => virtual_endpoints().0,
    };

    let wire_log = VirtualLog::new();
    let factory: Arc<dyn TransportFactory> = if dry_run {
        Arc::new(VirtualFactory::new(wire_log.clone()))
    } else {
        Arc::new(HardwareFactory::new(config.clone()))
    };

    let connection = Arc::new(ConnectionManager::new(factory));
    let mut connection_events = connection.subscribe();
    connection.select_endpoint(endpoint);
    let connected = connection.connect().await;
    while let Ok(event) = connection_events.try_recv() {
        print_connection_event(cli, &event)?;
    }
    if let Err(e) = connected {
        return Ok(CliResult::from(e));
    }
    if let (false, OutputFormat::Text, Some(info)) =
        (cli.quiet, cli.format, connection.connection_info().await)
    {
        eprintln!("Link: {info}");
    }

    let executor = Arc::new(SequenceExecutor::with_settings(
        Arc::clone(&connection),
        &config.execution,
    ));
    let sequence: CommandSequence = steps.iter().copied().collect();
    if !cli.quiet && cli.format == OutputFormat::Text {
        let eta = executor.encoder().estimated_duration(sequence.commands());
        eprintln!("{} steps, about {:.1}s. Press Ctrl+C to stop.", sequence.len(), eta.as_secs_f64());
    }

    let mut events = executor.subscribe();
    let handle = match executor.run(sequence.snapshot()) {
        Ok(handle) => handle,
        Err(e) => {
            connection.disconnect().await;
            return Ok(CliResult::from(e));
        }
    };

    let on_interrupt = Arc::clone(&executor);
    ctrlc::set_handler(move || on_interrupt.cancel()).context("Failed to install Ctrl+C handler")?;

    let (format, quiet) = (cli.format, cli.quiet);
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_execution_event(format, quiet, &event);
                    if matches!(event.phase, ExecutionPhase::Completed | ExecutionPhase::Cancelled) {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = handle.wait().await;
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    if dry_run && !cli.quiet && cli.format == OutputFormat::Text {
        let frames = wire_log.frames();
        eprintln!("Frames sent to the virtual robot:");
        for frame in &frames {
            eprintln!("  {}", frame.escape_ascii());
        }
    }

    if let (true, Some(stats)) = (cli.verbose, connection.stats().await) {
        eprintln!(
            "Link statistics: {} frames, {} bytes, {} errors",
            stats.frames_sent, stats.bytes_sent, stats.errors
        );
    }

    connection.disconnect().await;
    while let Ok(event) = connection_events.try_recv() {
        print_connection_event(cli, &event)?;
    }

    Ok(CliResult::from(&outcome))
}

fn show_config(cli: &Cli, config: &AppConfig, path_only: bool) -> anyhow::Result<CliResult> {
    if path_only {
        let path = cli
            .config
            .clone()
            .or_else(config_file)
            .context("No configuration directory on this platform")?;
        println!("{}", path.display());
        return Ok(CliResult::success());
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", toml::to_string_pretty(config)?),
    }
    Ok(CliResult::success())
}
