//! canmond - CAN channel monitor daemon
//!
//! Opens one session per selected device, prints every received frame and
//! answers it with the autoresponder.
//!
//! # Usage
//!
//! ```bash
//! # Mock driver, one session on USBBUS1 at the remembered baud rate
//! canmond run --start USBBUS1
//!
//! # SocketCAN, two channels at explicit rates
//! canmond --driver socketcan run --start USBBUS1@500k --start USBBUS2@250k
//!
//! # List responding channels
//! canmond --driver socketcan probe
//! ```

mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canmon_core::driver::{CHANNEL_AVAILABLE, CHANNEL_OCCUPIED};
use canmon_core::{
    spawn_sink, BaudRate, BusDriver, ChannelHandle, DriverParameter, LogicalDeviceId,
};
use canmon_session::config::{
    DeviceConfig, DriverConfig, MockConfig, SocketCanConfig,
};
use canmon_session::driver::create_driver;
use canmon_session::{
    probe_channels, CanmonConfig, DeviceWatcher, JsonPreferenceStore, MemoryPreferenceStore,
    PreferenceStore, SessionManager, StartRequest,
};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::sink::{ConsoleSink, FrameFormat};

#[derive(Parser, Debug)]
#[command(name = "canmond")]
#[command(author, version, about = "CAN channel monitor with autoresponder")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CANMON_CONFIG")]
    config: Option<PathBuf>,

    /// Bus driver, overrides the config file
    #[arg(long, value_enum)]
    driver: Option<DriverKind>,

    /// SocketCAN interface prefix (handle N uses `{prefix}{N-1}`)
    #[arg(long)]
    interface_prefix: Option<String>,

    /// Baud-rate preference file, overrides the config file
    #[arg(long, env = "CANMON_PREFERENCES")]
    preferences: Option<PathBuf>,

    /// Keep baud-rate preferences in memory only
    #[arg(long, conflicts_with = "preferences")]
    no_preferences: bool,

    /// Log format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Monitor channels until Ctrl+C (default)
    Run {
        /// Start a session: DEVICE or DEVICE@BAUD (e.g. USBBUS1@500k)
        #[arg(short, long = "start", value_name = "DEVICE[@BAUD]", value_parser = parse_start)]
        start: Vec<DeviceConfig>,

        /// Frame output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: FrameFormat,

        /// Do not print frames
        #[arg(short, long)]
        quiet: bool,
    },

    /// Poll all channel handles once and list the responding ones
    Probe {
        /// Only report these channels (e.g. `USBBUS2` or `2`)
        #[arg(value_name = "CHANNEL")]
        channels: Vec<ChannelHandle>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    Mock,
    Socketcan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_start(value: &str) -> Result<DeviceConfig, String> {
    let (device, baud) = match value.split_once('@') {
        Some((device, baud)) => (device, Some(baud.parse::<BaudRate>().map_err(|e| e.to_string())?)),
        None => (value, None),
    };
    if device.trim().is_empty() {
        return Err("device must not be empty".to_string());
    }
    Ok(DeviceConfig {
        device: LogicalDeviceId::new(device.trim()),
        baud,
    })
}

fn init_logging(format: LogFormat, verbose: u8) {
    let default_filter = match verbose {
        0 => "canmond=info,canmon_session=info,canmon_core=info",
        1 => "canmond=debug,canmon_session=debug,canmon_core=debug",
        _ => "canmond=trace,canmon_session=trace,canmon_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr; stdout carries the frames
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn load_config(cli: &Cli) -> Result<CanmonConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            CanmonConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => {
            info!("No config file provided, using defaults");
            CanmonConfig::default()
        }
    };

    match cli.driver {
        Some(DriverKind::Mock) if !matches!(config.driver, DriverConfig::Mock(_)) => {
            config.driver = DriverConfig::Mock(MockConfig::default());
        }
        Some(DriverKind::Socketcan) if !matches!(config.driver, DriverConfig::SocketCan(_)) => {
            config.driver = DriverConfig::SocketCan(SocketCanConfig::default());
        }
        _ => {}
    }

    if let Some(prefix) = &cli.interface_prefix {
        match &mut config.driver {
            DriverConfig::SocketCan(cfg) => cfg.interface_prefix = prefix.clone(),
            DriverConfig::Mock(_) => warn!("--interface-prefix ignored for the mock driver"),
        }
    }

    if let Some(path) = &cli.preferences {
        config.preferences_path = Some(path.clone());
    }

    Ok(config)
}

fn preference_store(cli: &Cli, config: &CanmonConfig) -> Arc<dyn PreferenceStore> {
    if cli.no_preferences {
        return Arc::new(MemoryPreferenceStore::new());
    }
    match config.resolved_preferences_path() {
        Some(path) => {
            info!(path = %path.display(), "Using baud preference file");
            Arc::new(JsonPreferenceStore::new(path))
        }
        None => {
            warn!("No config directory available, baud preferences are not persisted");
            Arc::new(MemoryPreferenceStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);

    let config = load_config(&cli)?;
    let driver = create_driver(&config.driver).context("Failed to create bus driver")?;
    info!(driver = driver.name(), "Bus driver ready");

    match &cli.command {
        Some(Commands::Probe { channels }) => probe(driver, channels).await,
        Some(Commands::Run {
            start,
            output,
            quiet,
        }) => run(&cli, config, driver, start, *output, *quiet).await,
        None => run(&cli, config, driver, &[], FrameFormat::Text, false).await,
    }
}

async fn probe(driver: Arc<dyn BusDriver>, only: &[ChannelHandle]) -> Result<()> {
    let probe_driver = driver.clone();
    let list = tokio::task::spawn_blocking(move || probe_channels(probe_driver.as_ref()))
        .await
        .context("Probe task failed")?;

    if list.is_empty() {
        println!("No channels responding");
        return Ok(());
    }

    for channel in &list.channels {
        let Some(handle) = channel.handle else {
            continue;
        };
        if !only.is_empty() && !only.contains(&handle) {
            continue;
        }
        let condition = match driver.get_value(handle, DriverParameter::ChannelCondition) {
            Ok(CHANNEL_AVAILABLE) => "available",
            Ok(CHANNEL_OCCUPIED) => "occupied",
            Ok(_) | Err(_) => "unknown",
        };
        println!(
            "{:<10} device {:<6} {}",
            channel.device,
            channel
                .device_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            condition
        );
    }
    Ok(())
}

async fn run(
    cli: &Cli,
    config: CanmonConfig,
    driver: Arc<dyn BusDriver>,
    start: &[DeviceConfig],
    output: FrameFormat,
    quiet: bool,
) -> Result<()> {
    info!("Starting canmond");

    let manager = Arc::new(
        SessionManager::new(driver.clone(), config.monitor.clone())
            .with_preference_store(preference_store(cli, &config)),
    );

    let sink_handle = (!quiet).then(|| spawn_sink(manager.subscribe(), ConsoleSink::stdout(output)));

    let (watcher, reconcile_handle) = if config.discovery.enabled {
        let watcher = DeviceWatcher::spawn(driver.clone(), config.discovery.interval());
        let handle = spawn_reconcile(
            manager.clone(),
            &watcher,
            config.discovery.stop_on_unplug,
        );
        (Some(watcher), Some(handle))
    } else {
        (None, None)
    };

    let entries: Vec<DeviceConfig> = config.devices.iter().chain(start).cloned().collect();

    // Ctrl+C during a slow autostart still goes through shutdown; starts
    // already in flight finish and are torn down there
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let interrupted = tokio::select! {
        result = &mut ctrl_c => {
            result?;
            true
        }
        () = autostart(&manager, &entries) => false,
    };

    if !interrupted {
        if manager.sessions().await.is_empty() {
            warn!("No active sessions; waiting for Ctrl+C");
        }
        ctrl_c.await?;
    }
    info!("Shutting down...");

    if let Some(handle) = reconcile_handle {
        handle.abort();
        let _ = handle.await;
    }
    drop(watcher);

    for (device, e) in manager.shutdown().await {
        error!(%device, error = %e, "Session did not stop cleanly");
    }

    // Last sender goes with the manager; the sink drains and exits
    drop(manager);
    if let Some(handle) = sink_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    info!("canmond stopped");
    Ok(())
}

/// Start the configured and command-line sessions, logging failures
async fn autostart(manager: &SessionManager, entries: &[DeviceConfig]) {
    for entry in entries {
        let request = StartRequest {
            device: Some(entry.device.clone()),
            baud: Some(
                entry
                    .baud
                    .unwrap_or_else(|| manager.baud_selection(&entry.device)),
            ),
        };
        match manager.start(request).await {
            Ok(session) => info!(
                device = %session.device,
                handle = %session.handle,
                baud = %session.baud,
                "Monitoring"
            ),
            Err(e) => error!(device = %entry.device, error = %e, "Failed to start session"),
        }
    }
}

/// Apply every new device list to the session manager
fn spawn_reconcile(
    manager: Arc<SessionManager>,
    watcher: &DeviceWatcher,
    stop_on_unplug: bool,
) -> JoinHandle<()> {
    let mut devices = watcher.subscribe();

    tokio::spawn(async move {
        while devices.changed().await.is_ok() {
            let list = devices.borrow_and_update().clone();
            let outcome = manager.reconcile(&list).await;

            if !outcome.available.is_empty() {
                info!(devices = ?outcome.available, "Devices available");
            }
            for device in outcome.vanished {
                if !stop_on_unplug {
                    warn!(%device, "Device disappeared");
                    continue;
                }
                warn!(%device, "Device disappeared, stopping session");
                if let Err(e) = manager.stop(&device).await {
                    warn!(%device, error = %e, "Failed to stop session of vanished device");
                }
            }
        }
    })
}
