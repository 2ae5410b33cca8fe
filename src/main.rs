use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use pca301_lib::device::{DeviceStore, JsonFileStore, NotificationSink};
use pca301_lib::serial::list_serial_ports;
use pca301_lib::{DeviceEvent, DeviceId, DeviceManager, DeviceState, EngineConfig, SerialInterface};

#[derive(Parser)]
#[command(
    name = "pca301",
    version,
    about = "Control PCA301 smart plugs through a serial radio gateway"
)]
struct Cli {
    /// Serial port of the gateway (overrides the config file)
    #[arg(long, global = true)]
    port: Option<String>,

    /// JSON file holding the known device channels
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports a gateway may be attached to
    Ports,
    /// Show known devices
    List,
    /// Listen for new devices
    Scan {
        /// Use the short scan window
        #[arg(long)]
        fast: bool,
    },
    /// Switch a plug on
    On { id: DeviceId },
    /// Switch a plug off
    Off { id: DeviceId },
    /// Ask a plug for a fresh reading
    Status {
        id: DeviceId,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print readings as they arrive
    Monitor {
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
    /// Forget a known plug
    Remove { id: DeviceId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Ports => {
            let ports = list_serial_ports().context("Failed to enumerate serial ports")?;
            if ports.is_empty() {
                println!("No USB serial ports found");
            }
            for port in ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04x}:{:04x}  {}",
                        port.port_name,
                        vid,
                        pid,
                        port.product.unwrap_or_default()
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
        }
        Commands::List => {
            let engine = build_engine(&cli, None)?;
            let devices = engine.get_devices();
            if devices.is_empty() {
                println!("No known devices");
            }
            for (id, device) in &devices {
                print_device(id, device);
            }
        }
        Commands::Scan { fast } => {
            let engine = open_engine(&cli, None).await?;
            let fast = *fast;
            let found = blocking(&engine, move |engine| engine.scan(fast))
                .await?
                .context("Scan failed")?;
            if found.is_empty() {
                println!("No new devices found");
            }
            for id in &found {
                println!("New device {} on channel {}", id, engine.known_devices()[id]);
            }
            close_engine(engine).await?;
        }
        Commands::On { id } | Commands::Off { id } => {
            let on = matches!(cli.command, Commands::On { .. });
            let engine = open_engine(&cli, None).await?;
            let target = id.clone();
            let confirmed = blocking(&engine, move |engine| {
                if on {
                    engine.turn_on(&target)
                } else {
                    engine.turn_off(&target)
                }
            })
            .await??;
            println!(
                "{} {}: {}",
                id,
                if on { "on" } else { "off" },
                if confirmed { "confirmed" } else { "not confirmed" }
            );
            close_engine(engine).await?;
        }
        Commands::Status { id, timeout_ms } => {
            let engine = open_engine(&cli, None).await?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| engine.config().confirm_timeout());
            let target = id.clone();
            let changed =
                blocking(&engine, move |engine| engine.status_request(&target, timeout)).await??;
            match engine.get_device(id) {
                Some(device) => print_device(id, &device),
                None => println!("{}: no reading", id),
            }
            if !changed {
                println!("(no state change observed within {:?})", timeout);
            }
            close_engine(engine).await?;
        }
        Commands::Monitor { seconds } => {
            let (tx, mut rx) = broadcast::channel::<DeviceEvent>(64);
            let engine = open_engine(&cli, Some(Arc::new(tx))).await?;
            println!("Monitoring for {}s, Ctrl-C to stop", seconds);

            let deadline = tokio::time::sleep(Duration::from_secs(*seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(DeviceEvent::Updated(id)) => {
                            if let Some(device) = engine.get_device(&id) {
                                print_device(&id, &device);
                            }
                        }
                        Ok(other) => log::info!("{:?} for {}", other, other.device_id()),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Monitor fell behind, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut deadline => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            close_engine(engine).await?;
        }
        Commands::Remove { id } => {
            let engine = build_engine(&cli, None)?;
            let channel = engine
                .remove_device(id)
                .with_context(|| format!("Failed to remove device {}", id))?;
            println!("Removed {} (channel {})", id, channel);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let log_level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("pca301", log_level)
        .filter_module("pca301_lib", log_level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn default_store_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pca301")
        .join("devices.json")
}

fn build_engine(cli: &Cli, sink: Option<Arc<dyn NotificationSink>>) -> Result<Arc<DeviceManager>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(port) = &cli.port {
        config = config.with_port(port.clone());
    }

    let store_path = cli.store.clone().unwrap_or_else(default_store_path);
    log::debug!("Using device store {}", store_path.display());
    let store: Arc<dyn DeviceStore> = Arc::new(JsonFileStore::new(store_path));

    let mut builder = DeviceManager::builder(SerialInterface::from_config(&config))
        .config(config)
        .store(store);
    if let Some(sink) = sink {
        builder = builder.sink(sink);
    }
    Ok(Arc::new(builder.build().context("Failed to set up engine")?))
}

async fn open_engine(
    cli: &Cli,
    sink: Option<Arc<dyn NotificationSink>>,
) -> Result<Arc<DeviceManager>> {
    let engine = build_engine(cli, sink)?;
    let port = engine.config().port.clone();
    blocking(&engine, DeviceManager::open)
        .await?
        .with_context(|| format!("Failed to open gateway on {}", port))?;
    Ok(engine)
}

async fn close_engine(engine: Arc<DeviceManager>) -> Result<()> {
    blocking(&engine, DeviceManager::close)
        .await?
        .context("Failed to close gateway")
}

/// Run an engine call on the blocking pool.
async fn blocking<T, F>(engine: &Arc<DeviceManager>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&DeviceManager) -> T + Send + 'static,
{
    let engine = engine.clone();
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await?)
}

fn print_device(id: &DeviceId, device: &DeviceState) {
    let state = match device.state {
        Some(true) => "on",
        Some(false) => "off",
        None => "unknown",
    };
    let seen = device
        .last_update
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{}  ch {}  {:<7}  {:>7.1} W  {:>8.2} kWh  last seen {}",
        id, device.channel, state, device.power, device.consumption, seen
    );
}
