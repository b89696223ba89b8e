//! Command-line interface for AirBridge.

mod command;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use airbridge_core::config::{Config, ConfigBuilder, ENV_PREFIX};
use airbridge_core::logging;
use airbridge_core::utils::with_timeout;
use airbridge_devices::transports::MqttTransport;
use airbridge_devices::{
    catalog, DeviceIdentity, DeviceRegistry, DeviceSession, ReconnectPolicy, Reconnector,
    TransportOptions,
};

use crate::command::{DeviceCommand, Setting};

/// Upper bound for closing every connection on Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// AirBridge - local control of connected air treatment appliances.
#[derive(Parser, Debug)]
#[command(name = "airbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true, default_value = "airbridge.toml")]
    config: PathBuf,

    /// Verbose output (overrides the configured log level).
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every configured device and log state changes until Ctrl-C.
    Watch,
    /// Connect one device, change one setting, disconnect.
    Set {
        /// Serial number of the device.
        serial: String,
        /// Setting to change.
        #[arg(value_enum)]
        setting: Setting,
        /// New value.
        value: String,
    },
    /// List supported product families.
    Products,
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigBuilder::new()
        .with_config_file(&args.config)
        .with_environment_prefix(ENV_PREFIX)
        .build()
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let mut logging_config = config.logging.clone();
    if args.verbose {
        logging_config.level = "debug".to_string();
    }
    logging::init_with_config(&logging_config)?;

    match args.command {
        Command::Watch => watch(&config).await,
        Command::Set {
            serial,
            setting,
            value,
        } => set(&config, &serial, setting, &value).await,
        Command::Products => {
            products();
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn watch(config: &Config) -> Result<()> {
    if config.devices.is_empty() {
        return Err(anyhow!("No devices configured"));
    }

    let registry = DeviceRegistry::from_config(config)?;
    if registry.count() == 0 {
        return Err(anyhow!("No configured device has a known address"));
    }
    for session in registry.list() {
        let name = session.identity().display_name().to_string();
        session.subscribe(move |state| match serde_json::to_string(state) {
            Ok(json) => info!(device = %name, "{}", json),
            Err(e) => warn!(device = %name, "Failed to serialize state: {}", e),
        });
    }

    for (serial, e) in registry.connect_all().await {
        warn!("{} is offline: {}", serial, e);
    }

    let supervisors: Vec<_> = if config.reconnect.enabled {
        let policy = ReconnectPolicy::from_config(&config.reconnect);
        registry
            .list()
            .iter()
            .map(|session| Reconnector::spawn(session, policy))
            .collect()
    } else {
        Vec::new()
    };

    info!("Watching {} devices, press Ctrl-C to stop", registry.count());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    drop(supervisors);
    let shutdown = async {
        registry.disconnect_all().await;
        Ok::<_, airbridge_core::error::Error>(())
    };
    if let Err(e) = with_timeout(SHUTDOWN_GRACE, shutdown).await {
        warn!("{}", e);
    }
    Ok(())
}

async fn set(config: &Config, serial: &str, setting: Setting, value: &str) -> Result<()> {
    let command = DeviceCommand::parse(setting, value)?;

    let device = config
        .device(serial)
        .ok_or_else(|| anyhow!("Device {} is not configured", serial))?;
    let identity = DeviceIdentity::from_config(device)?;
    let options = TransportOptions::for_device(&identity, &config.transport)?;
    let session = Arc::new(DeviceSession::new(identity, Arc::new(MqttTransport::new(options)))?);

    session
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", serial))?;
    let result = command.apply(&session).await;
    session.disconnect().await?;
    result?;

    info!("{} updated", session.identity().display_name());
    Ok(())
}

fn products() {
    println!("{:<6} {:<32} {:<20} CAPABILITIES", "TYPE", "MODEL", "SERIES");
    for entry in catalog::entries() {
        let profile = &entry.profile;
        let mut features = Vec::new();
        if profile.oscillation {
            features.push("oscillation");
        }
        if profile.oscillation_angles.is_some() {
            features.push("angles");
        }
        if profile.heating {
            features.push("heating");
        }
        if profile.humidifier {
            features.push("humidifier");
        }
        if profile.has_particulate_sensor() {
            features.push("particulates");
        }
        if profile.no2_sensor {
            features.push("no2");
        }
        if profile.formaldehyde_sensor {
            features.push("formaldehyde");
        }
        println!(
            "{:<6} {:<32} {:<20} {}",
            entry.product_type,
            entry.model,
            format!("{:?}", entry.series),
            features.join(", ")
        );
    }
}
