//! Tagway CLI entry point.
//!
//! `run` starts a gateway from a TOML configuration; `example` prints a
//! commented starter configuration; `list-families` shows the protocol
//! families this build knows about.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tagway::core::tag::TagPack;
use tagway::driver::family::{ProtocolFamily, CIP_DINT};
use tagway::driver::sim::{SimDriver, SimTagDef};
use tagway::manager::{DeviceManager, GatewayConfig};
use tagway::publish::console::ConsoleSink;
use tagway::publish::traits::SinkKind;
use tagway::rules::engine::RuleEngine;

#[derive(Parser, Debug)]
#[command(name = "tagway", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a gateway from a configuration file
    Run {
        /// Configuration file path
        config: PathBuf,
    },

    /// Print an example configuration
    Example,

    /// List supported protocol families
    ListFamilies,
}

#[tokio::main]
async fn main() -> tagway::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Example => {
            print!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
        Commands::ListFamilies => {
            println!("Supported protocol families:");
            for family in ProtocolFamily::all() {
                println!("  {}", family.driver_name());
            }
            Ok(())
        }
    }
}

async fn run(path: &PathBuf) -> tagway::Result<()> {
    let config = GatewayConfig::from_path(path)?;
    info!(
        gateway = config.gateway.name.as_str(),
        devices = config.devices.len(),
        sinks = config.sinks.len(),
        rules = config.rules.len(),
        "configuration loaded"
    );

    let manager = DeviceManager::new(config.gateway.clone());
    let publisher = manager.publisher();

    // Sinks first, so the initial sync has somewhere to go.
    for sink in &config.sinks {
        match sink.kind {
            SinkKind::Console => {
                publisher.add_sink(Arc::new(ConsoleSink::new(sink.name.clone())))?;
            }
            SinkKind::Broker | SinkKind::KeyValue => {
                // Wire clients live in separate crates; nothing to link here.
                warn!(
                    sink = sink.name.as_str(),
                    kind = %sink.kind,
                    "sink kind requires an external client crate, skipping"
                );
                continue;
            }
        }
        if sink.enabled {
            publisher.start_sink(&sink.name).await?;
        }
    }

    // Devices. The sim family runs in-process; real families need their
    // driver crate linked in.
    for device in &config.devices {
        match device.family {
            ProtocolFamily::Sim => {
                let defs: Vec<SimTagDef> = device
                    .tags
                    .iter()
                    .map(|t| SimTagDef::new(t.name.clone(), CIP_DINT, 0_i64))
                    .collect();
                let (driver, _handle) = SimDriver::new(device.address.clone(), defs);
                manager.add_device(device.clone(), Box::new(driver))?;
            }
            other => {
                warn!(
                    device = device.name.as_str(),
                    family = %other,
                    "protocol family requires an external driver crate, skipping"
                );
                continue;
            }
        }
    }

    // Packs.
    for pack in &config.packs {
        manager.add_pack(TagPack {
            name: pack.name.clone(),
            members: pack.members.clone(),
            enabled: pack.enabled,
            suppress_broker: pack.suppress_broker,
            suppress_kv: pack.suppress_kv,
        })?;
    }

    // Rule engine, fed by its own change listener.
    let engine = RuleEngine::new(manager.values(), Arc::new(manager.clone()));
    for rule in &config.rules {
        engine.add_rule(rule.clone())?;
    }
    let (_listener, rx) = manager.add_listener();
    engine.attach(rx);

    manager.start();
    for device in &config.devices {
        if device.auto_connect && manager.list_devices().iter().any(|d| d.name == device.name) {
            manager.connect(&device.name)?;
        }
    }

    info!("gateway running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| tagway::GatewayError::Internal(e.to_string()))?;

    info!("shutting down");
    engine.shutdown();
    manager.shutdown().await;
    Ok(())
}

const EXAMPLE_CONFIG: &str = r#"# Tagway gateway configuration

[gateway]
name = "plant-gw"
default_poll_interval_ms = 1000
health_interval_ms = 10000

[[devices]]
name = "plc1"
family = "sim"            # logix | s7 | omron | beckhoff | sim
address = "sim://plant1"
poll_interval_ms = 500
auto_connect = true
health_check = true

[[devices.tags]]
name = "Speed"
alias = "line1/speed"

[[devices.tags]]
name = "Motor"
writable = true
suppress_kv = true

[[sinks]]
name = "console"
kind = "console"

[[rules]]
name = "overspeed"
debounce_ms = 500
cooldown_ms = 60000

[[rules.conditions]]
device = "plc1"
tag = "Speed"
op = "gt"
value = 100

[[rules.actions]]
type = "webhook"
url = "https://hooks.example/overspeed"
body = '{"rule":"{rule}","tag":"{device}/{tag}","value":{value}}'

[[rules.actions]]
type = "write_back"
device = "plc1"
tag = "Motor"
value = false

[[packs]]
name = "line1"
members = [["plc1", "Speed"], ["plc1", "Motor"]]
"#;
