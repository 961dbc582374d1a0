//! Midibox Sync - command line front end
//!
//! Connects to a Midibox over the configured transport to watch, set and
//! preset its properties.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midibox_sync::config::{AppConfig, TransportKind};
use midibox_sync::device::{Device, Origin};
use midibox_sync::midi::{self, MidiMessage};
use midibox_sync::property::program;
use midibox_sync::transport::bus::codec::{self, Target};
use midibox_sync::Value;

/// Midibox Sync - mirror and control a Midibox layer controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "midibox.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every property change and raw MIDI message until Ctrl+C
    Monitor,
    /// Set one property, e.g. `set layers/2/volume 90`
    Set { address: String, value: String },
    /// Apply a preset from the configuration file
    Preset { name: String },
    /// Mark the device for a full push on the next write
    Init,
    /// List the named sound programs with their wire bytes and effects
    Programs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    if args.list_ports {
        let client = AppConfig::default().transport.register.client_name;
        return list_ports_formatted(&client);
    }

    let config = load_config(&args.config).await?;
    let Some(command) = args.command else {
        bail!("no command given (try --help)");
    };
    if matches!(command, Command::Programs) {
        list_programs();
        return Ok(());
    }

    let device = Arc::new(Device::from_config(&config));
    connect(&device).await?;

    let result = match command {
        Command::Monitor => monitor(&device).await,
        Command::Set { address, value } => set_property(&device, &config, &address, &value),
        Command::Preset { name } => {
            let preset = config
                .preset(&name)
                .ok_or_else(|| anyhow!("preset '{}' not found in {}", name, args.config))?;
            let changed = device.apply_preset(&preset.values);
            println!("{} {} ({} change(s))", "Applied".green(), preset.name.bold(), changed);
            Ok(())
        }
        Command::Init => {
            device.initialize();
            println!("{}", "Initialization requested".green());
            Ok(())
        }
        Command::Programs => Ok(()),
    };

    if config.transport.kind == TransportKind::Bus {
        // Let the bus thread drain its outbound queue
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let d = device.clone();
    tokio::task::spawn_blocking(move || d.disconnect()).await??;
    info!("Midibox Sync shutdown complete");
    result
}

async fn load_config(path: &str) -> Result<AppConfig> {
    if Path::new(path).exists() {
        let config = AppConfig::load(path).await?;
        info!("Configuration loaded from {}", path);
        Ok(config)
    } else {
        warn!("Configuration file {} not found, using defaults", path);
        Ok(AppConfig::default())
    }
}

async fn connect(device: &Arc<Device>) -> Result<()> {
    let d = device.clone();
    tokio::task::spawn_blocking(move || d.connect())
        .await?
        .context("Failed to start transport")?;
    info!("Connection state: {}", device.connection_state());
    Ok(())
}

async fn monitor(device: &Arc<Device>) -> Result<()> {
    device.subscribe_all(|event| {
        let origin = match event.origin {
            Origin::Local => "local ".yellow(),
            Origin::Remote => "remote".cyan(),
        };
        let mut shown = event.value.to_string();
        if event.name == "program" {
            if let Some(label) = event.value.as_text().and_then(program::label) {
                shown = format!("{} ({})", shown, label);
            }
        }
        println!("{} {:<20} {:<22} {}", origin, event.group.to_string(), event.name, shown.bold());
    });
    device.forward_raw(|bytes| match MidiMessage::parse(bytes) {
        Some(MidiMessage::TimingClock) => {}
        Some(msg) => println!("{} {}", "midi  ".magenta(), msg),
        None => println!("{} {}", "midi  ".magenta(), midi::format_hex(bytes).dimmed()),
    });
    device.emit_all();

    println!("{}", "Monitoring, press Ctrl+C to stop".dimmed());
    shutdown_signal().await;
    Ok(())
}

fn set_property(device: &Device, config: &AppConfig, address: &str, value: &str) -> Result<()> {
    let prefix = &config.transport.bus.prefix;
    let full = format!("{}/{}", prefix, address.trim_start_matches('/'));
    let Some(Target::Property(group, name)) = codec::parse_address(prefix, &full) else {
        bail!("'{}' is not a property address", address);
    };
    if device.get(group, &name).is_none() {
        bail!("unknown property '{}' in {}", name, group);
    }

    match device.set(group, &name, Value::parse_literal(value)) {
        Some(stored) => println!("{} {} = {}", group.to_string().cyan(), name, stored.to_string().green()),
        None => println!("{} {} unchanged", group.to_string().cyan(), name),
    }
    Ok(())
}

fn list_ports_formatted(client_name: &str) -> Result<()> {
    let (inputs, outputs) = midi::list_ports(client_name)?;

    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());
    for (title, ports) in [("Input Ports:", inputs), ("Output Ports:", outputs)] {
        println!("\n{}", title.bold());
        if ports.is_empty() {
            println!("  {}", "No ports found".dimmed());
        }
        for port in ports {
            println!("  {}", port);
        }
    }
    println!();
    Ok(())
}

fn list_programs() {
    println!("\n{}", "=== Programs ===".bold().cyan());
    for (key, p) in program::PROGRAMS.iter() {
        println!(
            "  {} {} {:<14} pc:{:<3} msb:{:<3} lsb:{:<3}",
            format!("{:<14}", key).bold(),
            p.short.yellow(),
            p.name,
            p.pc,
            p.msb,
            p.lsb
        );
        for efx in &p.effects {
            println!("  {:<14} {}", "", midi::format_hex(efx).dimmed());
        }
    }
    println!();
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
