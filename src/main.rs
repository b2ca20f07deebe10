use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nfc_relay::{RelayConfig, RelayCoordinator, RelayEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "nfc-relay")]
#[command(version = VERSION)]
#[command(about = "Transparent APDU relay between an NFC reader and a card emulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until killed
    Start {
        /// Reader-facing serial port (overrides the saved config)
        #[arg(long)]
        client_port: Option<String>,
        /// Card-emulator-facing serial port (overrides the saved config)
        #[arg(long)]
        host_port: Option<String>,
        /// Baud rate for both ports
        #[arg(long)]
        baud: Option<u32>,
    },
    /// List serial ports visible to the relay
    Ports,
    /// Show or edit the persisted configuration
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            client_port,
            host_port,
            baud,
        } => {
            run_relay(client_port, host_port, baud)?;
        }
        Commands::Ports => {
            list_ports()?;
        }
        Commands::Config { key, value } => {
            config_cmd(key, value)?;
        }
    }

    Ok(())
}

fn run_relay(
    client_port: Option<String>,
    host_port: Option<String>,
    baud: Option<u32>,
) -> Result<()> {
    let mut config = RelayConfig::load()?;
    if let Some(port) = client_port {
        config.client_port = port;
    }
    if let Some(port) = host_port {
        config.host_port = port;
    }
    if let Some(baud) = baud {
        config.baud_rate = baud;
    }
    config.validate()?;

    println!(
        "Starting nfc-relay v{}: {} <-> {} at {} baud",
        VERSION, config.client_port, config.host_port, config.baud_rate
    );

    let mut relay = RelayCoordinator::new(config);
    relay.set_error_handler(|kind| log::error!("unrecoverable relay fault: {}", kind));
    let stream = relay.subscribe();
    relay.start()?;

    // The stream ends when the relay stops on its own (fault with no
    // restarts left); until then this is the process main loop.
    for event in stream {
        match event {
            RelayEvent::Snapshot(s) => log::debug!(
                "snapshot #{}: frames={} rx={}B tx={}B p50={}us p95={}us max={}us",
                s.seq,
                s.frames,
                s.bytes_rx,
                s.bytes_tx,
                s.latency.p50_ns / 1_000,
                s.latency.p95_ns / 1_000,
                s.latency.max_ns / 1_000
            ),
            RelayEvent::HighLatency {
                sample_ns,
                direction,
                fingerprint,
            } => log::warn!(
                "high latency: {:.3} ms on {} (command {:#018x})",
                sample_ns as f64 / 1_000_000.0,
                direction,
                fingerprint
            ),
            RelayEvent::FramingError { kind, direction } => {
                log::warn!("framing error on {}: {}", direction, kind)
            }
            RelayEvent::PortUnavailable { direction } => {
                log::warn!("port unavailable on {}", direction)
            }
            RelayEvent::Restarted { reason } => log::warn!("relay restarted: {}", reason),
        }
    }

    log::info!("metric stream ended, shutting down");
    relay.stop();
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(info) => println!(
                "{}  usb {:04x}:{:04x} {}",
                port.port_name,
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            other => println!("{}  {:?}", port.port_name, other),
        }
    }
    Ok(())
}

fn config_cmd(key: Option<String>, value: Option<String>) -> Result<()> {
    let config = RelayConfig::load()?;
    match (key, value) {
        (None, None) => println!("{}", serde_json::to_string_pretty(&config)?),
        (Some(k), None) => {
            let root = serde_json::to_value(&config)?;
            let entry = root
                .get(&k)
                .with_context(|| format!("Unknown config key '{}'", k))?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        (Some(k), Some(v)) => {
            let mut root = serde_json::to_value(&config)?;
            let obj = root.as_object_mut().context("config is not an object")?;
            if !obj.contains_key(&k) {
                bail!("Unknown config key '{}'", k);
            }
            // Accept raw JSON; fall back to treating the value as a string.
            let parsed =
                serde_json::from_str(&v).unwrap_or_else(|_| serde_json::Value::String(v.clone()));
            obj.insert(k.clone(), parsed);
            let updated: RelayConfig = serde_json::from_value(root)
                .with_context(|| format!("Invalid value for config key '{}'", k))?;
            updated.save()?;
            println!("Updated {}", k);
        }
        _ => {}
    }
    Ok(())
}
