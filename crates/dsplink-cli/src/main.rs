//! `dspctl`: query and switch D-Link DSP smart plugs from the command line.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dsplink_client::{probe, wait_interval, ClientError, DeviceConfig, Supervisor};
use dsplink_protocol::Model;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dspctl")]
#[command(version)]
#[command(about = "Control D-Link DSP-W245/W115 smart plugs")]
struct Cli {
    /// YAML device configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device host name or IP address
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device PIN
    #[arg(long, global = true)]
    pin: Option<String>,

    /// Plug model (W245 or W115)
    #[arg(long, global = true)]
    model: Option<Model>,

    /// Device port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Seconds between polls in `watch`
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, sign in, and print the device identity
    Probe,
    /// Print the device status report
    Status,
    /// Print the state of every socket
    States,
    /// Print the state of one socket
    Get {
        /// 1-based socket index
        socket: u8,
    },
    /// Switch one socket
    Set {
        /// 1-based socket index
        socket: u8,
        /// New state
        state: Switch,
    },
    /// Turn every socket off, on, then off again
    Cycle,
    /// Send a keep-alive
    KeepAlive,
    /// Poll until interrupted
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Probe => {
            let identity = probe(&config)?;
            print_json(&identity)?;
        }
        Commands::Status => {
            let plug = Supervisor::from_config(&config)?;
            print_json(&plug.device_status()?)?;
            plug.close();
        }
        Commands::States => {
            let plug = Supervisor::from_config(&config)?;
            print_json(&plug.poll()?)?;
            plug.close();
        }
        Commands::Get { socket } => {
            let plug = Supervisor::from_config(&config)?;
            let state = plug.socket_state(socket)?;
            print_json(&serde_json::json!({ "socket": socket, "on": state }))?;
            plug.close();
        }
        Commands::Set { socket, state } => {
            let plug = Supervisor::from_config(&config)?;
            let on = plug.set_socket(socket, matches!(state, Switch::On))?;
            print_json(&serde_json::json!({ "socket": socket, "on": on }))?;
            plug.close();
        }
        Commands::Cycle => {
            let plug = Supervisor::from_config(&config)?;
            plug.cycle()?;
            plug.close();
        }
        Commands::KeepAlive => {
            let plug = Supervisor::from_config(&config)?;
            plug.keep_alive()?;
            plug.close();
        }
        Commands::Watch => watch(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<DeviceConfig> {
    let mut config = match &cli.config {
        Some(path) => DeviceConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let (Some(host), Some(pin)) = (&cli.host, &cli.pin) else {
                bail!("either --config or both --host and --pin are required");
            };
            DeviceConfig::new(host.as_str(), pin.as_str())
        }
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(pin) = &cli.pin {
        config.pin = pin.clone();
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(interval) = cli.interval {
        config.scan_interval_secs = interval;
    }

    config.validate()?;
    Ok(config)
}

fn watch(config: &DeviceConfig) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    let plug = Supervisor::from_config(config)?;
    info!(
        host = %config.host,
        name = %config.name,
        interval_secs = config.scan_interval_secs,
        "watching device"
    );

    while !stop.load(Ordering::SeqCst) {
        match plug.poll() {
            Ok(outcome) => print_json(&outcome)?,
            Err(ClientError::PollFailed { failures, .. }) => {
                error!(failures, "device unavailable");
                print_json(&serde_json::json!({ "available": false, "failures": failures }))?;
            }
            Err(e) => error!(error = %e, "poll failed"),
        }

        if !wait_interval(config.scan_interval(), || stop.load(Ordering::SeqCst)) {
            break;
        }
    }

    info!("stopping");
    plug.close();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
