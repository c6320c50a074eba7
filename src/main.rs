//! CLI Entry Point for somfy-urts
//!
//! Provides command-line interface for:
//! - Running the node server (reads supervisor commands from stdin)
//! - Listing the shades discovery would create
//!
//! # Usage
//!
//! Start the node server:
//! ```bash
//! somfy-urts daemon --config config/somfy_urts.toml
//! ```
//!
//! Then type commands, one per line:
//! ```text
//! 01_01_03 DON 40
//! 01_01_03 STOP
//! 01_01_03 SET_TRAVEL_TIME 12.5
//! QUERY
//! ```
//!
//! List shades:
//! ```bash
//! somfy-urts discover --json
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use somfy_urts::config::{UrtsConfig, DEFAULT_CONFIG_PATH};
use somfy_urts::controller::{discovery_addresses, UrtsController};
use somfy_urts::logging;
use somfy_urts::observable::Observable;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "somfy-urts")]
#[command(about = "Somfy URTSii shade controller with position estimation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node server, reading commands from stdin
    Daemon {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print the shade addresses discovery would create
    Discover {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Print one JSON object per shade
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct DiscoveredShade {
    address: String,
    name: String,
    travel_time: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config } => run_daemon(config).await,
        Commands::Discover { config, json } => list_shades(config, json),
    }
}

fn load_config(path: &Path) -> Result<UrtsConfig> {
    let config = UrtsConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_daemon(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    println!("🪟 somfy-urts node server");
    println!("   Serial port: {}", config.serial.port);
    println!();

    let controller = UrtsController::new(config).with_config_path(config_path.clone());
    let added = controller.start().await;
    println!("✅ {} shades ready", added.len());

    controller.start_long_poll();

    watch_value("controller", controller.server_up());
    watch_value("controller", controller.link_up());
    for shade in controller.shades() {
        let address = shade.address().to_string();
        watch_value(&address, shade.position());
        watch_value(&address, shade.travel_time());
    }

    println!("📡 Reading commands from stdin - Ctrl+C or EOF to stop");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !controller.handle_line(&line).await {
                        eprintln!("❌ {}", line.trim());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read command input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\n👋 Node server shutting down...");
    controller.shutdown().await;
    Ok(())
}

/// Log every value the supervisor would receive.
fn watch_value<T>(node: &str, value: Observable<T>)
where
    T: Clone + Debug + Send + Sync + 'static,
{
    let node = node.to_string();
    let name = value.name();
    let mut rx = value.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let current = rx.borrow_and_update().clone();
            info!(node = %node, driver = %name, value = ?current, "Reported value");
        }
    });
}

fn list_shades(config_path: PathBuf, json: bool) -> Result<()> {
    let config = load_config(&config_path)?;

    for address in discovery_addresses(&config) {
        let shade = DiscoveredShade {
            address: address.to_string(),
            name: address.default_name(),
            travel_time: config.travel_time_for(&address.to_string()),
        };
        if json {
            println!("{}", serde_json::to_string(&shade)?);
        } else {
            println!("{}  {}  {:.1}s", shade.address, shade.name, shade.travel_time);
        }
    }
    Ok(())
}
