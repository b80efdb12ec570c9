//! cloudbridge - Main Entry Point
//!
//! Runs the bridge as an always-on background agent until SIGINT or SIGTERM.

use cloudbridge::bridge::BridgeController;
use cloudbridge::config::BridgeConfig;
use cloudbridge::observability::{init_default_logging, init_logging, metrics, LogFormat};
use cloudbridge::transport::MqttSession;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn, Level};

/// Store-and-forward bridge between local producers and an MQTT broker
#[derive(Parser)]
#[command(name = "cloudbridge")]
#[command(about = "Store-and-forward device bridge to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: &[&str] = &["cloudbridge.toml", "config/cloudbridge.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting cloudbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()))
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_bridge_state("initializing");

    let bridge = BridgeController::<MqttSession>::from_config(&config)?;
    bridge.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(device = %bridge.identity(), "Bridge is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = report_status(&bridge, config.delivery.status_interval_secs) => {}
    }

    bridge.stop().await?;
    Ok(())
}

/// Log a status line every `interval_secs`; never returns when enabled
async fn report_status(bridge: &BridgeController<MqttSession>, interval_secs: u64) {
    if interval_secs == 0 {
        std::future::pending::<()>().await;
    }

    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match serde_json::to_string(&bridge.status()) {
            Ok(status) => info!(status = %status, "Bridge status"),
            Err(e) => warn!(error = %e, "Failed to serialize bridge status"),
        }
    }
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
