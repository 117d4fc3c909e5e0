//! netaccel - network acceleration control
//!
//! ```bash
//! netaccel detect --json
//! netaccel run --config /etc/netaccel/acceleration.json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use netaccel_common::SysfsProbe;
use netaccel_detect::HardwareDetector;
use netaccel_manager::{AccelError, AccelerationConfig, AccelerationManager};
use netaccel_xdp::BpftoolLoader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "netaccel")]
#[command(version)]
#[command(about = "Kernel and hardware packet acceleration control", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print what this host can accelerate
    Detect {
        /// Emit the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Bring up acceleration and run until interrupted
    Run {
        #[arg(long, env = "CONFIG_PATH", default_value = "/etc/netaccel/acceleration.json")]
        config: PathBuf,

        /// Seconds between statistics log lines
        #[arg(long, default_value_t = 30)]
        stats_every: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Detect { json } => detect(json),
        Commands::Run { config, stats_every } => run(config, stats_every).await,
    }
}

fn detect(json: bool) -> anyhow::Result<()> {
    let detector = HardwareDetector::new(Arc::new(SysfsProbe::new()));
    let caps = detector.detect().context("hardware detection failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(caps.as_ref())?);
    } else {
        println!("{}", caps.summary());
        for hint in caps.recommendations() {
            println!("  - {}", hint);
        }
    }
    Ok(())
}

async fn run(path: PathBuf, stats_every: u64) -> anyhow::Result<()> {
    tracing::info!("netaccel v{}", env!("CARGO_PKG_VERSION"));

    let config = match AccelerationConfig::load(&path) {
        Ok(config) => config,
        Err(AccelError::ConfigIo { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config not found, using defaults");
            AccelerationConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("loading {}", path.display())),
    };

    let loader = Arc::new(BpftoolLoader::new(config.xdp.pin_path.clone()));
    let manager = AccelerationManager::new(config, Arc::new(SysfsProbe::new()), loader);

    manager.initialize().await?;
    manager.start().await?;
    tracing::info!(active = ?manager.get_active_technologies(), "acceleration running");

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_every.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = manager.get_stats();
                tracing::info!(
                    active = ?stats.active,
                    total = stats.total_packets,
                    pps = stats.packets_per_second,
                    slow_path = stats.slow_path_packets,
                    "acceleration statistics"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                break;
            }
        }
    }

    tracing::info!("shutting down");
    let report = manager.stop().await;
    for failure in report.failures() {
        tracing::error!(item = %failure.target, reason = %failure.reason, "resource not released");
    }
    Ok(())
}
