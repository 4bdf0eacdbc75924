use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use logserver::{Collector, CollectorConfig, DEFAULT_PORT};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "logserver")]
#[command(about = "Central collector for EasySave transfer logs", long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Directory receiving one log file per day
    #[arg(short, long, default_value = "logs")]
    log_dir: PathBuf,

    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = CollectorConfig {
        host: cli.host,
        port: cli.port,
        log_dir: cli.log_dir,
        report_interval: Duration::from_secs(cli.report_interval_secs.max(1)),
        ..CollectorConfig::default()
    };

    let collector = match Collector::bind(config).await {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "Failed to start collector");
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    if let Err(e) = collector.run(shutdown).await {
        error!(error = %e, "Collector failed");
        process::exit(1);
    }
}
