//! Tablet master service entry point

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tablet_master::{api::HttpApi, hive::LoggingSink, MasterConfig, TabletMaster};

/// Tablet master - control plane for dynamic tables
#[derive(Parser, Debug)]
#[command(name = "tablet-master")]
#[command(about = "Control plane for tablets, tablet cells and tablet actions")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'f', long)]
    config: Option<String>,

    /// Cluster name
    #[arg(short, long)]
    cluster: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<String>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<MasterConfig> {
        let mut config = match &self.config {
            Some(path) => MasterConfig::from_file(path)?,
            None => MasterConfig::default(),
        };
        if let Some(cluster) = self.cluster {
            config.cluster_name = cluster;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(http_addr) = self.http_addr {
            config.http_addr = http_addr;
        }
        if let Some(log_level) = self.log_level {
            config.log.level = log_level;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting tablet master...");
    info!("  Cluster: {}", config.cluster_name);
    info!("  Data dir: {}", config.data_dir);
    info!("  HTTP API: {}", config.http_addr);

    let http_addr = config.http_addr.clone();
    let master = Arc::new(TabletMaster::new(config, Arc::new(LoggingSink)).await?);

    // Start background tasks
    let _tracker_handle = master.clone().start_tracker();
    let _cleanup_handle = master.clone().start_action_cleanup();
    let _save_handle = master.clone().start_periodic_save();

    let stats = master.with_metadata(|m| m.stats());
    info!(
        "Cluster ready: {} bundles, {} cells, {} tables, {} tablets",
        stats.bundle_count, stats.cell_count, stats.table_count, stats.tablet_count
    );

    // Start HTTP API
    let app = HttpApi::new(master.clone()).router();

    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, app).await?;

    master.save().await?;

    Ok(())
}
