use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tunnelward::access::HttpAccessAuthority;
use tunnelward::analytics::{AnalyticsTracker, HttpTracker};
use tunnelward::config::Config;
use tunnelward::session::SessionManager;
use tunnelward::sockets::SystemSocketFactory;

#[derive(Parser, Debug)]
#[command(name = "tunnelward")]
#[command(about = "VPN server data plane - session management and UDP proxying")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loading configuration from {:?}", args.config);
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let access = Arc::new(HttpAccessAuthority::new(config.access.url.clone())?);
    let analytics = match &config.analytics {
        Some(analytics) => Some(
            Arc::new(HttpTracker::new(analytics.url.clone())?) as Arc<dyn AnalyticsTracker>
        ),
        None => None,
    };

    let manager = SessionManager::new(
        access,
        Arc::new(SystemSocketFactory),
        analytics,
        None,
        config.session_options(),
    )?;
    let job_runner = manager.start_job_runner();

    info!("TunnelWard session manager running");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    manager.dispose().await;
    job_runner.abort();

    Ok(())
}
