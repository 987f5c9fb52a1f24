//! gnmi-cache - replicated gNMI telemetry cache
//!
//! Runs one cache instance and logs a summary of its content on an interval.
//! Peers running with the same backend settings converge on the same data.

use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gnmi_cache::{config::Args, new_cache, Cache, ReadOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gnmi_cache={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match args.cache_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("======================================");
    info!("  gnmi-cache");
    info!("======================================");
    info!("Backend: {}", config.kind);
    info!("Address: {}", config.address().unwrap_or("(embedded/none)"));
    info!("Expiration: {}s", config.expiration_secs);
    info!("Live tail: {}", config.live_tail);
    info!("======================================");

    let cache = new_cache(&config).await?;

    let mut summary = (args.summary_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.summary_interval_secs)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = async {
                match summary.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                match cache.read(&ReadOptions::default()).await {
                    Ok(content) => {
                        let notifications: usize = content.values().map(Vec::len).sum();
                        info!(
                            subscriptions = content.len(),
                            notifications,
                            "Cache summary"
                        );
                    }
                    Err(e) => error!(error = %e, "Summary read failed"),
                }
            }
        }
    }

    cache.stop();
    // let background tasks log their shutdown
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("gnmi-cache stopped");
    Ok(())
}
