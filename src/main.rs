//! Signal Desk
//!
//! Streams the configured symbols, keeps the default selection's candle series
//! live and logs every flushed quote snapshot until Ctrl-C.

use anyhow::Context;
use signal_desk::config::AppConfig;
use signal_desk::MarketDesk;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config);

    info!("🚀 Signal Desk starting");
    info!("{}", config);

    let desk = MarketDesk::from_config(&config)?;
    let mut snapshots = desk.snapshots();
    let mut subscription =
        desk.subscribe_venues(&config.desk.spot_symbols, &config.desk.linear_symbols);

    let timeframe = config.desk.timeframe()?;
    let _bootstrap = desk.set_active_selection(config.desk.default_symbol.clone(), timeframe);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested");
                break;
            }
            snapshot = snapshots.recv() => match snapshot {
                Ok(quotes) => {
                    let bars = desk.bars();
                    info!(
                        quotes = quotes.len(),
                        status = %desk.connection_status(),
                        bars = bars.len(),
                        last_close = ?bars.last().map(|b| b.close),
                        "📊 Quote snapshot"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Snapshot consumer lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    subscription.teardown().await;
    info!("👋 Signal Desk stopped");
    Ok(())
}
