mod config;
mod error;
mod market_feed;
mod market_selector;
mod orchestrator;
mod order_manager;
mod quantization;
mod risk_manager;
mod state_machine;
mod types;
mod user_feed;
mod utils;
mod venue;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::config::Settings;
use crate::orchestrator::MarketMaker;
use crate::venue::polymarket::{PolymarketMarketDirectory, PolymarketRest, PolymarketUserAuth};
use crate::venue::{ClobRest, DryRunClobRest, MarketDirectory, UserAuth};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Settings::load()?;
    log::info!(
        "app.start dry_run={} max_markets={} order_size_shares={}",
        settings.dry_run,
        settings.max_markets,
        settings.order_size_shares
    );

    // Market discovery and user-channel auth are read-only/signing-only, so
    // dry-run mode still uses the real venue for them; only order placement
    // (`ClobRest`) is faked, keeping selection decisions grounded in live data.
    let directory: Arc<dyn MarketDirectory> = Arc::new(PolymarketMarketDirectory::new(&settings.venue)?);
    let user_auth: Arc<dyn UserAuth> = Arc::new(PolymarketUserAuth::new(&settings.venue)?);
    let rest: Arc<dyn ClobRest> = if settings.dry_run {
        log::warn!("app.dry_run live orders are simulated, nothing reaches the venue");
        Arc::new(DryRunClobRest::new())
    } else {
        Arc::new(PolymarketRest::new(&settings.venue)?)
    };

    let maker = MarketMaker::new(settings, rest, directory, user_auth);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("app.shutdown.signal_received");
            let _ = shutdown_tx.send(true);
        }
    });

    maker.run(shutdown_rx).await;
    log::info!("app.stopped");
    Ok(())
}
