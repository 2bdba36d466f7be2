//! Narrow trait boundary over the venue: order submission/cancellation,
//! market discovery, and user-channel auth signing. Everything upstream of
//! this module works in plain domain types; wire protocol, wallet signing,
//! and EIP-712 order construction live behind it (spec section 6, "external
//! interfaces" and the Non-goals on signing/wire-protocol internals).
//!
//! Production wiring adapts `polymarket-hft`'s `TradingClient`/`Client`; the
//! dry-run adapter is an in-memory fake used for local runs and tests.

mod dry_run;
pub mod polymarket;

pub use dry_run::DryRunClobRest;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::types::{AssetId, ConditionId, Side};

/// One resting order as reported back by the venue.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: String,
    pub asset: AssetId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub size_matched: f64,
}

/// A single price level as returned by a REST order-book snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// REST order-book snapshot, used by `MarketSelector` as a fallback when no
/// live websocket book exists yet for a candidate (spec 4.6).
#[derive(Debug, Clone, Default)]
pub struct BookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Order placement and cancellation surface. One implementation talks to the
/// real CLOB over HTTPS with EIP-712 signed orders; the other is an in-memory
/// fake for dry-run mode.
#[async_trait]
pub trait ClobRest: Send + Sync {
    async fn post_limit_order(
        &self,
        asset: &AssetId,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<VenueOrder, CoreError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), CoreError>;

    async fn cancel_all(&self) -> Result<(), CoreError>;

    async fn get_open_orders(&self, asset: &AssetId) -> Result<Vec<VenueOrder>, CoreError>;

    async fn get_order_book(&self, asset: &AssetId) -> Result<BookSnapshot, CoreError>;
}

/// A market candidate as listed by the venue's Gamma/market-directory API,
/// before any of the selector's eligibility filters are applied.
#[derive(Debug, Clone)]
pub struct ListedMarket {
    pub condition_id: ConditionId,
    pub yes_asset: AssetId,
    pub no_asset: AssetId,
    pub volume_24h: f64,
    pub end_date_ts: f64,
    pub event_id: String,
}

/// Candidate-market discovery, separate from order placement because it is
/// polled on its own cadence (spec 4.6) rather than per-tick.
#[async_trait]
pub trait MarketDirectory: Send + Sync {
    async fn list_active_markets(&self) -> Result<Vec<ListedMarket>, CoreError>;
}

/// Signs the user-channel websocket auth payload. Narrow on purpose: the
/// feed only ever needs one signature, over one fixed message shape (spec
/// section 6).
pub trait UserAuth: Send + Sync {
    fn sign_ws_auth(&self, timestamp: &str) -> Result<String, CoreError>;
    fn api_key(&self) -> &str;
    fn passphrase(&self) -> &str;
}
