//! Public market-data websocket feed (spec 4.2).
//!
//! Maintains a top-of-book cache keyed by asset, resubscribing whenever the
//! orchestrator changes which assets it cares about. Reconnects with capped
//! exponential backoff and treats a silent connection as dead via a
//! heartbeat/liveness timeout, independent of the subscribed asset set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::types::{AssetId, TopOfBook};
use crate::utils::{ewma, now_ts};

const SUBSCRIBE_DEBOUNCE: Duration = Duration::from_millis(75);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const RATE_EWMA_ALPHA: f64 = 0.3;

fn reconnect_delay(attempt: u32) -> Duration {
    let secs = BASE_RECONNECT_DELAY.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    Duration::from_secs_f64(secs.min(MAX_RECONNECT_DELAY.as_secs_f64()))
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    assets_ids: &'a [AssetId],
}

#[derive(Debug, Clone, Deserialize)]
struct WirePriceLevel {
    price: String,
    size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireBook {
    asset_id: String,
    #[serde(alias = "buys")]
    bids: Vec<WirePriceLevel>,
    #[serde(alias = "sells")]
    asks: Vec<WirePriceLevel>,
    #[serde(default)]
    tick_size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WirePriceChangeEntry {
    best_bid: Option<String>,
    best_ask: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WirePriceChange {
    asset_id: String,
    price_changes: Vec<WirePriceChangeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireTickSizeChange {
    asset_id: String,
    new_tick_size: String,
}

fn best(levels: &[WirePriceLevel], pick_max: bool) -> Option<f64> {
    levels
        .iter()
        .filter_map(|l| l.price.parse::<f64>().ok())
        .fold(None, |acc, p| match acc {
            None => Some(p),
            Some(a) if pick_max => Some(a.max(p)),
            Some(a) => Some(a.min(p)),
        })
}

/// Shared top-of-book cache, readable from any task without holding a lock
/// across an await point.
#[derive(Clone)]
pub struct FeedState {
    books: Arc<RwLock<HashMap<AssetId, TopOfBook>>>,
    rates: Arc<RwLock<HashMap<AssetId, (f64, f64)>>>, // (ewma per-min, last_ts)
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedState {
    pub fn new() -> Self {
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
            rates: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn last_prices(&self, asset: &AssetId) -> Option<TopOfBook> {
        self.books.read().get(asset).cloned()
    }

    pub fn tick_size(&self, asset: &AssetId) -> Option<f64> {
        self.books.read().get(asset).and_then(|t| t.tick_size)
    }

    /// Whether `asset` has had a book update within `max_age` seconds,
    /// used by the orchestrator's exit criteria and health check (spec 4.7).
    pub fn is_active(&self, asset: &AssetId, max_age: f64) -> bool {
        match self.books.read().get(asset).and_then(|t| t.last_update_ts) {
            Some(ts) => (now_ts() - ts) <= max_age,
            None => false,
        }
    }

    pub fn snapshot(&self) -> HashMap<AssetId, TopOfBook> {
        self.books.read().clone()
    }

    /// EWMA of update arrival rate, in updates/minute. Zero for an asset
    /// that has never been seen.
    pub fn update_rate_per_min(&self, asset: &AssetId) -> f64 {
        self.rates.read().get(asset).map(|(r, _)| *r).unwrap_or(0.0)
    }

    fn record_rate(&self, asset: &AssetId, now: f64) {
        let mut rates = self.rates.write();
        let entry = rates.get(asset).copied();
        let per_min = match entry {
            Some((prev_rate, prev_ts)) if now > prev_ts => {
                let inst = 60.0 / (now - prev_ts).max(0.001);
                ewma(Some(prev_rate), inst, RATE_EWMA_ALPHA)
            }
            Some((prev_rate, _)) => prev_rate,
            None => 0.0,
        };
        rates.insert(asset.clone(), (per_min, now));
    }

    /// Applies a (possibly one-sided) book update. `price_change` messages
    /// routinely carry only one side; the invariant check is run against the
    /// merged view of the incoming side(s) plus whatever is already cached
    /// for the other side, not just against sides present in this message,
    /// so a one-sided update can't silently create a crossed book.
    pub(crate) fn apply_book(&self, asset: &AssetId, best_bid: Option<f64>, best_ask: Option<f64>, tick_size: Option<f64>) {
        let now = now_ts();
        let cached = self.books.read().get(asset).cloned();
        let merged_bid = best_bid.or_else(|| cached.as_ref().and_then(|t| t.best_bid));
        let merged_ask = best_ask.or_else(|| cached.as_ref().and_then(|t| t.best_ask));
        let accept = match (merged_bid, merged_ask) {
            (Some(b), Some(a)) => TopOfBook::is_valid(b, a),
            _ => true,
        };
        if !accept {
            log::warn!("market_feed.reject_crossed asset={asset} bid={merged_bid:?} ask={merged_ask:?}");
            return;
        }
        let mut books = self.books.write();
        let tob = books.entry(asset.clone()).or_default();
        if best_bid.is_some() {
            tob.best_bid = best_bid;
        }
        if best_ask.is_some() {
            tob.best_ask = best_ask;
        }
        if tick_size.is_some() {
            tob.tick_size = tick_size;
        }
        tob.last_update_ts = Some(now);
        drop(books);
        self.record_rate(asset, now);
    }

    /// Updates the cached tick size from a `tick_size_change` message (spec
    /// 4.2). There is no separate listener registry in this process — the
    /// cache itself is the notification surface every reader observes.
    pub(crate) fn apply_tick_size(&self, asset: &AssetId, tick_size: f64) {
        let mut books = self.books.write();
        books.entry(asset.clone()).or_default().tick_size = Some(tick_size);
        drop(books);
        log::info!("market_feed.tick_size_change asset={asset} tick={tick_size}");
    }
}

/// Feeds desired-asset changes into the running websocket loop and exposes
/// the resulting top-of-book cache.
pub struct MarketFeed {
    state: FeedState,
    desired_tx: watch::Sender<Vec<AssetId>>,
    desired_rx: watch::Receiver<Vec<AssetId>>,
    ws_url: String,
}

impl MarketFeed {
    pub fn new(ws_url: String) -> Self {
        let (desired_tx, desired_rx) = watch::channel(Vec::new());
        Self {
            state: FeedState::new(),
            desired_tx,
            desired_rx,
            ws_url,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state.clone()
    }

    /// Called by the orchestrator whenever the selected-market set changes.
    pub fn set_desired_assets(&self, assets: Vec<AssetId>) {
        let _ = self.desired_tx.send(assets);
    }

    /// A cloned sender the orchestrator can keep after `spawn` consumes
    /// `self`, so it can keep pushing desired-asset updates to the running
    /// feed task.
    pub fn desired_sender(&self) -> watch::Sender<Vec<AssetId>> {
        self.desired_tx.clone()
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            run(self.ws_url, self.state, self.desired_rx).await;
        });
    }
}

async fn run(ws_url: String, state: FeedState, mut desired_rx: watch::Receiver<Vec<AssetId>>) {
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            let delay = reconnect_delay(attempt.min(MAX_RECONNECT_ATTEMPTS));
            log::warn!("market_feed.reconnect.wait attempt={attempt} delay_ms={}", delay.as_millis());
            sleep(delay).await;
        }

        match connect_and_run(&ws_url, &state, &mut desired_rx).await {
            Ok(()) => {
                // Graceful close of the select loop (desired_rx sender dropped).
                return;
            }
            Err(e) => {
                attempt += 1;
                log::error!("market_feed.connection.error attempt={attempt} err={e}");
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    log::error!("market_feed.reconnect.exhausted resetting backoff after cooldown");
                    sleep(MAX_RECONNECT_DELAY).await;
                    attempt = 0;
                }
            }
        }
    }
}

async fn connect_and_run(
    ws_url: &str,
    state: &FeedState,
    desired_rx: &mut watch::Receiver<Vec<AssetId>>,
) -> Result<(), String> {
    let (ws_stream, _) = timeout(Duration::from_secs(30), tokio_tungstenite::connect_async(ws_url))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| e.to_string())?;
    log::info!("market_feed.connected url={ws_url}");

    let (mut write, mut read) = ws_stream.split();
    let mut subscribed: Vec<AssetId> = Vec::new();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    let initial = desired_rx.borrow().clone();
    subscribe_if_changed(&mut write, &mut subscribed, initial).await?;

    loop {
        tokio::select! {
            biased;

            changed = desired_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                sleep(SUBSCRIBE_DEBOUNCE).await;
                let latest = desired_rx.borrow_and_update().clone();
                subscribe_if_changed(&mut write, &mut subscribed, latest).await?;
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > LIVENESS_TIMEOUT {
                    return Err("heartbeat liveness timeout".to_string());
                }
                write.send(Message::Ping(Vec::new().into())).await.map_err(|e| e.to_string())?;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        handle_message(state, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        write.send(Message::Pong(payload)).await.map_err(|e| e.to_string())?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err("connection closed by peer".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.to_string()),
                }
            }
        }
    }
}

async fn subscribe_if_changed(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    subscribed: &mut Vec<AssetId>,
    mut desired: Vec<AssetId>,
) -> Result<(), String> {
    desired.sort();
    desired.dedup();
    if &desired == subscribed {
        return Ok(());
    }
    let req = SubscribeRequest {
        msg_type: "market",
        assets_ids: &desired,
    };
    let payload = serde_json::to_string(&req).map_err(|e| e.to_string())?;
    write
        .send(Message::Text(payload.into()))
        .await
        .map_err(|e| e.to_string())?;
    log::info!("market_feed.subscribe count={}", desired.len());
    *subscribed = desired;
    Ok(())
}

fn handle_message(state: &FeedState, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    for item in items {
        let Some(event_type) = item.get("event_type").and_then(|v| v.as_str()) else {
            continue;
        };
        match event_type {
            "book" => {
                if let Ok(book) = serde_json::from_value::<WireBook>(item) {
                    let bid = best(&book.bids, true);
                    let ask = best(&book.asks, false);
                    let tick = book.tick_size.and_then(|t| t.parse().ok());
                    state.apply_book(&book.asset_id, bid, ask, tick);
                }
            }
            "price_change" => {
                if let Ok(change) = serde_json::from_value::<WirePriceChange>(item) {
                    let bid = change
                        .price_changes
                        .iter()
                        .rev()
                        .find_map(|c| c.best_bid.as_deref().and_then(|s| s.parse().ok()));
                    let ask = change
                        .price_changes
                        .iter()
                        .rev()
                        .find_map(|c| c.best_ask.as_deref().and_then(|s| s.parse().ok()));
                    if bid.is_some() || ask.is_some() {
                        state.apply_book(&change.asset_id, bid, ask, None);
                    }
                }
            }
            "tick_size_change" => {
                if let Ok(change) = serde_json::from_value::<WireTickSizeChange>(item) {
                    if let Ok(tick) = change.new_tick_size.parse::<f64>() {
                        state.apply_tick_size(&change.asset_id, tick);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn apply_book_rejects_crossed_quotes() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.60), Some(0.55), None);
        assert!(state.last_prices(&"asset".to_string()).is_none());
    }

    #[test]
    fn apply_book_accepts_valid_quotes_and_updates_rate() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.40), Some(0.45), Some(0.01));
        let tob = state.last_prices(&"asset".to_string()).unwrap();
        assert_eq!(tob.best_bid, Some(0.40));
        assert_eq!(tob.best_ask, Some(0.45));
    }

    #[test]
    fn apply_book_rejects_one_sided_update_that_crosses_cached_other_side() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.40), Some(0.45), Some(0.01));
        // A one-sided price_change moving the bid above the cached ask must
        // be rejected even though this message alone carries no ask.
        state.apply_book(&"asset".to_string(), Some(0.50), None, None);
        let tob = state.last_prices(&"asset".to_string()).unwrap();
        assert_eq!(tob.best_bid, Some(0.40));
    }

    #[test]
    fn apply_book_accepts_one_sided_update_that_stays_valid_against_cached_side() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.40), Some(0.45), Some(0.01));
        state.apply_book(&"asset".to_string(), Some(0.42), None, None);
        let tob = state.last_prices(&"asset".to_string()).unwrap();
        assert_eq!(tob.best_bid, Some(0.42));
        assert_eq!(tob.best_ask, Some(0.45));
    }

    #[test]
    fn apply_tick_size_updates_cached_tick() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.40), Some(0.45), Some(0.01));
        state.apply_tick_size(&"asset".to_string(), 0.001);
        assert_eq!(state.tick_size(&"asset".to_string()), Some(0.001));
    }

    #[test]
    fn is_active_false_for_unseen_asset() {
        let state = FeedState::new();
        assert!(!state.is_active(&"asset".to_string(), 300.0));
    }

    #[test]
    fn is_active_true_right_after_update() {
        let state = FeedState::new();
        state.apply_book(&"asset".to_string(), Some(0.40), Some(0.45), Some(0.01));
        assert!(state.is_active(&"asset".to_string(), 300.0));
    }

    #[test]
    fn handle_message_routes_tick_size_change() {
        let state = FeedState::new();
        let msg = r#"[{"event_type":"tick_size_change","asset_id":"asset","new_tick_size":"0.001"}]"#;
        handle_message(&state, msg);
        assert_eq!(state.tick_size(&"asset".to_string()), Some(0.001));
    }

    #[test]
    fn best_picks_max_for_bids_and_min_for_asks() {
        let levels = vec![
            WirePriceLevel { price: "0.40".into(), size: "10".into() },
            WirePriceLevel { price: "0.44".into(), size: "5".into() },
        ];
        assert_eq!(best(&levels, true), Some(0.44));
        assert_eq!(best(&levels, false), Some(0.40));
    }
}
