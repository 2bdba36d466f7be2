//! Top-level tick loop tying market selection, feeds, risk, and order
//! management together (spec 4.7). One `StateMachine` per currently-active
//! asset; the orchestrator itself only ever touches shared state through
//! the narrow interfaces those modules expose, so it stays free of locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use crate::config::Settings;
use crate::market_feed::{FeedState, MarketFeed};
use crate::market_selector::MarketSelector;
use crate::order_manager::OrderManager;
use crate::risk_manager::RiskManager;
use crate::state_machine::{State, StateMachine};
use crate::types::{ActiveMarket, AssetId, Side};
use crate::user_feed::{UserEvent, UserFeed};
use crate::utils::now_ts;
use crate::venue::{ClobRest, MarketDirectory, UserAuth};

const TICK_INTERVAL: Duration = Duration::from_millis(500);
const MARKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(180);
/// How long a freshly-selected slot is given before its exit criteria apply
/// (spec 4.7) — lets the feed catch up on a just-subscribed asset.
const EXIT_CRITERIA_GRACE_SEC: f64 = 30.0;
/// A tracked asset with no book update in this long is flagged by the
/// periodic health check (spec 4.7).
const HEALTH_STALE_SEC: f64 = 300.0;

struct Slot {
    sm: StateMachine,
    market: ActiveMarket,
    /// Set once the asset drops out of selection (or the process is
    /// shutting down). A retiring slot never starts a new buy and is
    /// dropped once it holds no resting order.
    retiring: bool,
    initialized_at: f64,
}

pub struct MarketMaker {
    settings: Settings,
    feed_state: FeedState,
    order_manager: OrderManager,
    risk: RiskManager,
    selector: MarketSelector,
    desired_assets: tokio::sync::watch::Sender<Vec<AssetId>>,
    user_feed_markets: tokio::sync::watch::Sender<Vec<String>>,
    user_events: mpsc::Receiver<UserEvent>,
    slots: HashMap<AssetId, Slot>,
}

impl MarketMaker {
    pub fn new(
        settings: Settings,
        rest: Arc<dyn ClobRest>,
        directory: Arc<dyn MarketDirectory>,
        user_auth: Arc<dyn UserAuth>,
    ) -> Self {
        let market_feed = MarketFeed::new(settings.venue.wss_url.clone());
        let feed_state = market_feed.state();
        let desired_assets = market_feed.desired_sender();
        market_feed.spawn();

        let (user_feed, user_events) = UserFeed::new(settings.venue.wss_user_url.clone(), user_auth);
        let user_feed_markets = user_feed.markets_sender();
        user_feed.spawn();

        let order_manager = OrderManager::new(
            rest.clone(),
            settings.replace_price_ticks,
            settings.ask_chase_window_sec,
            settings.ask_chase_max_replaces,
        );
        let risk = RiskManager::new(settings.clone());
        let selector = MarketSelector::new(settings.clone(), directory, rest, feed_state.clone());

        Self {
            settings,
            feed_state,
            order_manager,
            risk,
            selector,
            desired_assets,
            user_feed_markets,
            user_events,
            slots: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = interval(TICK_INTERVAL);
        let mut refresh = interval(MARKET_REFRESH_INTERVAL);
        let mut metrics = interval(Duration::from_millis(self.settings.metrics_log_interval_ms));
        let mut reconcile = interval(Duration::from_millis(self.settings.reconcile_interval_ms));
        let mut health = interval(HEALTH_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("orchestrator.shutdown liquidating {} markets", self.slots.len());
                        self.deactivate_all().await;
                        return;
                    }
                }

                _ = refresh.tick() => {
                    self.refresh_selection().await;
                }

                _ = tick.tick() => {
                    self.tick().await;
                }

                _ = reconcile.tick() => {
                    self.reconcile().await;
                }

                _ = metrics.tick() => {
                    self.log_metrics();
                }

                _ = health.tick() => {
                    self.log_health();
                }

                Some(event) = self.user_events.recv() => {
                    self.handle_user_event(event).await;
                }
            }
        }
    }

    /// Cancels anything the venue reports resting for a tracked asset that
    /// doesn't match the locally-tracked order id — drift from a crash
    /// restart or a manual cancel elsewhere (spec 4.7).
    async fn reconcile(&mut self) {
        let assets: Vec<AssetId> = self.slots.keys().cloned().collect();
        for asset in assets {
            let tracked_id = self.slots.get(&asset).and_then(|s| s.sm.order().map(|o| o.order_id.clone()));
            let open = match self.order_manager.open_orders(&asset).await {
                Ok(open) => open,
                Err(e) => {
                    log::warn!("orchestrator.reconcile.error asset={asset} err={e}");
                    continue;
                }
            };
            for order in open {
                if Some(&order.order_id) != tracked_id.as_ref() {
                    log::warn!("orchestrator.reconcile.orphan_order asset={asset} order_id={}", order.order_id);
                    let _ = self.order_manager.cancel(&order.order_id).await;
                }
            }
        }
    }

    async fn refresh_selection(&mut self) {
        let candidates = self.selector.select(now_ts()).await;
        let mut seen: Vec<AssetId> = Vec::new();

        for c in candidates {
            seen.push(c.asset.clone());
            // A retiring slot with no order left is free to be reused
            // immediately; one still unwinding keeps retiring this cycle.
            let reusable = self.slots.get(&c.asset).map(|s| s.retiring && s.sm.order().is_none()).unwrap_or(false);
            if reusable {
                self.slots.remove(&c.asset);
            }
            self.slots.entry(c.asset.clone()).or_insert_with(|| Slot {
                sm: StateMachine::new(),
                market: ActiveMarket {
                    asset: c.asset.clone(),
                    condition_id: c.condition_id.clone(),
                    side: c.side,
                    order_size: self.settings.order_size_shares,
                },
                retiring: false,
                initialized_at: now_ts(),
            });
        }

        let stale: Vec<AssetId> = self
            .slots
            .keys()
            .filter(|a| !seen.contains(a))
            .cloned()
            .collect();
        for asset in stale {
            self.deactivate_one(&asset, now_ts()).await;
        }

        let _ = self.desired_assets.send(seen);
        let _ = self
            .user_feed_markets
            .send(self.slots.values().map(|s| s.market.condition_id.clone()).collect());
    }

    async fn tick(&mut self) {
        let now = now_ts();
        let assets: Vec<AssetId> = self.slots.keys().cloned().collect();

        for asset in assets {
            self.tick_one(&asset, now).await;
        }
    }

    async fn tick_one(&mut self, asset: &AssetId, now: f64) {
        if self.slots.get(asset).map(|s| s.retiring).unwrap_or(false) {
            if self.slots.get(asset).map(|s| s.sm.order().is_none()).unwrap_or(true) {
                self.slots.remove(asset);
                self.risk.clean_market(asset);
            }
            return;
        }

        if self.exit_criteria_met(asset, now) {
            self.deactivate_one(asset, now).await;
            return;
        }

        let Some(tob) = self.feed_state.last_prices(asset) else {
            return;
        };

        let state = self.slots.get(asset).map(|s| s.sm.state());
        match state {
            Some(State::Idle) => self.try_start_buy(asset, &tob, now).await,
            Some(State::WaitBuyFill) => self.maybe_timeout_buy(asset, now).await,
            Some(State::WaitSellFill) | Some(State::AskChase) => self.maybe_chase_ask(asset, &tob, now).await,
            Some(State::Complete) => {
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.complete_and_reset(now);
                }
            }
            _ => {}
        }
    }

    /// True once a slot has outlived its grace period with either no feed
    /// data at all (`no_prices`) or a spread that has collapsed below the
    /// tradeable floor (`spread_too_small`) — spec 4.7's exit criteria.
    fn exit_criteria_met(&self, asset: &AssetId, now: f64) -> bool {
        let Some(slot) = self.slots.get(asset) else { return false };
        if now - slot.initialized_at < EXIT_CRITERIA_GRACE_SEC {
            return false;
        }
        match self.feed_state.last_prices(asset).and_then(|t| t.spread()) {
            None => {
                log::warn!("orchestrator.exit_criteria asset={asset} reason=no_prices");
                true
            }
            Some(spread) if spread * 100.0 < self.settings.min_spread_cents => {
                log::warn!("orchestrator.exit_criteria asset={asset} reason=spread_too_small");
                true
            }
            Some(_) => false,
        }
    }

    /// Logs any tracked asset with no book update in `HEALTH_STALE_SEC`
    /// (spec 4.7's periodic market-activity health check).
    fn log_health(&self) {
        for asset in self.slots.keys() {
            if !self.feed_state.is_active(asset, HEALTH_STALE_SEC) {
                log::warn!("orchestrator.health.stale_book asset={asset}");
            }
        }
    }

    async fn try_start_buy(&mut self, asset: &AssetId, tob: &crate::types::TopOfBook, now: f64) {
        let Some(bid) = tob.best_bid else { return };
        let size = self
            .slots
            .get(asset)
            .map(|s| s.market.order_size)
            .unwrap_or(self.settings.order_size_shares);

        if self.risk.check_buy(asset, tob, bid, size, now).is_err() {
            return;
        }
        let Some(ask) = tob.best_ask else { return };

        match self.order_manager.place(asset, Side::Buy, bid, size, ask).await {
            Ok(order) => {
                self.risk.record_buy_order(asset, size, bid * size);
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.start_buy(order, now);
                    let _ = slot.sm.buy_acked(now);
                }
            }
            Err(e) => log::warn!("orchestrator.place_buy.error asset={asset} err={e}"),
        }
    }

    async fn maybe_timeout_buy(&mut self, asset: &AssetId, now: f64) {
        let ttl = self.settings.order_ttl_ms as f64 / 1000.0;
        let Some(slot) = self.slots.get(asset) else { return };
        let Some(order) = slot.sm.order() else { return };
        if now - order.placed_at < ttl {
            return;
        }
        let order_id = order.order_id.clone();
        let (size, price) = (order.size, order.price);
        if self.order_manager.cancel(&order_id).await.is_ok() {
            self.risk.cancel_buy_order(asset, size, price * size);
            if let Some(slot) = self.slots.get_mut(asset) {
                let _ = slot.sm.buy_cancelled(now);
            }
        }
    }

    async fn maybe_chase_ask(&mut self, asset: &AssetId, tob: &crate::types::TopOfBook, now: f64) {
        let Some(ask) = tob.best_ask else { return };
        let Some(bid) = tob.best_bid else { return };
        let (should_replace, order_id, size, chase_started_at, replaces) = {
            let Some(slot) = self.slots.get(asset) else { return };
            let Some(order) = slot.sm.order() else { return };
            (
                self.order_manager.should_replace_sell(order, tob),
                order.order_id.clone(),
                order.size,
                slot.sm.entered_at(),
                slot.sm.ask_chase_replaces(),
            )
        };

        if !should_replace || !self.order_manager.ask_chase_has_budget(replaces, chase_started_at) {
            return;
        }

        match self.order_manager.replace(&order_id, asset, Side::Sell, ask, size, bid).await {
            Ok(order) => {
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.begin_ask_chase(now);
                    let _ = slot.sm.sell_placed(order, now);
                }
            }
            Err(e) => log::warn!("orchestrator.ask_chase.error asset={asset} err={e}"),
        }
    }

    async fn handle_user_event(&mut self, event: UserEvent) {
        match event {
            UserEvent::Fill {
                asset,
                side,
                price,
                size,
                ..
            } => self.handle_fill(&asset, side, price, size).await,
            UserEvent::OrderStatus { order_id, asset, live } => {
                if !live {
                    self.handle_order_cancelled(&asset, &order_id).await;
                }
            }
        }
    }

    /// A CANCELLED status for the order currently tracked as this asset's
    /// resting buy means it was cancelled externally (venue UI, another
    /// process); bring the state machine back to `Idle` and release the
    /// reserved exposure. A status for any other id is stale — ignore it.
    async fn handle_order_cancelled(&mut self, asset: &AssetId, order_id: &str) {
        let matches = self
            .slots
            .get(asset)
            .and_then(|s| s.sm.order())
            .map(|o| o.side == Side::Buy && o.order_id == order_id);
        let Some(true) = matches else { return };

        let (size, price) = self
            .slots
            .get(asset)
            .and_then(|s| s.sm.order())
            .map(|o| (o.size, o.price))
            .unwrap_or((0.0, 0.0));
        self.risk.cancel_buy_order(asset, size, price * size);
        if let Some(slot) = self.slots.get_mut(asset) {
            if let Err(e) = slot.sm.buy_cancelled(now_ts()) {
                log::warn!("orchestrator.order_cancelled.invalid_transition asset={asset} err={e}");
            }
        }
    }

    async fn handle_fill(&mut self, asset: &AssetId, side: Side, price: f64, size: f64) {
        let now = now_ts();
        let state = self.slots.get(asset).map(|s| s.sm.state());
        match (state, side) {
            (Some(State::WaitBuyFill), Side::Buy) => {
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.buy_filled(now);
                }
                self.place_initial_sell(asset, price, size, now).await;
            }
            (Some(State::WaitSellFill), Side::Sell) | (Some(State::AskChase), Side::Sell) => {
                self.risk.record_sell_fill(asset, size, price * size);
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.sell_filled(now);
                }
            }
            _ => {}
        }
    }

    async fn place_initial_sell(&mut self, asset: &AssetId, buy_price: f64, size: f64, now: f64) {
        let Some(tob) = self.feed_state.last_prices(asset) else { return };
        let ask = tob.best_ask.unwrap_or(buy_price);
        let Some(bid) = tob.best_bid else { return };
        match self.order_manager.place(asset, Side::Sell, ask, size, bid).await {
            Ok(order) => {
                if let Some(slot) = self.slots.get_mut(asset) {
                    let _ = slot.sm.sell_placed(order, now);
                }
            }
            Err(e) => log::error!("orchestrator.place_sell.error asset={asset} err={e}"),
        }
    }

    /// A buy order in flight is cancelled (no inventory is at stake yet). A
    /// resting sell is left live — it is the liquidation leg itself, and
    /// per the recorded deactivation-liquidation decision the core does not
    /// invent a retry/market-order fallback for it.
    async fn deactivate_one(&mut self, asset: &AssetId, now: f64) {
        let resting_buy = self.slots.get(asset).and_then(|s| {
            s.sm.order().filter(|o| o.side == Side::Buy).map(|o| (o.order_id.clone(), o.size, o.price))
        });
        if let Some((order_id, size, price)) = resting_buy {
            if self.order_manager.cancel(&order_id).await.is_ok() {
                self.risk.cancel_buy_order(asset, size, price * size);
            }
        }
        if let Some(slot) = self.slots.get_mut(asset) {
            // Best-effort: some states (e.g. Complete) don't have a
            // Deactivating edge, since nothing is resting there to unwind.
            let _ = slot.sm.deactivate(now);
            slot.retiring = true;
        }
    }

    async fn deactivate_all(&mut self) {
        let assets: Vec<AssetId> = self.slots.keys().cloned().collect();
        for asset in assets {
            self.deactivate_one(&asset, now_ts()).await;
        }
    }

    fn log_metrics(&self) {
        let global = self.risk.global_exposure();
        log::info!(
            "orchestrator.metrics active_markets={} global_shares={:.2} global_notional_usdc={:.2}",
            self.slots.len(),
            global.shares_committed,
            global.notional_committed_usdc,
        );
    }
}
