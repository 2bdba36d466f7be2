//! Order placement, replacement, and ask-chase logic (spec 4.4).
//!
//! Talks to the venue only through `venue::ClobRest`; which concrete
//! implementation that is (the real CLOB or the dry-run fake) is decided
//! once at startup and is invisible here.

use std::sync::Arc;

use crate::error::CoreError;
use crate::quantization::quantize;
use crate::types::{ActiveOrder, AssetId, Side, TopOfBook};
use crate::utils::now_ts;
use crate::venue::{ClobRest, VenueOrder};

pub struct OrderManager {
    venue: Arc<dyn ClobRest>,
    replace_price_ticks: f64,
    ask_chase_window_sec: f64,
    ask_chase_max_replaces: u32,
}

impl OrderManager {
    pub fn new(
        venue: Arc<dyn ClobRest>,
        replace_price_ticks: f64,
        ask_chase_window_sec: f64,
        ask_chase_max_replaces: u32,
    ) -> Self {
        Self {
            venue,
            replace_price_ticks,
            ask_chase_window_sec,
            ask_chase_max_replaces,
        }
    }

    /// `opposite_best` is the other side's best price (best ask for a BUY,
    /// best bid for a SELL) — the post-only precondition (§4.4) rejects
    /// before ever reaching quantization or the venue.
    pub async fn place(
        &self,
        asset: &AssetId,
        side: Side,
        price: f64,
        size: f64,
        opposite_best: f64,
    ) -> Result<ActiveOrder, CoreError> {
        let would_cross = match side {
            Side::Buy => price >= opposite_best,
            Side::Sell => price <= opposite_best,
        };
        if would_cross {
            return Err(CoreError::WouldCross { price });
        }

        // Quantization failure means the order is malformed before it ever
        // reaches the venue; surface it directly rather than attempting to
        // post.
        quantize(side, price, size)?;

        let venue_order = self.venue.post_limit_order(asset, side, price, size).await?;
        Ok(ActiveOrder {
            order_id: venue_order.order_id,
            asset: asset.clone(),
            side,
            price,
            size,
            placed_at: now_ts(),
        })
    }

    pub async fn cancel(&self, order_id: &str) -> Result<(), CoreError> {
        self.venue.cancel_order(order_id).await
    }

    pub async fn cancel_all(&self) -> Result<(), CoreError> {
        self.venue.cancel_all().await
    }

    /// What the venue thinks is resting for an asset, used by the periodic
    /// reconcile pass (spec 4.7) to catch drift from the locally-tracked
    /// order — a crash-restart, a manual cancel on the venue UI, and so on.
    pub async fn open_orders(&self, asset: &AssetId) -> Result<Vec<VenueOrder>, CoreError> {
        self.venue.get_open_orders(asset).await
    }

    /// Replace an existing resting order: cancel, then place at the new
    /// price/size. The caller is responsible for updating the state
    /// machine's tracked order with the result.
    pub async fn replace(
        &self,
        old_order_id: &str,
        asset: &AssetId,
        side: Side,
        new_price: f64,
        new_size: f64,
        opposite_best: f64,
    ) -> Result<ActiveOrder, CoreError> {
        self.cancel(old_order_id).await?;
        self.place(asset, side, new_price, new_size, opposite_best).await
    }

    /// True when a resting buy has drifted more than `replace_price_ticks`
    /// ticks away from the best bid and should be cancelled and replaced.
    pub fn should_replace_buy(&self, order: &ActiveOrder, tob: &TopOfBook) -> bool {
        let (Some(bid), Some(tick)) = (tob.best_bid, tob.tick_size) else {
            return false;
        };
        if tick <= 0.0 {
            return false;
        }
        ((bid - order.price) / tick).abs() >= self.replace_price_ticks
    }

    /// True when a resting sell has drifted from the best ask by more than
    /// `replace_price_ticks` ticks. Same threshold whether the caller is in
    /// `PlaceSell`'s initial wait or already ask-chasing — the two states
    /// differ only in whether `ask_chase_replaces` has room left.
    pub fn should_replace_sell(&self, order: &ActiveOrder, tob: &TopOfBook) -> bool {
        let (Some(ask), Some(tick)) = (tob.best_ask, tob.tick_size) else {
            return false;
        };
        if tick <= 0.0 {
            return false;
        }
        ((ask - order.price) / tick).abs() >= self.replace_price_ticks
    }

    /// Whether the ask-chase loop has budget left to issue another replace,
    /// given how long it has been chasing and how many replaces it has
    /// already spent.
    pub fn ask_chase_has_budget(&self, replaces_so_far: u32, chase_started_at: f64) -> bool {
        replaces_so_far < self.ask_chase_max_replaces
            && now_ts() - chase_started_at < self.ask_chase_window_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::DryRunClobRest;

    fn tob(bid: f64, ask: f64, tick: f64) -> TopOfBook {
        TopOfBook {
            best_bid: Some(bid),
            best_ask: Some(ask),
            tick_size: Some(tick),
            last_update_ts: Some(0.0),
        }
    }

    fn manager() -> OrderManager {
        OrderManager::new(Arc::new(DryRunClobRest::new()), 1.0, 15.0, 5)
    }

    fn order(side: Side, price: f64) -> ActiveOrder {
        ActiveOrder {
            order_id: "o1".into(),
            asset: "a1".into(),
            side,
            price,
            size: 5.0,
            placed_at: 0.0,
        }
    }

    #[test]
    fn should_replace_buy_when_bid_drifts_past_tick_threshold() {
        let om = manager();
        let o = order(Side::Buy, 0.45);
        assert!(!om.should_replace_buy(&o, &tob(0.45, 0.50, 0.01)));
        assert!(om.should_replace_buy(&o, &tob(0.47, 0.50, 0.01)));
    }

    #[test]
    fn should_replace_sell_when_ask_drifts_past_tick_threshold() {
        let om = manager();
        let o = order(Side::Sell, 0.50);
        assert!(!om.should_replace_sell(&o, &tob(0.45, 0.50, 0.01)));
        assert!(om.should_replace_sell(&o, &tob(0.45, 0.48, 0.01)));
    }

    #[test]
    fn ask_chase_budget_exhausts_on_replace_count() {
        let om = manager();
        assert!(om.ask_chase_has_budget(4, now_ts()));
        assert!(!om.ask_chase_has_budget(5, now_ts()));
    }

    #[tokio::test]
    async fn place_then_cancel_round_trips_through_dry_run_venue() {
        let om = manager();
        let order = om.place(&"a1".to_string(), Side::Buy, 0.45, 5.0, 0.50).await.unwrap();
        assert_eq!(order.price, 0.45);
        om.cancel(&order.order_id).await.unwrap();
    }

    #[tokio::test]
    async fn place_rejects_unquantizable_order() {
        let om = manager();
        assert!(om.place(&"a1".to_string(), Side::Buy, 0.0, 5.0, 0.50).await.is_err());
    }

    #[tokio::test]
    async fn place_rejects_crossing_buy() {
        let om = manager();
        let err = om.place(&"a1".to_string(), Side::Buy, 0.50, 5.0, 0.45).await.unwrap_err();
        assert!(matches!(err, CoreError::WouldCross { price } if price == 0.50));
    }

    #[tokio::test]
    async fn place_rejects_crossing_sell() {
        let om = manager();
        let err = om.place(&"a1".to_string(), Side::Sell, 0.45, 5.0, 0.50).await.unwrap_err();
        assert!(matches!(err, CoreError::WouldCross { .. }));
    }

    #[tokio::test]
    async fn open_orders_reflects_what_was_placed() {
        let om = manager();
        om.place(&"a1".to_string(), Side::Buy, 0.45, 5.0, 0.50).await.unwrap();
        assert_eq!(om.open_orders(&"a1".to_string()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_clears_resting_orders() {
        let om = manager();
        om.place(&"a1".to_string(), Side::Buy, 0.45, 5.0, 0.50).await.unwrap();
        om.cancel_all().await.unwrap();
        assert!(om.open_orders(&"a1".to_string()).await.unwrap().is_empty());
    }
}
