//! Pre-trade risk checks and exposure bookkeeping (spec 4.5, invariants I2-I5).
//!
//! Checks run in a fixed order and return on the first violation, in the
//! same style as the teacher's `RiskEngine::can_quote` — cheapest/most
//! decisive checks first so a stale feed or a crossed book never reaches
//! the notional-cap arithmetic.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::config::Settings;
use crate::error::CoreError;
use crate::types::{AssetId, Exposure, TopOfBook};

const FEED_STALE_SECS: f64 = 10.0;

pub struct RiskManager {
    settings: Settings,
    per_market: RwLock<HashMap<AssetId, Exposure>>,
    global: RwLock<Exposure>,
}

impl RiskManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            per_market: RwLock::new(HashMap::new()),
            global: RwLock::new(Exposure::default()),
        }
    }

    pub fn exposure_for(&self, asset: &AssetId) -> Exposure {
        self.per_market.read().get(asset).copied().unwrap_or_default()
    }

    pub fn global_exposure(&self) -> Exposure {
        *self.global.read()
    }

    /// Ordered pre-trade check for a new buy order. On success the caller
    /// still must call `record_buy_order` once the order is actually
    /// resting — this only judges whether it *would* be safe to place.
    pub fn check_buy(
        &self,
        asset: &AssetId,
        tob: &TopOfBook,
        price: f64,
        size: f64,
        now: f64,
    ) -> Result<(), CoreError> {
        let stale = match tob.last_update_ts {
            Some(ts) => (now - ts).max(0.0),
            None => f64::INFINITY,
        };
        if stale > FEED_STALE_SECS {
            return Err(CoreError::RiskDenied { reason: "feed_stale" });
        }

        let (Some(bid), Some(ask)) = (tob.best_bid, tob.best_ask) else {
            return Err(CoreError::RiskDenied { reason: "no_top_of_book" });
        };
        if !TopOfBook::is_valid(bid, ask) {
            return Err(CoreError::RiskDenied { reason: "crossed_or_wide_book" });
        }

        // Evaluation order matches spec §4.5 exactly: min_notional,
        // expected_profit_low, min_size, then the three cap checks.
        let notional = price * size;
        if notional < 0.995 * self.settings.min_notional_per_order_usdc {
            return Err(CoreError::RiskDenied { reason: "below_min_notional" });
        }

        let spread = ask - bid;
        let expected_profit = spread * size * price;
        if expected_profit < self.settings.min_expected_profit_usdc {
            return Err(CoreError::RiskDenied { reason: "insufficient_expected_profit" });
        }

        if size < self.settings.min_size_shares {
            return Err(CoreError::RiskDenied { reason: "below_min_size" });
        }

        let existing = self.exposure_for(asset);
        if existing.shares_committed + size > self.settings.max_shares_per_market {
            return Err(CoreError::RiskDenied { reason: "market_share_cap" });
        }
        if existing.notional_committed_usdc + notional > self.settings.max_usdc_per_market {
            return Err(CoreError::RiskDenied { reason: "market_notional_cap" });
        }

        let global = self.global_exposure();
        if global.notional_committed_usdc + notional > self.settings.max_notional_at_risk_usdc {
            return Err(CoreError::RiskDenied { reason: "global_notional_cap" });
        }

        Ok(())
    }

    pub fn record_buy_order(&self, asset: &AssetId, shares: f64, notional: f64) {
        self.per_market.write().entry(asset.clone()).or_default().add(shares, notional);
        self.global.write().add(shares, notional);
    }

    pub fn cancel_buy_order(&self, asset: &AssetId, shares: f64, notional: f64) {
        if let Some(e) = self.per_market.write().get_mut(asset) {
            e.sub(shares, notional);
        }
        self.global.write().sub(shares, notional);
    }

    pub fn record_sell_fill(&self, asset: &AssetId, shares: f64, notional: f64) {
        if let Some(e) = self.per_market.write().get_mut(asset) {
            e.sub(shares, notional);
        }
        self.global.write().sub(shares, notional);
    }

    /// Drops all tracked exposure for an asset being deactivated, so a
    /// reselected market starts from a clean slate.
    pub fn clean_market(&self, asset: &AssetId) {
        if let Some(e) = self.per_market.write().remove(asset) {
            self.global.write().sub(e.shares_committed, e.notional_committed_usdc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tob(bid: f64, ask: f64, ts: f64) -> TopOfBook {
        TopOfBook {
            best_bid: Some(bid),
            best_ask: Some(ask),
            tick_size: Some(0.01),
            last_update_ts: Some(ts),
        }
    }

    #[test]
    fn rejects_stale_feed_before_anything_else() {
        let rm = RiskManager::new(Settings::for_test());
        let err = rm.check_buy(&"a".to_string(), &tob(0.40, 0.45, 0.0), 0.40, 10.0, 100.0).unwrap_err();
        assert!(matches!(err, CoreError::RiskDenied { reason: "feed_stale" }));
    }

    #[test]
    fn rejects_crossed_book() {
        let rm = RiskManager::new(Settings::for_test());
        let err = rm.check_buy(&"a".to_string(), &tob(0.50, 0.40, 100.0), 0.45, 10.0, 100.0).unwrap_err();
        assert!(matches!(err, CoreError::RiskDenied { .. }));
    }

    #[test]
    fn accepts_order_within_all_caps() {
        let rm = RiskManager::new(Settings::for_test());
        assert!(rm.check_buy(&"a".to_string(), &tob(0.40, 0.50, 100.0), 0.40, 10.0, 100.0).is_ok());
    }

    #[test]
    fn accepts_notional_exactly_at_tolerance_boundary() {
        let mut settings = Settings::for_test();
        settings.min_notional_per_order_usdc = 1.0;
        settings.min_expected_profit_usdc = 0.0;
        let rm = RiskManager::new(settings);
        // notional = 0.995 * MIN_NOTIONAL_PER_ORDER_USDC exactly.
        let price: f64 = 0.199;
        let size: f64 = 5.0;
        assert!((price * size - 0.995).abs() < 1e-9);
        assert!(rm.check_buy(&"a".to_string(), &tob(0.199, 0.50, 100.0), price, size, 100.0).is_ok());
    }

    #[test]
    fn rejects_once_per_market_notional_cap_exceeded() {
        let mut settings = Settings::for_test();
        settings.max_usdc_per_market = 5.0;
        let rm = RiskManager::new(settings);
        let err = rm.check_buy(&"a".to_string(), &tob(0.40, 0.50, 100.0), 0.40, 20.0, 100.0).unwrap_err();
        assert!(matches!(err, CoreError::RiskDenied { reason: "market_notional_cap" }));
    }

    #[test]
    fn record_then_cancel_round_trips_exposure() {
        let rm = RiskManager::new(Settings::for_test());
        rm.record_buy_order(&"a".to_string(), 10.0, 4.0);
        assert_eq!(rm.exposure_for(&"a".to_string()).shares_committed, 10.0);
        rm.cancel_buy_order(&"a".to_string(), 10.0, 4.0);
        assert_eq!(rm.exposure_for(&"a".to_string()).shares_committed, 0.0);
        assert_eq!(rm.global_exposure().shares_committed, 0.0);
    }

    #[test]
    fn clean_market_removes_tracked_exposure_from_global_total() {
        let rm = RiskManager::new(Settings::for_test());
        rm.record_buy_order(&"a".to_string(), 10.0, 4.0);
        rm.record_buy_order(&"b".to_string(), 5.0, 2.0);
        rm.clean_market(&"a".to_string());
        assert_eq!(rm.exposure_for(&"a".to_string()).shares_committed, 0.0);
        assert_eq!(rm.global_exposure().shares_committed, 5.0);
    }
}
