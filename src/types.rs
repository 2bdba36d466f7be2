//! Core data model (spec section 3).

use serde::{Deserialize, Serialize};

/// Opaque venue token identifier, one per binary outcome.
pub type AssetId = String;

/// Opaque identifier grouping the two outcomes of a single market.
pub type ConditionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeSide {
    Yes,
    No,
}

/// Top-of-book snapshot for a single asset.
///
/// Invariant (spec 3/I5): when both sides are present,
/// `0 < best_bid < best_ask <= 1` and `best_ask - best_bid <= 0.20`.
/// Callers must not construct a `TopOfBook` that violates this when both
/// sides are `Some` — `MarketFeed` enforces it at the decode boundary.
#[derive(Debug, Clone, Default)]
pub struct TopOfBook {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub tick_size: Option<f64>,
    pub last_update_ts: Option<f64>,
}

impl TopOfBook {
    pub fn is_valid(best_bid: f64, best_ask: f64) -> bool {
        best_bid > 0.0 && best_bid < best_ask && best_ask <= 1.0 && (best_ask - best_bid) <= 0.20
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) if a > b => Some(a - b),
            _ => None,
        }
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) if a > b => Some(0.5 * (a + b)),
            _ => None,
        }
    }
}

/// A live resting order at the venue. At most one exists per asset at a
/// time (the side-lock invariant, I1).
#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub order_id: String,
    pub asset: AssetId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub placed_at: f64,
}

/// Per-asset committed exposure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exposure {
    pub shares_committed: f64,
    pub notional_committed_usdc: f64,
}

impl Exposure {
    pub fn add(&mut self, shares: f64, notional: f64) {
        self.shares_committed = (self.shares_committed + shares).max(0.0);
        self.notional_committed_usdc = (self.notional_committed_usdc + notional).max(0.0);
    }

    pub fn sub(&mut self, shares: f64, notional: f64) {
        self.shares_committed = (self.shares_committed - shares).max(0.0);
        self.notional_committed_usdc = (self.notional_committed_usdc - notional).max(0.0);
    }
}

/// Selector output: one chosen outcome token to trade.
#[derive(Debug, Clone)]
pub struct CandidateMarket {
    pub asset: AssetId,
    pub side: OutcomeSide,
    pub condition_id: ConditionId,
    pub spread: f64,
    pub depth: f64,
    pub volume_24h: f64,
    pub hours_to_close: f64,
    pub score: f64,
}

/// A market the orchestrator has committed to trade: the selector's output
/// plus the bookkeeping the orchestrator needs for lifecycle and the order
/// of magnitude of each fill (not a spec type name, but the natural home for
/// `asset`/`condition_id`/sizing the orchestrator threads through the tick
/// loop — grounded in the teacher's `SelectedMarket`).
#[derive(Debug, Clone)]
pub struct ActiveMarket {
    pub asset: AssetId,
    pub condition_id: ConditionId,
    pub side: OutcomeSide,
    pub order_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_of_book_rejects_crossed_book() {
        assert!(!TopOfBook::is_valid(0.50, 0.50));
        assert!(!TopOfBook::is_valid(0.55, 0.40));
    }

    #[test]
    fn top_of_book_rejects_spread_over_twenty_cents() {
        assert!(!TopOfBook::is_valid(0.30, 0.51));
    }

    #[test]
    fn top_of_book_accepts_boundary_spread() {
        assert!(TopOfBook::is_valid(0.30, 0.50));
    }

    #[test]
    fn top_of_book_rejects_ask_above_one() {
        assert!(!TopOfBook::is_valid(0.95, 1.01));
    }

    #[test]
    fn exposure_sub_clamps_at_zero() {
        let mut e = Exposure::default();
        e.add(5.0, 2.5);
        e.sub(10.0, 10.0);
        assert_eq!(e.shares_committed, 0.0);
        assert_eq!(e.notional_committed_usdc, 0.0);
    }

    #[test]
    fn exposure_add_then_sub_round_trips() {
        let mut e = Exposure::default();
        e.add(5.0, 2.3);
        e.sub(5.0, 2.3);
        assert_eq!(e.shares_committed, 0.0);
        assert!((e.notional_committed_usdc).abs() < 1e-12);
    }
}
