//! Candidate-market discovery and ranking (spec 4.6).
//!
//! Polled on its own cadence, separate from the per-tick orchestrator loop.
//! Filters the venue's listed markets down to ones worth quoting, picks
//! which of the two binary outcomes to trade, scores survivors, and caps how
//! many markets can come from the same event.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::market_feed::FeedState;
use crate::types::{CandidateMarket, OutcomeSide};
use crate::venue::{BookLevel, ClobRest, ListedMarket, MarketDirectory};

/// Depth (in USDC notional, top two levels) assumed for a market quoted off
/// the live websocket book, where only price/spread is cheaply observable
/// and a real top-2 depth figure would need its own REST round-trip. Still
/// compared against `MIN_DEPTH_TOP2_USD` like any REST-derived figure.
const ASSUMED_WS_DEPTH_USD: f64 = 1_000.0;

/// Depth normalization thresholds for REST book-snapshot levels (spec 4.6).
const REST_SIZE_RAW_MIS_SCALE_THRESHOLD: f64 = 100_000.0;
const REST_SIZE_RAW_MIS_SCALE_DIVISOR: f64 = 1_000_000.0;
const REST_SIZE_MAX: f64 = 1_000_000.0;
const REST_DEPTH_CAP_USD: f64 = 10_000.0;

pub struct MarketSelector {
    settings: Settings,
    directory: Arc<dyn MarketDirectory>,
    rest: Arc<dyn ClobRest>,
    feed: FeedState,
}

struct BookMetrics {
    spread: f64,
    depth_usd: f64,
}

/// Sums `price*size` over the top two levels of one side of a REST book
/// snapshot, decoding mis-scaled raw sizes and discarding malformed levels
/// before the sum is taken (spec 4.6 "Depth normalization").
fn normalized_side_depth(levels: &[BookLevel]) -> f64 {
    levels
        .iter()
        .take(2)
        .filter_map(|l| {
            let size = if l.size > REST_SIZE_RAW_MIS_SCALE_THRESHOLD {
                l.size / REST_SIZE_RAW_MIS_SCALE_DIVISOR
            } else {
                l.size
            };
            if l.price > 0.0 && l.price <= 1.0 && size > 0.0 && size < REST_SIZE_MAX {
                Some(l.price * size)
            } else {
                None
            }
        })
        .sum()
}

impl MarketSelector {
    pub fn new(
        settings: Settings,
        directory: Arc<dyn MarketDirectory>,
        rest: Arc<dyn ClobRest>,
        feed: FeedState,
    ) -> Self {
        Self {
            settings,
            directory,
            rest,
            feed,
        }
    }

    async fn metrics_for(&self, asset: &str) -> Option<BookMetrics> {
        if let Some(tob) = self.feed.last_prices(&asset.to_string()) {
            if let (Some(bid), Some(ask)) = (tob.best_bid, tob.best_ask) {
                if ask > bid {
                    return Some(BookMetrics {
                        spread: ask - bid,
                        depth_usd: ASSUMED_WS_DEPTH_USD,
                    });
                }
            }
        }

        let snapshot = self.rest.get_order_book(&asset.to_string()).await.ok()?;
        let best_bid = snapshot.bids.iter().map(|l| l.price).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.max(p)))
        })?;
        let best_ask = snapshot.asks.iter().map(|l| l.price).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.min(p)))
        })?;
        if best_ask <= best_bid {
            return None;
        }
        let depth_usd =
            (normalized_side_depth(&snapshot.bids) + normalized_side_depth(&snapshot.asks)).min(REST_DEPTH_CAP_USD);
        Some(BookMetrics {
            spread: best_ask - best_bid,
            depth_usd,
        })
    }

    /// Picks the larger-spread outcome of the two when both are valid
    /// (spec 4.6 step 5) — the wider side is the one worth quoting.
    async fn choose_side(&self, listing: &ListedMarket) -> Option<(String, OutcomeSide, BookMetrics)> {
        let yes = self.metrics_for(&listing.yes_asset).await;
        let no = self.metrics_for(&listing.no_asset).await;
        match (yes, no) {
            (Some(y), Some(n)) if n.spread > y.spread => Some((listing.no_asset.clone(), OutcomeSide::No, n)),
            (Some(y), _) => Some((listing.yes_asset.clone(), OutcomeSide::Yes, y)),
            (None, Some(n)) => Some((listing.no_asset.clone(), OutcomeSide::No, n)),
            (None, None) => None,
        }
    }

    fn passes_strict_filters(&self, listing: &ListedMarket, metrics: &BookMetrics, hours_to_close: f64) -> bool {
        let spread_cents = metrics.spread * 100.0;
        if spread_cents < self.settings.min_spread_cents {
            return false; // spread_too_small
        }
        if spread_cents > self.settings.max_spread_cents {
            return false; // spread_too_large
        }
        if listing.volume_24h < self.settings.min_volume_24h_usd {
            return false; // volume_low
        }
        if metrics.depth_usd < self.settings.min_depth_top2_usd {
            return false; // depth_low
        }
        if hours_to_close < self.settings.hours_to_close_min {
            return false; // closing_soon
        }
        if metrics.spread * self.settings.min_notional_per_order_usdc < self.settings.min_expected_profit_usdc {
            return false; // expected_profit_low
        }
        true
    }

    fn score(metrics: &BookMetrics, listing: &ListedMarket, hours_to_close: f64) -> f64 {
        0.4 * (metrics.spread * 1000.0)
            + 0.3 * (metrics.depth_usd + 1.0).log10() * 100.0
            + 0.2 * (listing.volume_24h + 1.0).log10() * 50.0
            + 0.1 * (hours_to_close / 24.0).min(30.0)
    }

    pub async fn select(&self, now: f64) -> Vec<CandidateMarket> {
        let listings = match self.directory.list_active_markets().await {
            Ok(l) => l,
            Err(e) => {
                log::error!("market_selector.directory.error err={e}");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for listing in &listings {
            let Some((asset, side, metrics)) = self.choose_side(listing).await else {
                continue;
            };
            let hours_to_close = (listing.end_date_ts - now) / 3600.0;
            if !self.passes_strict_filters(listing, &metrics, hours_to_close) {
                continue;
            }
            let score = Self::score(&metrics, listing, hours_to_close);
            candidates.push(CandidateMarket {
                asset,
                side,
                condition_id: listing.condition_id.clone(),
                spread: metrics.spread,
                depth: metrics.depth_usd,
                volume_24h: listing.volume_24h,
                hours_to_close,
                score,
            });
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut per_event: HashMap<String, usize> = HashMap::new();
        let mut selected = Vec::new();
        for c in candidates {
            let count = per_event.entry(c.condition_id.clone()).or_insert(0);
            if *count >= self.settings.max_markets_per_event {
                continue;
            }
            *count += 1;
            selected.push(c);
            if selected.len() >= self.settings.max_markets {
                break;
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::venue::DryRunClobRest;
    use async_trait::async_trait;

    struct FakeDirectory(Vec<ListedMarket>);

    #[async_trait]
    impl MarketDirectory for FakeDirectory {
        async fn list_active_markets(&self) -> Result<Vec<ListedMarket>, CoreError> {
            Ok(self.0.clone())
        }
    }

    fn listing(id: &str, vol: f64, hours: f64) -> ListedMarket {
        ListedMarket {
            condition_id: id.to_string(),
            yes_asset: format!("{id}-yes"),
            no_asset: format!("{id}-no"),
            volume_24h: vol,
            end_date_ts: hours * 3600.0,
            event_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn filters_out_markets_below_volume_floor() {
        let settings = Settings::for_test();
        let feed = FeedState::new();
        feed.apply_book(&"low-yes".to_string(), Some(0.40), Some(0.45), Some(0.01));
        let directory: Arc<dyn MarketDirectory> = Arc::new(FakeDirectory(vec![listing("low", 1.0, 100.0)]));
        let rest: Arc<dyn ClobRest> = Arc::new(DryRunClobRest::new());
        let selector = MarketSelector::new(settings, directory, rest, feed);
        let selected = selector.select(0.0).await;
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn per_event_cap_limits_markets_from_same_condition() {
        let mut settings = Settings::for_test();
        settings.max_markets_per_event = 1;
        settings.min_volume_24h_usd = 0.0;
        settings.min_depth_top2_usd = 0.0;
        settings.min_expected_profit_usdc = 0.0;
        let feed = FeedState::new();
        feed.apply_book(&"ev1-yes".to_string(), Some(0.40), Some(0.45), Some(0.01));
        feed.apply_book(&"ev1-no".to_string(), Some(0.50), Some(0.57), Some(0.01));
        feed.apply_book(&"ev2-yes".to_string(), Some(0.40), Some(0.45), Some(0.01));
        feed.apply_book(&"ev2-no".to_string(), Some(0.50), Some(0.57), Some(0.01));
        let mut a = listing("ev1", 50_000.0, 100.0);
        a.condition_id = "same-event".to_string();
        let mut b = listing("ev2", 40_000.0, 100.0);
        b.condition_id = "same-event".to_string();
        let directory: Arc<dyn MarketDirectory> = Arc::new(FakeDirectory(vec![a, b]));
        let rest: Arc<dyn ClobRest> = Arc::new(DryRunClobRest::new());
        let selector = MarketSelector::new(settings, directory, rest, feed);
        let selected = selector.select(0.0).await;
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn choose_side_picks_larger_spread() {
        let settings = Settings::for_test();
        let feed = FeedState::new();
        feed.apply_book(&"wide-yes".to_string(), Some(0.40), Some(0.50), Some(0.01));
        feed.apply_book(&"wide-no".to_string(), Some(0.40), Some(0.44), Some(0.01));
        let directory: Arc<dyn MarketDirectory> = Arc::new(FakeDirectory(vec![listing("wide", 50_000.0, 100.0)]));
        let rest: Arc<dyn ClobRest> = Arc::new(DryRunClobRest::new());
        let selector = MarketSelector::new(settings, directory, rest, feed);
        let selected = selector.select(0.0).await;
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].asset, "wide-yes");
    }

    #[tokio::test]
    async fn rest_depth_normalization_decodes_mis_scaled_size_and_caps_total() {
        use crate::venue::BookSnapshot;

        struct FixedBookRest(BookSnapshot);
        #[async_trait]
        impl ClobRest for FixedBookRest {
            async fn post_limit_order(
                &self,
                _asset: &crate::types::AssetId,
                _side: crate::types::Side,
                _price: f64,
                _size: f64,
            ) -> Result<crate::venue::VenueOrder, CoreError> {
                unimplemented!()
            }
            async fn cancel_order(&self, _order_id: &str) -> Result<(), CoreError> {
                unimplemented!()
            }
            async fn cancel_all(&self) -> Result<(), CoreError> {
                unimplemented!()
            }
            async fn get_open_orders(
                &self,
                _asset: &crate::types::AssetId,
            ) -> Result<Vec<crate::venue::VenueOrder>, CoreError> {
                unimplemented!()
            }
            async fn get_order_book(&self, _asset: &crate::types::AssetId) -> Result<BookSnapshot, CoreError> {
                Ok(self.0.clone())
            }
        }

        let mut settings = Settings::for_test();
        settings.min_volume_24h_usd = 0.0;
        settings.min_depth_top2_usd = 0.0;
        settings.min_expected_profit_usdc = 0.0;
        let feed = FeedState::new(); // no WS data: forces the REST fallback
        let snapshot = BookSnapshot {
            bids: vec![BookLevel { price: 0.40, size: 200_000.0 }], // mis-scaled, decodes to 0.2 shares
            asks: vec![BookLevel { price: 0.45, size: 5.0 }],
        };
        let directory: Arc<dyn MarketDirectory> =
            Arc::new(FakeDirectory(vec![listing("rest", 50_000.0, 100.0)]));
        let rest: Arc<dyn ClobRest> = Arc::new(FixedBookRest(snapshot));
        let selector = MarketSelector::new(settings, directory, rest, feed);
        let selected = selector.select(0.0).await;
        assert_eq!(selected.len(), 1);
        // bid depth = 0.40 * (200_000/1e6) = 0.08, ask depth = 0.45 * 5 = 2.25
        assert!((selected[0].depth - 2.33).abs() < 1e-6);
    }
}
