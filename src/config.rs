use std::env;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(key: &str, default: f64) -> Result<f64, CoreError> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<f64>()
            .map_err(|e| CoreError::Config(format!("{key} invalid float: {e}"))),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize, CoreError> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<usize>()
            .map_err(|e| CoreError::Config(format!("{key} invalid int: {e}"))),
    }
}

fn require_env(key: &str) -> Result<String, CoreError> {
    get_env(key).ok_or_else(|| CoreError::Config(format!("{key} is required")))
}

/// Venue endpoints, on-chain addresses, and credentials (spec section 6).
/// Kept separate from the tunable risk/strategy knobs below so `Settings`
/// reads like the teacher's flat struct but credential handling is obvious
/// at a glance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub rpc_url: String,
    pub wss_url: String,
    pub wss_user_url: String,
    pub exchange_address: String,
    pub usdc_address: String,
    pub poly_proxy_address: String,
    pub private_key: String,
    pub clob_api_key: String,
    pub clob_api_secret: String,
    pub clob_passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub venue: VenueConfig,
    pub dry_run: bool,

    // Market selection (spec 4.6 / 6)
    pub max_markets: usize,
    pub min_spread_cents: f64,
    pub max_spread_cents: f64,
    pub min_volume_24h_usd: f64,
    pub min_depth_top2_usd: f64,
    pub hours_to_close_min: f64,
    pub max_markets_per_event: usize,

    // Order sizing floors (spec 4.5 / 6)
    pub min_notional_per_order_usdc: f64,
    pub min_expected_profit_usdc: f64,
    pub min_size_shares: f64,

    // Risk caps (spec 4.5 / 6)
    pub max_shares_per_market: f64,
    pub max_usdc_per_market: f64,
    pub max_notional_at_risk_usdc: f64,

    // Order dynamics (spec 4.4 / 6)
    pub order_ttl_ms: u64,
    pub replace_price_ticks: f64,
    pub ask_chase_window_sec: f64,
    pub ask_chase_max_replaces: u32,

    // Periodic task cadences (spec 4.7 / 6)
    pub reconcile_interval_ms: u64,
    pub metrics_log_interval_ms: u64,

    pub order_size_shares: f64,
}

impl Settings {
    pub fn load() -> Result<Self, CoreError> {
        let venue = VenueConfig {
            rpc_url: require_env("RPC_URL")?,
            wss_url: require_env("WSS_URL")?,
            wss_user_url: require_env("WSS_USER_URL")?,
            exchange_address: require_env("EXCHANGE_ADDRESS")?,
            usdc_address: require_env("USDC_ADDRESS")?,
            poly_proxy_address: require_env("POLY_PROXY_ADDRESS")?,
            private_key: require_env("PRIVATE_KEY")?,
            clob_api_key: require_env("CLOB_API_KEY")?,
            clob_api_secret: require_env("CLOB_API_SECRET")?,
            clob_passphrase: require_env("CLOB_PASSPHRASE")?,
        };

        let s = Self {
            venue,
            dry_run: get_env_bool("DRY_RUN", true),
            max_markets: get_env_usize("MAX_MARKETS", 10)?,
            min_spread_cents: get_env_f64("MIN_SPREAD_CENTS", 2.0)?,
            max_spread_cents: get_env_f64("MAX_SPREAD_CENTS", 15.0)?,
            min_volume_24h_usd: get_env_f64("MIN_VOLUME_24H_USD", 10_000.0)?,
            min_depth_top2_usd: get_env_f64("MIN_DEPTH_TOP2_USD", 200.0)?,
            hours_to_close_min: get_env_f64("HOURS_TO_CLOSE_MIN", 4.0)?,
            max_markets_per_event: get_env_usize("MAX_MARKETS_PER_EVENT", 2)?,
            min_notional_per_order_usdc: get_env_f64("MIN_NOTIONAL_PER_ORDER_USDC", 1.0)?,
            min_expected_profit_usdc: get_env_f64("MIN_EXPECTED_PROFIT_USDC", 0.01)?,
            min_size_shares: get_env_f64("MIN_SIZE_SHARES", 5.0)?,
            max_shares_per_market: get_env_f64("MAX_SHARES_PER_MARKET", 200.0)?,
            max_usdc_per_market: get_env_f64("MAX_USDC_PER_MARKET", 100.0)?,
            max_notional_at_risk_usdc: get_env_f64("MAX_NOTIONAL_AT_RISK_USDC", 1_000.0)?,
            order_ttl_ms: get_env_usize("ORDER_TTL_MS", 20_000)? as u64,
            replace_price_ticks: get_env_f64("REPLACE_PRICE_TICKS", 1.0)?,
            ask_chase_window_sec: get_env_f64("ASK_CHASE_WINDOW_SEC", 15.0)?,
            ask_chase_max_replaces: get_env_usize("ASK_CHASE_MAX_REPLACES", 5)? as u32,
            reconcile_interval_ms: get_env_usize("RECONCILE_INTERVAL_MS", 60_000)? as u64,
            metrics_log_interval_ms: get_env_usize("METRICS_LOG_INTERVAL_MS", 60_000)? as u64,
            order_size_shares: get_env_f64("ORDER_SIZE_SHARES", 5.0)?,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_spread_cents <= 0.0 || self.max_spread_cents <= self.min_spread_cents {
            return Err(CoreError::Config(format!(
                "MAX_SPREAD_CENTS must be > MIN_SPREAD_CENTS (got {} / {})",
                self.max_spread_cents, self.min_spread_cents
            )));
        }
        if self.max_markets == 0 {
            return Err(CoreError::Config("MAX_MARKETS must be >= 1".into()));
        }
        if self.max_markets_per_event == 0 {
            return Err(CoreError::Config("MAX_MARKETS_PER_EVENT must be >= 1".into()));
        }
        if self.max_notional_at_risk_usdc <= 0.0 {
            return Err(CoreError::Config("MAX_NOTIONAL_AT_RISK_USDC must be > 0".into()));
        }
        if self.max_usdc_per_market <= 0.0 || self.max_shares_per_market <= 0.0 {
            return Err(CoreError::Config(
                "MAX_USDC_PER_MARKET / MAX_SHARES_PER_MARKET must be > 0".into(),
            ));
        }
        if self.order_ttl_ms == 0 {
            return Err(CoreError::Config("ORDER_TTL_MS must be >= 1".into()));
        }
        if self.ask_chase_max_replaces == 0 {
            return Err(CoreError::Config("ASK_CHASE_MAX_REPLACES must be >= 1".into()));
        }
        if self.order_size_shares <= 0.0 {
            return Err(CoreError::Config("ORDER_SIZE_SHARES must be > 0".into()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            venue: VenueConfig {
                rpc_url: "http://localhost".into(),
                wss_url: "ws://localhost/ws/market".into(),
                wss_user_url: "ws://localhost/ws/user".into(),
                exchange_address: "0x0".into(),
                usdc_address: "0x0".into(),
                poly_proxy_address: "0x0".into(),
                private_key: "0x0".into(),
                clob_api_key: "key".into(),
                clob_api_secret: "secret".into(),
                clob_passphrase: "pass".into(),
            },
            dry_run: true,
            max_markets: 10,
            min_spread_cents: 2.0,
            max_spread_cents: 15.0,
            min_volume_24h_usd: 10_000.0,
            min_depth_top2_usd: 200.0,
            hours_to_close_min: 4.0,
            max_markets_per_event: 2,
            min_notional_per_order_usdc: 1.0,
            min_expected_profit_usdc: 0.01,
            min_size_shares: 5.0,
            max_shares_per_market: 200.0,
            max_usdc_per_market: 100.0,
            max_notional_at_risk_usdc: 1_000.0,
            order_ttl_ms: 20_000,
            replace_price_ticks: 1.0,
            ask_chase_window_sec: 15.0,
            ask_chase_max_replaces: 5,
            reconcile_interval_ms: 60_000,
            metrics_log_interval_ms: 60_000,
            order_size_shares: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_inverted_spread_band() {
        let mut s = Settings::for_test();
        s.max_spread_cents = 1.0;
        s.min_spread_cents = 2.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Settings::for_test().validate().is_ok());
    }
}
