//! Production `ClobRest`/`MarketDirectory`/`UserAuth` wired onto the real
//! Polymarket CLOB client. Signing, EIP-712 order construction, and HTTP
//! transport all stay inside `polymarket_hft`; this module only translates
//! between its types and the domain types the rest of the crate works in.

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use polymarket_hft::client::polymarket::clob::{
    ApiKeyCreds, Chain, OrderType, PriceLevel as PmPriceLevel, Side as PmSide, TradingClient,
    UserLimitOrder,
};
use alloy_signer_local::PrivateKeySigner;

use crate::config::VenueConfig;
use crate::error::CoreError;
use crate::types::{AssetId, Side};

use super::{BookLevel, BookSnapshot, ClobRest, ListedMarket, MarketDirectory, UserAuth, VenueOrder};

fn to_pm_side(side: Side) -> PmSide {
    match side {
        Side::Buy => PmSide::Buy,
        Side::Sell => PmSide::Sell,
    }
}

fn api_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::Api {
        reason: e.to_string(),
    }
}

pub struct PolymarketRest {
    trading: TradingClient,
}

impl PolymarketRest {
    pub fn new(cfg: &VenueConfig) -> Result<Self, CoreError> {
        let wallet: PrivateKeySigner = cfg
            .private_key
            .parse()
            .map_err(|e| CoreError::Config(format!("invalid PRIVATE_KEY: {e}")))?;
        let creds = ApiKeyCreds {
            key: cfg.clob_api_key.clone(),
            secret: cfg.clob_api_secret.clone(),
            passphrase: cfg.clob_passphrase.clone(),
        };
        let trading = TradingClient::new(wallet, creds, Chain::Polygon);
        Ok(Self { trading })
    }
}

#[async_trait]
impl ClobRest for PolymarketRest {
    async fn post_limit_order(
        &self,
        asset: &AssetId,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<VenueOrder, CoreError> {
        let tick_size = self
            .trading
            .client()
            .get_tick_size(asset)
            .await
            .map_err(api_err)?;
        let neg_risk = self
            .trading
            .client()
            .get_neg_risk(asset)
            .await
            .map_err(api_err)?;

        let order = UserLimitOrder {
            token_id: asset.clone(),
            price,
            size,
            side: to_pm_side(side),
            fee_rate_bps: None,
            nonce: None,
            expiration: None,
            taker: None,
        };

        let resp = self
            .trading
            .create_and_post_limit_order(&order, tick_size, neg_risk, OrderType::Gtc)
            .await
            .map_err(api_err)?;

        let order_id = resp
            .get("orderID")
            .or_else(|| resp.get("orderId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Api {
                reason: "venue response missing order id".into(),
            })?
            .to_string();

        Ok(VenueOrder {
            order_id,
            asset: asset.clone(),
            side,
            price,
            size,
            size_matched: 0.0,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), CoreError> {
        self.trading.cancel_order(order_id).await.map_err(api_err)?;
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), CoreError> {
        self.trading.cancel_all().await.map_err(api_err)?;
        Ok(())
    }

    async fn get_open_orders(&self, asset: &AssetId) -> Result<Vec<VenueOrder>, CoreError> {
        let orders = self
            .trading
            .get_open_orders(None)
            .await
            .map_err(api_err)?;
        Ok(orders
            .into_iter()
            .filter(|o| &o.asset_id == asset)
            .map(|o| VenueOrder {
                order_id: o.id,
                asset: o.asset_id,
                side: if o.side.eq_ignore_ascii_case("SELL") {
                    Side::Sell
                } else {
                    Side::Buy
                },
                price: o.price.parse().unwrap_or(0.0),
                size: o.original_size.parse().unwrap_or(0.0),
                size_matched: o.size_matched.parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_order_book(&self, asset: &AssetId) -> Result<BookSnapshot, CoreError> {
        let book = self
            .trading
            .client()
            .get_order_book(asset)
            .await
            .map_err(api_err)?;
        let parse_levels = |levels: Vec<PmPriceLevel>| {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(BookLevel {
                        price: l.price.parse().ok()?,
                        size: l.size.parse().ok()?,
                    })
                })
                .collect()
        };
        Ok(BookSnapshot {
            bids: parse_levels(book.bids),
            asks: parse_levels(book.asks),
        })
    }
}

pub struct PolymarketMarketDirectory {
    trading: TradingClient,
}

impl PolymarketMarketDirectory {
    pub fn new(cfg: &VenueConfig) -> Result<Self, CoreError> {
        Ok(Self {
            trading: PolymarketRest::new(cfg)?.trading,
        })
    }
}

#[async_trait]
impl MarketDirectory for PolymarketMarketDirectory {
    async fn list_active_markets(&self) -> Result<Vec<ListedMarket>, CoreError> {
        let page = self
            .trading
            .client()
            .get_markets(Default::default())
            .await
            .map_err(api_err)?;

        Ok(page
            .data
            .into_iter()
            .filter(|m| m.active.unwrap_or(false) && !m.closed.unwrap_or(false))
            .filter_map(|m| {
                let yes = m.tokens.first()?;
                let no = m.tokens.get(1)?;
                let volume_24h = m
                    .extra
                    .get("volume24hr")
                    .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
                    .unwrap_or(0.0);
                let end_date_ts = m
                    .extra
                    .get("endDateIso")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp() as f64)
                    .unwrap_or(0.0);
                Some(ListedMarket {
                    condition_id: m.condition_id.clone(),
                    yes_asset: yes.token_id.clone(),
                    no_asset: no.token_id.clone(),
                    volume_24h,
                    end_date_ts,
                    event_id: m.condition_id,
                })
            })
            .collect())
    }
}

/// HMAC-SHA256 signer for the user-channel websocket auth payload (spec
/// section 6): `timestamp || "GET" || "/ws/user"`, base64-url-safe encoded,
/// no padding.
pub struct PolymarketUserAuth {
    secret: Vec<u8>,
    api_key: String,
    passphrase: String,
}

impl PolymarketUserAuth {
    pub fn new(cfg: &VenueConfig) -> Result<Self, CoreError> {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&cfg.clob_api_secret)
            .map_err(|e| CoreError::Config(format!("invalid CLOB_API_SECRET: {e}")))?;
        Ok(Self {
            secret,
            api_key: cfg.clob_api_key.clone(),
            passphrase: cfg.clob_passphrase.clone(),
        })
    }
}

impl UserAuth for PolymarketUserAuth {
    fn sign_ws_auth(&self, timestamp: &str) -> Result<String, CoreError> {
        let message = format!("{timestamp}GET/ws/user");
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| CoreError::Config(format!("bad HMAC key: {e}")))?;
        mac.update(message.as_bytes());
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn passphrase(&self) -> &str {
        &self.passphrase
    }
}
