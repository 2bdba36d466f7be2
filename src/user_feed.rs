//! Authenticated user-channel websocket feed (spec section 6 / SPEC_FULL
//! "UserFeed"). Same transport policy as `market_feed` (debounce, capped
//! backoff, heartbeat/liveness) but carries fills and order-status updates
//! instead of book state, and requires a signed auth payload up front.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::types::{AssetId, Side};
use crate::utils::now_ts;
use crate::venue::UserAuth;

const SUBSCRIBE_DEBOUNCE: Duration = Duration::from_millis(75);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

fn reconnect_delay(attempt: u32) -> Duration {
    let secs = BASE_RECONNECT_DELAY.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    Duration::from_secs_f64(secs.min(MAX_RECONNECT_DELAY.as_secs_f64()))
}

/// What the orchestrator learns from the user channel.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Fill {
        order_id: String,
        asset: AssetId,
        side: Side,
        price: f64,
        size: f64,
    },
    OrderStatus {
        order_id: String,
        asset: AssetId,
        live: bool,
    },
}

#[derive(Debug, Serialize)]
struct AuthPayload<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
    secret: &'a str,
    passphrase: &'a str,
}

#[derive(Debug, Serialize)]
struct UserSubscribeRequest<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    markets: &'a [String],
    auth: AuthPayload<'a>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    asset_id: String,
    side: String,
    size: String,
    price: String,
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    asset_id: String,
    order_id: String,
    #[serde(rename = "type")]
    kind: String,
}

fn parse_side(s: &str) -> Side {
    if s.eq_ignore_ascii_case("SELL") {
        Side::Sell
    } else {
        Side::Buy
    }
}

pub struct UserFeed {
    ws_url: String,
    auth: std::sync::Arc<dyn UserAuth>,
    markets_tx: watch::Sender<Vec<String>>,
    markets_rx: watch::Receiver<Vec<String>>,
    events_tx: mpsc::Sender<UserEvent>,
}

impl UserFeed {
    pub fn new(
        ws_url: String,
        auth: std::sync::Arc<dyn UserAuth>,
    ) -> (Self, mpsc::Receiver<UserEvent>) {
        let (markets_tx, markets_rx) = watch::channel(Vec::new());
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Self {
                ws_url,
                auth,
                markets_tx,
                markets_rx,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn set_desired_markets(&self, condition_ids: Vec<String>) {
        let _ = self.markets_tx.send(condition_ids);
    }

    /// A cloned sender the orchestrator can keep after `spawn` consumes
    /// `self`, so it can keep pushing desired-market updates to the running
    /// feed task.
    pub fn markets_sender(&self) -> watch::Sender<Vec<String>> {
        self.markets_tx.clone()
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            run(self.ws_url, self.auth, self.markets_rx, self.events_tx).await;
        });
    }
}

async fn run(
    ws_url: String,
    auth: std::sync::Arc<dyn UserAuth>,
    mut markets_rx: watch::Receiver<Vec<String>>,
    events_tx: mpsc::Sender<UserEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            let delay = reconnect_delay(attempt.min(MAX_RECONNECT_ATTEMPTS));
            log::warn!("user_feed.reconnect.wait attempt={attempt} delay_ms={}", delay.as_millis());
            sleep(delay).await;
        }

        match connect_and_run(&ws_url, auth.as_ref(), &mut markets_rx, &events_tx).await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                log::error!("user_feed.connection.error attempt={attempt} err={e}");
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    log::error!("user_feed.reconnect.exhausted resetting backoff after cooldown");
                    sleep(MAX_RECONNECT_DELAY).await;
                    attempt = 0;
                }
            }
        }
    }
}

async fn connect_and_run(
    ws_url: &str,
    auth: &dyn UserAuth,
    markets_rx: &mut watch::Receiver<Vec<String>>,
    events_tx: &mpsc::Sender<UserEvent>,
) -> Result<(), String> {
    let (ws_stream, _) = timeout(Duration::from_secs(30), tokio_tungstenite::connect_async(ws_url))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| e.to_string())?;
    log::info!("user_feed.connected url={ws_url}");

    let (mut write, mut read) = ws_stream.split();
    let mut subscribed: Vec<String> = Vec::new();
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    let initial = markets_rx.borrow().clone();
    subscribe_if_changed(&mut write, auth, &mut subscribed, initial).await?;

    loop {
        tokio::select! {
            biased;

            changed = markets_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                sleep(SUBSCRIBE_DEBOUNCE).await;
                let latest = markets_rx.borrow_and_update().clone();
                subscribe_if_changed(&mut write, auth, &mut subscribed, latest).await?;
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
                        handle_message(&text, events_tx).await;
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
    auth: &dyn UserAuth,
    subscribed: &mut Vec<String>,
    mut markets: Vec<String>,
) -> Result<(), String> {
    markets.sort();
    markets.dedup();
    if &markets == subscribed {
        return Ok(());
    }
    let timestamp = (now_ts() as u64).to_string();
    let signature = auth.sign_ws_auth(&timestamp).map_err(|e| e.to_string())?;
    let req = UserSubscribeRequest {
        msg_type: "user",
        markets: &markets,
        auth: AuthPayload {
            api_key: auth.api_key(),
            secret: &signature,
            passphrase: auth.passphrase(),
        },
    };
    let payload = serde_json::to_string(&req).map_err(|e| e.to_string())?;
    write
        .send(Message::Text(payload.into()))
        .await
        .map_err(|e| e.to_string())?;
    log::info!("user_feed.subscribe count={}", markets.len());
    *subscribed = markets;
    Ok(())
}

async fn handle_message(text: &str, events_tx: &mpsc::Sender<UserEvent>) {
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
            "trade" => {
                if let Ok(t) = serde_json::from_value::<WireTrade>(item) {
                    if t.status.eq_ignore_ascii_case("MATCHED") || t.status.eq_ignore_ascii_case("CONFIRMED") {
                        let price = t.price.parse().unwrap_or(0.0);
                        let size = t.size.parse().unwrap_or(0.0);
                        let _ = events_tx
                            .send(UserEvent::Fill {
                                order_id: t.id,
                                asset: t.asset_id,
                                side: parse_side(&t.side),
                                price,
                                size,
                            })
                            .await;
                    }
                }
            }
            "order" => {
                if let Ok(o) = serde_json::from_value::<WireOrder>(item) {
                    let live = !o.kind.eq_ignore_ascii_case("CANCELLATION");
                    let _ = events_tx
                        .send(UserEvent::OrderStatus {
                            order_id: o.order_id,
                            asset: o.asset_id,
                            live,
                        })
                        .await;
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
    fn reconnect_delay_matches_market_feed_policy() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(4), Duration::from_secs(8));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn parse_side_defaults_to_buy() {
        assert!(matches!(parse_side("BUY"), Side::Buy));
        assert!(matches!(parse_side("sell"), Side::Sell));
        assert!(matches!(parse_side("garbage"), Side::Buy));
    }
}
