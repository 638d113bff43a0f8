use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, ProviderConfig};
use crate::error::BotError;
use crate::feed::Provider;
use crate::models::TradeEvent;

#[derive(Debug, Clone)]
struct FeedSettings {
    symbol: String,
    primary: ProviderConfig,
    secondary: ProviderConfig,
    retry_attempts: u32,
    backoff_factor: f64,
    retry_interval: Duration,
}

#[derive(Debug, Serialize)]
struct SessionClaims {
    sub: String,
    iss: String,
    session: String,
    nbf: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_token: String,
}

#[derive(Debug, Deserialize)]
struct RawFeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Maintains exactly one live trade feed for the configured symbol,
/// alternating between the two providers on any connection-level failure.
/// Messages within one connection arrive in server order; failover does
/// not replay missed ticks.
pub struct FeedClient {
    settings: FeedSettings,
    provider: Provider,
    http: reqwest::Client,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

/// Stop control for a FeedClient that has moved into its task.
#[derive(Clone)]
pub struct FeedHandle {
    stop_tx: watch::Sender<bool>,
}

impl FeedHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl FeedClient {
    pub fn new(cfg: &Config) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            settings: FeedSettings {
                symbol: cfg.symbol.clone(),
                primary: cfg.primary_provider.clone(),
                secondary: cfg.secondary_provider.clone(),
                retry_attempts: cfg.retry_attempts,
                backoff_factor: cfg.backoff_factor,
                retry_interval: Duration::from_secs(cfg.retry_interval_secs),
            },
            provider: Provider::Primary,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            stop_tx,
            stop_rx,
        }
    }

    pub fn active_provider(&self) -> Provider {
        self.provider
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Cooperative shutdown: the read loop finishes its in-flight message
    /// and exits. A later `start` is allowed.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run until `stop()` or until a persistent auth failure exhausts the
    /// retry budget. Normalized trade events go to `out`.
    pub async fn start(&mut self, out: mpsc::Sender<TradeEvent>) -> Result<()> {
        let _ = self.stop_tx.send(false);
        loop {
            if *self.stop_rx.borrow() {
                info!("feed stopped");
                return Ok(());
            }

            let provider = self.provider;
            match self.connect_and_stream(provider, &out).await {
                Ok(()) => {
                    if *self.stop_rx.borrow() {
                        info!("feed stopped");
                        return Ok(());
                    }
                    warn!("{} connection ended; failing over", provider);
                }
                Err(e) => {
                    if let Some(bot_err) = e.downcast_ref::<BotError>() {
                        if bot_err.is_fatal() {
                            error!("{} feed fatal: {}", provider, bot_err);
                            return Err(e);
                        }
                    }
                    warn!("{} feed error: {}; failing over", provider, e);
                }
            }

            self.provider = self.provider.switch();
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    async fn connect_and_stream(
        &mut self,
        provider: Provider,
        out: &mpsc::Sender<TradeEvent>,
    ) -> Result<()> {
        let (url, auth_payload) = match provider {
            Provider::Primary => {
                let token = self.acquire_session_token().await?;
                let jwt = self.sign_session_jwt(&token)?;
                (
                    self.settings.primary.ws_url.clone(),
                    serde_json::json!({ "action": "auth", "token": jwt }),
                )
            }
            Provider::Secondary => (
                self.settings.secondary.ws_url.clone(),
                serde_json::json!({ "action": "auth", "key": self.settings.secondary.api_key }),
            ),
        };

        let url = Url::parse(&url).context("feed url")?;
        info!("connecting to {} feed at {}", provider, url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BotError::TransientNetwork(e.to_string()))?;
        let (mut sink, mut source) = ws_stream.split();

        sink.send(Message::Text(auth_payload.to_string()))
            .await
            .map_err(|e| BotError::TransientNetwork(e.to_string()))?;
        let subscribe = serde_json::json!({
            "action": "subscribe",
            "channel": "trades",
            "symbols": [self.settings.symbol],
        });
        sink.send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| BotError::TransientNetwork(e.to_string()))?;
        info!("{} feed subscribed to {}", provider, self.settings.symbol);

        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                msg = source.next() => {
                    let msg = match msg {
                        Some(m) => m,
                        None => return Ok(()),
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            match parse_trade_message(&text) {
                                Ok(Some(event)) => {
                                    if out.send(event).await.is_err() {
                                        // consumer gone: treat as shutdown
                                        return Ok(());
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!("skipping malformed message: {}", e),
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(_)) => {
                            warn!("{} feed closed by server", provider);
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(BotError::TransientNetwork(e.to_string()).into());
                        }
                    }
                }
            }
        }
    }

    /// Pre-connect HTTP handshake for the primary provider, with
    /// exponential backoff up to the retry budget.
    async fn acquire_session_token(&self) -> Result<String> {
        let mut last_err = String::new();
        for attempt in 0..self.settings.retry_attempts {
            if attempt > 0 {
                let delay = self.settings.backoff_factor * 2f64.powi(attempt as i32);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            let resp = self
                .http
                .post(&self.settings.primary.token_url)
                .json(&serde_json::json!({ "api_key": self.settings.primary.api_key }))
                .send()
                .await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let body: SessionResponse =
                        resp.json().await.context("parsing session response")?;
                    return Ok(body.session_token);
                }
                Ok(resp) => {
                    last_err = format!("handshake status {}", resp.status());
                    warn!("primary token attempt {}: {}", attempt + 1, last_err);
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!("primary token attempt {}: {}", attempt + 1, last_err);
                }
            }
        }
        Err(BotError::Auth(format!("primary handshake exhausted retries: {}", last_err)).into())
    }

    fn sign_session_jwt(&self, session_token: &str) -> Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = SessionClaims {
            sub: self.settings.primary.api_key.clone(),
            iss: "flag-trading-bot".to_string(),
            session: session_token.to_string(),
            nbf: now,
            exp: now + 300,
        };
        let key = EncodingKey::from_ec_pem(self.settings.primary.api_secret.as_bytes())
            .context("parsing primary API secret as EC key")?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.settings.primary.api_key.clone());
        encode(&header, &claims, &key).context("encoding session JWT")
    }
}

/// Normalize one provider message; non-trade messages are None, bad JSON
/// or missing fields are errors the caller logs and skips.
pub fn parse_trade_message(text: &str) -> Result<Option<TradeEvent>> {
    let raw: RawFeedMessage = serde_json::from_str(text)
        .map_err(|e| BotError::MalformedMessage(e.to_string()))?;
    if raw.kind != "trade" {
        return Ok(None);
    }
    let price = raw
        .price
        .ok_or_else(|| BotError::MalformedMessage("trade without price".to_string()))?;
    let millis = raw
        .timestamp
        .ok_or_else(|| BotError::MalformedMessage("trade without timestamp".to_string()))?;
    let ts: DateTime<Utc> = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| BotError::MalformedMessage(format!("bad timestamp {}", millis)))?;
    Ok(Some(TradeEvent { price, ts }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_prints() {
        let event = parse_trade_message(
            r#"{"type":"trade","price":450.12,"timestamp":1741962600000}"#,
        )
        .unwrap()
        .expect("trade event");
        assert!((event.price - 450.12).abs() < 1e-9);
        assert_eq!(event.ts.timestamp(), 1_741_962_600);
    }

    #[test]
    fn non_trade_messages_are_discarded() {
        let out = parse_trade_message(r#"{"type":"status","message":"connected"}"#).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn malformed_messages_error_without_panic() {
        assert!(parse_trade_message("{not json").is_err());
        assert!(parse_trade_message(r#"{"type":"trade","timestamp":1}"#).is_err());
        assert!(parse_trade_message(r#"{"type":"trade","price":1.0}"#).is_err());
    }
}
