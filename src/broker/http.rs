use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{BalanceMode, Broker, BrokerOrderRequest, OptionQuote, Quote};
use crate::config::BrokerConfig;
use crate::error::BotError;
use crate::models::{BrokerOrderStatus, OptionType};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const RATE_LIMIT_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    balances: BalancesBody,
}

#[derive(Debug, Deserialize)]
struct BalancesBody {
    total_cash: f64,
    option_buying_power: f64,
    cash_available: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    quotes: Vec<QuoteRow>,
}

#[derive(Debug, Deserialize)]
struct QuoteRow {
    bid: f64,
    ask: f64,
    last: f64,
}

#[derive(Debug, Deserialize)]
struct ChainResponse {
    options: Vec<ChainRow>,
}

#[derive(Debug, Deserialize)]
struct ChainRow {
    strike: f64,
    ask: f64,
    bid: f64,
    option_type: OptionType,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: OrderBody,
}

#[derive(Debug, Deserialize)]
struct OrderBody {
    id: String,
    #[serde(default)]
    status: Option<BrokerOrderStatus>,
}

/// Token-authenticated brokerage client. Transient failures retry with a
/// fixed delay up to `retry_count`; HTTP 429 sleeps a minute; a broker
/// rejection is final.
pub struct HttpBroker {
    client: Client,
    base_url: String,
    api_token: String,
    account_id: String,
    retry_count: u32,
}

impl HttpBroker {
    pub fn new(cfg: &BrokerConfig, real_money: bool, retry_count: u32) -> Self {
        let base_url = if real_money {
            cfg.live_url.clone()
        } else {
            cfg.sandbox_url.clone()
        };
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url,
            api_token: cfg.api_token.clone(),
            account_id: cfg.account_id.clone(),
            retry_count,
        }
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let resp = self
                .client
                .get(&url)
                .query(query)
                .bearer_auth(&self.api_token)
                .header("Accept", "application/json")
                .send()
                .await;

            match resp {
                Ok(resp) => match self.check_status(resp).await {
                    Ok(resp) => {
                        return resp.json::<T>().await.context("parsing broker response")
                    }
                    Err(e) => {
                        if e.downcast_ref::<BotError>().map_or(false, BotError::is_fatal) {
                            return Err(e);
                        }
                        warn!("broker GET {} attempt {} failed: {}", path, attempt + 1, e);
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!("broker GET {} attempt {} failed: {}", path, attempt + 1, e);
                    last_err = Some(BotError::TransientNetwork(e.to_string()).into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("broker GET {} failed", path)))
    }

    async fn check_status(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("broker rate limit; sleeping {:?}", RATE_LIMIT_SLEEP);
                tokio::time::sleep(RATE_LIMIT_SLEEP).await;
                Err(BotError::TransientNetwork("rate limited".to_string()).into())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = resp.text().await.unwrap_or_default();
                Err(BotError::Auth(body).into())
            }
            s if s.is_server_error() => {
                let body = resp.text().await.unwrap_or_default();
                Err(BotError::TransientNetwork(format!("{}: {}", s, body)).into())
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(BotError::Rejected(format!("{}: {}", s, body)).into())
            }
        }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn get_account_balance(&self, _real_money: bool, mode: BalanceMode) -> Result<f64> {
        let path = format!("/accounts/{}/balances", self.account_id);
        let resp: BalancesResponse = self.get_with_retry(&path, &[]).await?;
        Ok(match mode {
            BalanceMode::CashTotal => resp.balances.total_cash,
            BalanceMode::OptionBp => resp.balances.option_buying_power,
            BalanceMode::CashAvailable => resp.balances.cash_available,
        })
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>> {
        let resp: ChainResponse = self
            .get_with_retry(
                "/markets/options/chains",
                &[
                    ("symbol", symbol.to_string()),
                    ("expiration", expiration.format("%Y-%m-%d").to_string()),
                ],
            )
            .await?;
        Ok(resp
            .options
            .into_iter()
            .map(|r| OptionQuote {
                strike: r.strike,
                ask: r.ask,
                bid: r.bid,
                option_type: r.option_type,
            })
            .collect())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let resp: QuoteResponse = self
            .get_with_retry("/markets/quotes", &[("symbols", symbol.to_string())])
            .await?;
        let row = resp
            .quotes
            .first()
            .ok_or_else(|| BotError::DataMissing(format!("no quote for {}", symbol)))?;
        Ok(Quote {
            bid: row.bid,
            ask: row.ask,
            last: row.last,
        })
    }

    async fn get_option_bid(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<f64> {
        let resp: QuoteResponse = self
            .get_with_retry(
                "/markets/options/quotes",
                &[
                    ("symbol", symbol.to_string()),
                    ("strike", format!("{:.2}", strike)),
                    ("expiration", expiration.format("%Y-%m-%d").to_string()),
                    ("option_type", option_type.to_string()),
                ],
            )
            .await?;
        let row = resp.quotes.first().ok_or_else(|| {
            BotError::DataMissing(format!("no option quote for {} {}", symbol, strike))
        })?;
        Ok(row.bid)
    }

    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<String> {
        let url = format!("{}/accounts/{}/orders", self.base_url, self.account_id);
        let order_type = if request.limit.is_some() { "limit" } else { "market" };
        let mut form: Vec<(&str, String)> = vec![
            ("class", "option".to_string()),
            ("symbol", request.symbol.clone()),
            ("strike", format!("{:.2}", request.strike)),
            ("option_type", request.option_type.to_string()),
            ("expiration", request.expiration.format("%Y-%m-%d").to_string()),
            ("side", request.side.to_string()),
            ("quantity", request.quantity.to_string()),
            ("type", order_type.to_string()),
            ("duration", "day".to_string()),
        ];
        if let Some(limit) = request.limit {
            form.push(("price", format!("{:.2}", limit)));
        }

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let resp = self
                .client
                .post(&url)
                .form(&form)
                .bearer_auth(&self.api_token)
                .header("Accept", "application/json")
                .send()
                .await;

            match resp {
                Ok(resp) => match self.check_status(resp).await {
                    Ok(resp) => {
                        let body: OrderResponse =
                            resp.json().await.context("parsing order response")?;
                        debug!("order submitted: {}", body.order.id);
                        return Ok(body.order.id);
                    }
                    Err(e) => {
                        let fatal = e
                            .downcast_ref::<BotError>()
                            .map_or(false, |b| matches!(b, BotError::Rejected(_)) || b.is_fatal());
                        if fatal {
                            return Err(e);
                        }
                        warn!("order submit attempt {} failed: {}", attempt + 1, e);
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!("order submit attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(BotError::TransientNetwork(e.to_string()).into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("order submit failed")))
    }

    async fn get_order_status(&self, order_ref: &str) -> Result<BrokerOrderStatus> {
        let path = format!("/accounts/{}/orders/{}", self.account_id, order_ref);
        let resp: OrderResponse = self.get_with_retry(&path, &[]).await?;
        resp.order
            .status
            .ok_or_else(|| BotError::MalformedMessage("order status missing".to_string()).into())
    }
}
