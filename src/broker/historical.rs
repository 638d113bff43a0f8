use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::error::BotError;
use crate::models::{Candle, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketFilter {
    All,
    Premarket,
    Market,
    Aftermarket,
}

impl fmt::Display for MarketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketFilter::All => write!(f, "ALL"),
            MarketFilter::Premarket => write!(f, "PREMARKET"),
            MarketFilter::Market => write!(f, "MARKET"),
            MarketFilter::Aftermarket => write!(f, "AFTERMARKET"),
        }
    }
}

/// Historical candles for the EMA bootstrap and the end-of-day 15-minute
/// history patch.
#[async_trait]
pub trait HistoricalData: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_date: NaiveDate,
        end_date: NaiveDate,
        market_filter: MarketFilter,
    ) -> Result<Vec<Candle>>;
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    rows: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    ts: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

pub struct HttpHistoricalClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpHistoricalClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl HistoricalData for HttpHistoricalClient {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_date: NaiveDate,
        end_date: NaiveDate,
        market_filter: MarketFilter,
    ) -> Result<Vec<Candle>> {
        let (interval, timescale) = timeframe.historical_interval();
        let resp = self
            .client
            .get(format!("{}/candles/{}", self.base_url, symbol))
            .query(&[
                ("interval", interval.to_string()),
                ("timescale", timescale.to_string()),
                ("start_date", start_date.format("%Y-%m-%d").to_string()),
                ("end_date", end_date.format("%Y-%m-%d").to_string()),
                ("market_filter", market_filter.to_string()),
            ])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BotError::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(BotError::Auth(body).into());
            }
            return Err(BotError::TransientNetwork(format!("{}: {}", status, body)).into());
        }

        let data: CandlesResponse = resp.json().await.context("parsing historical candles")?;
        let mut candles: Vec<Candle> = data
            .rows
            .into_iter()
            .filter_map(|row| {
                let open_ts: DateTime<Utc> = DateTime::from_timestamp(row.ts, 0)?;
                Some(Candle {
                    timeframe,
                    open_ts,
                    open: row.o,
                    high: row.h,
                    low: row.l,
                    close: row.c,
                    volume: row.v,
                    seq: 0,
                })
            })
            .collect();
        candles.sort_by_key(|c| c.open_ts);
        for (i, c) in candles.iter_mut().enumerate() {
            c.seq = i as u64;
        }
        Ok(candles)
    }
}
