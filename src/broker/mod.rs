pub mod historical;
pub mod http;
pub mod paper;

pub use historical::{HistoricalData, HttpHistoricalClient, MarketFilter};
pub use http::HttpBroker;
pub use paper::PaperBroker;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{BrokerOrderStatus, OptionType, OrderSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    CashTotal,
    OptionBp,
    CashAvailable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptionQuote {
    pub strike: f64,
    pub ask: f64,
    pub bid: f64,
    pub option_type: OptionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    pub strike: f64,
    pub option_type: OptionType,
    /// None submits at market.
    pub limit: Option<f64>,
    pub expiration: NaiveDate,
    pub quantity: u32,
    pub side: OrderSide,
}

/// Behavioral contract against the brokerage. Real-money and sandbox
/// variants differ only in URL and credentials.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account_balance(&self, real_money: bool, mode: BalanceMode) -> Result<f64>;

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote>;

    /// Current bid for one contract. Retries transient errors internally;
    /// a successful return is always a real price.
    async fn get_option_bid(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<f64>;

    /// Returns the broker's order reference.
    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<String>;

    async fn get_order_status(&self, order_ref: &str) -> Result<BrokerOrderStatus>;
}
