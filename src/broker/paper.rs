use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::broker::{BalanceMode, Broker, BrokerOrderRequest, OptionQuote, Quote};
use crate::error::BotError;
use crate::models::{BrokerOrderStatus, OptionType, OrderSide};

struct PaperOrder {
    request: BrokerOrderRequest,
    status: BrokerOrderStatus,
    cost: f64,
}

struct PaperState {
    cash: f64,
    used_buying_power: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
    next_id: u64,
}

/// Same contract as the live broker, settled against live quotes from an
/// inner market-data source. Buying power is tracked locally: debited at
/// buy, credited back at close.
pub struct PaperBroker {
    quotes: Arc<dyn Broker>,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(starting_cash: f64, quotes: Arc<dyn Broker>) -> Self {
        Self {
            quotes,
            state: Mutex::new(PaperState {
                cash: starting_cash,
                used_buying_power: HashMap::new(),
                orders: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    async fn contract_quote(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<OptionQuote> {
        let chain = self.quotes.get_option_chain(symbol, expiration).await?;
        chain
            .into_iter()
            .find(|q| q.option_type == option_type && (q.strike - strike).abs() < 1e-9)
            .ok_or_else(|| {
                BotError::DataMissing(format!("no contract {} {} {}", symbol, strike, option_type))
                    .into()
            })
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_account_balance(&self, _real_money: bool, mode: BalanceMode) -> Result<f64> {
        let state = self.state.lock().unwrap();
        let used: f64 = state.used_buying_power.values().sum();
        Ok(match mode {
            BalanceMode::CashTotal => state.cash,
            BalanceMode::OptionBp | BalanceMode::CashAvailable => state.cash - used,
        })
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>> {
        self.quotes.get_option_chain(symbol, expiration).await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        self.quotes.get_quote(symbol).await
    }

    async fn get_option_bid(
        &self,
        symbol: &str,
        strike: f64,
        expiration: NaiveDate,
        option_type: OptionType,
    ) -> Result<f64> {
        self.quotes
            .get_option_bid(symbol, strike, expiration, option_type)
            .await
    }

    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<String> {
        let quote = self
            .contract_quote(
                &request.symbol,
                request.strike,
                request.expiration,
                request.option_type,
            )
            .await?;

        let mut state = self.state.lock().unwrap();
        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        match request.side {
            OrderSide::BuyToOpen => {
                let fill = request.limit.unwrap_or(quote.ask);
                let cost = fill * 100.0 * request.quantity as f64;
                let used: f64 = state.used_buying_power.values().sum();
                if cost > state.cash - used {
                    return Err(BotError::Rejected(format!(
                        "insufficient buying power: need {:.2}, have {:.2}",
                        cost,
                        state.cash - used
                    ))
                    .into());
                }
                state.used_buying_power.insert(id.clone(), cost);
                state.orders.insert(
                    id.clone(),
                    PaperOrder {
                        request: request.clone(),
                        status: BrokerOrderStatus::Filled,
                        cost,
                    },
                );
                info!(
                    "paper fill: buy {} x{} @ {:.2} ({})",
                    request.symbol, request.quantity, fill, id
                );
            }
            OrderSide::SellToClose => {
                let fill = request.limit.unwrap_or(quote.bid);
                let proceeds = fill * 100.0 * request.quantity as f64;
                state.cash += proceeds;
                // release the proportional slice of whatever buy is open
                // for this contract
                let open_buy = state
                    .orders
                    .iter()
                    .find(|(_, o)| {
                        o.request.side == OrderSide::BuyToOpen
                            && o.request.symbol == request.symbol
                            && (o.request.strike - request.strike).abs() < 1e-9
                            && o.request.option_type == request.option_type
                    })
                    .map(|(id, o)| (id.clone(), o.cost, o.request.quantity));
                if let Some((buy_id, cost, buy_qty)) = open_buy {
                    let release = cost * request.quantity as f64 / buy_qty as f64;
                    if let Some(used) = state.used_buying_power.get_mut(&buy_id) {
                        *used = (*used - release).max(0.0);
                        if *used <= 1e-9 {
                            state.used_buying_power.remove(&buy_id);
                        }
                    }
                }
                state.orders.insert(
                    id.clone(),
                    PaperOrder {
                        request: request.clone(),
                        status: BrokerOrderStatus::Filled,
                        cost: -proceeds,
                    },
                );
                debug!(
                    "paper fill: sell {} x{} @ {:.2} ({})",
                    request.symbol, request.quantity, fill, id
                );
            }
        }
        Ok(id)
    }

    async fn get_order_status(&self, order_ref: &str) -> Result<BrokerOrderStatus> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .get(order_ref)
            .map(|o| o.status)
            .ok_or_else(|| BotError::DataMissing(format!("unknown order {}", order_ref)).into())
    }
}
