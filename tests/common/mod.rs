use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::US::Eastern;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use flag_trading_bot::broker::{
    BalanceMode, Broker, BrokerOrderRequest, OptionQuote, Quote,
};
use flag_trading_bot::models::{BrokerOrderStatus, Candle, CandleSeries, OptionType, Timeframe};

/// Scripted broker: canned chain and underlying, queued option bids,
/// instant fills.
pub struct MockBroker {
    pub chain: Vec<OptionQuote>,
    pub underlying: Mutex<Quote>,
    bids: Mutex<VecDeque<f64>>,
    last_bid: Mutex<f64>,
    submits: Mutex<Vec<BrokerOrderRequest>>,
    next_ref: AtomicU32,
}

impl MockBroker {
    pub fn new(chain: Vec<OptionQuote>, spot: f64) -> Self {
        Self {
            chain,
            underlying: Mutex::new(Quote {
                bid: spot - 0.1,
                ask: spot + 0.1,
                last: spot,
            }),
            bids: Mutex::new(VecDeque::new()),
            last_bid: Mutex::new(0.43),
            submits: Mutex::new(Vec::new()),
            next_ref: AtomicU32::new(1),
        }
    }

    pub fn push_bids(&self, bids: &[f64]) {
        self.bids.lock().unwrap().extend(bids.iter().copied());
    }

    pub fn submitted(&self) -> Vec<BrokerOrderRequest> {
        self.submits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_account_balance(&self, _: bool, _: BalanceMode) -> Result<f64> {
        Ok(100_000.0)
    }

    async fn get_option_chain(
        &self,
        _symbol: &str,
        _expiration: NaiveDate,
    ) -> Result<Vec<OptionQuote>> {
        Ok(self.chain.clone())
    }

    async fn get_quote(&self, _symbol: &str) -> Result<Quote> {
        Ok(*self.underlying.lock().unwrap())
    }

    async fn get_option_bid(
        &self,
        _symbol: &str,
        _strike: f64,
        _expiration: NaiveDate,
        _option_type: OptionType,
    ) -> Result<f64> {
        let mut bids = self.bids.lock().unwrap();
        if let Some(bid) = bids.pop_front() {
            *self.last_bid.lock().unwrap() = bid;
        }
        Ok(*self.last_bid.lock().unwrap())
    }

    async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<String> {
        self.submits.lock().unwrap().push(request.clone());
        Ok(format!("ref-{}", self.next_ref.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_order_status(&self, _order_ref: &str) -> Result<BrokerOrderStatus> {
        Ok(BrokerOrderStatus::Filled)
    }
}

pub fn call_chain() -> Vec<OptionQuote> {
    vec![
        OptionQuote {
            strike: 452.0,
            ask: 0.43,
            bid: 0.41,
            option_type: OptionType::Call,
        },
        OptionQuote {
            strike: 453.0,
            ask: 0.25,
            bid: 0.23,
            option_type: OptionType::Call,
        },
        OptionQuote {
            strike: 450.0,
            ask: 0.44,
            bid: 0.42,
            option_type: OptionType::Put,
        },
    ]
}

/// 2M candles with explicit starting seq, 09:30 ET 2025-03-14 base.
pub fn candles_2m(start_seq: u64, rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
    let base: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 3, 14, 13, 30, 0).unwrap();
    rows.iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| {
            let seq = start_seq + i as u64;
            Candle {
                timeframe: Timeframe::M2,
                open_ts: base + chrono::Duration::minutes(2 * seq as i64),
                open: o,
                high: h,
                low: l,
                close: c,
                volume: 100.0,
                seq,
            }
        })
        .collect()
}

/// 15M candles for one Eastern-time trading day from 09:30 ET.
pub fn day_candles_15m(date: NaiveDate, rows: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let open = Eastern
        .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(9, 30, 0).unwrap()))
        .single()
        .expect("unambiguous eastern time")
        .with_timezone(&Utc);
    CandleSeries::new(
        rows.iter()
            .enumerate()
            .map(|(i, &(o, h, l, c))| Candle {
                timeframe: Timeframe::M15,
                open_ts: open + chrono::Duration::minutes(15 * i as i64),
                open: o,
                high: h,
                low: l,
                close: c,
                volume: 1000.0,
                seq: i as u64,
            })
            .collect(),
    )
}

pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "flag_bot_it_{}_{}_{:?}",
        tag,
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
