use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{HistoricalData, MarketFilter};
use crate::core::calendar::MarketCalendar;
use crate::core::candle_store::CandleStore;
use crate::models::Timeframe;
use crate::notify::Notifier;
use crate::storage;
use crate::trading::order_manager::OrderManager;
use crate::trading::session_state::SharedSessionState;

/// Drives the market-close sequence: force-flat, balance roll, summary,
/// artifact sealing, session resets. Every step is idempotent; a second
/// run on the same date is a no-op.
pub struct EodReconciler {
    calendar: MarketCalendar,
    symbol: String,
}

impl EodReconciler {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            calendar: MarketCalendar::new(),
            symbol: symbol.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        order_manager: &Arc<OrderManager>,
        session: &SharedSessionState,
        candle_store: &mut CandleStore,
        historical: &dyn HistoricalData,
        notifier: &dyn Notifier,
    ) -> Result<bool> {
        let date = self.calendar.et_date(now);
        if session.lock().unwrap().reconciled_date == Some(date) {
            return Ok(false);
        }
        info!("end-of-day reconciliation for {}", date);

        // 1. flat any position; authoritative over in-flight ladder checks
        order_manager.force_flat(now).await?;

        // 2. patch the long-lived 15-minute history from the authoritative
        // provider (fills boundaries the live feed missed)
        match historical
            .get_candles(&self.symbol, Timeframe::M15, date, date, MarketFilter::All)
            .await
        {
            Ok(candles) => {
                if let Err(e) = candle_store.append_history(&candles) {
                    warn!("history patch failed: {}", e);
                }
            }
            Err(e) => warn!("historical fetch failed, history not patched: {}", e),
        }

        // 3. performance summary before the roll clears the P&L list
        let summary = {
            let session = session.lock().unwrap();
            let pnl = &session.realized_pnl;
            let total: f64 = pnl.iter().sum();
            let wins = pnl.iter().filter(|p| **p > 0.0).count();
            format!(
                "Session {} | trades: {} ({} wins) | P&L ${:+.2} | start ${:.2} -> end ${:.2}",
                date,
                pnl.len(),
                wins,
                total,
                session.start_of_day_balance,
                session.start_of_day_balance + total
            )
        };
        if let Err(e) = notifier.send(&summary).await {
            warn!("summary notify failed: {}", e);
        }
        info!("{}", summary);

        // 4. snapshot the session state and the message-id map as audit
        // artifacts
        let snapshot_path = candle_store
            .data_dir()
            .join(format!("session_{}.json", date));
        {
            let session = session.lock().unwrap().clone();
            if let Err(e) = storage::safe_write_json(&snapshot_path, &session) {
                warn!("session snapshot failed: {}", e);
            }
            let ids_path = candle_store.data_dir().join("message_ids.json");
            if let Err(e) = storage::safe_write_json(&ids_path, &session.message_ids) {
                warn!("message-id map write failed: {}", e);
            }
        }

        // 5. roll balances and clear per-session maps; the order-log CSV
        // is retained
        session.lock().unwrap().roll(date);

        // 6. clear session candle logs (history store is kept)
        candle_store.reset_session()?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BalanceMode, Broker, BrokerOrderRequest, OptionQuote, Quote};
    use crate::models::{BrokerOrderStatus, Candle, OptionType};
    use crate::notify::LogNotifier;
    use crate::trading::order_log::OrderLog;
    use crate::trading::order_manager::{EmaView, OrderManagerSettings};
    use crate::trading::session_state::SessionState;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::RwLock;

    struct NoopBroker;

    #[async_trait]
    impl Broker for NoopBroker {
        async fn get_account_balance(&self, _: bool, _: BalanceMode) -> Result<f64> {
            Ok(0.0)
        }
        async fn get_option_chain(&self, _: &str, _: NaiveDate) -> Result<Vec<OptionQuote>> {
            Ok(Vec::new())
        }
        async fn get_quote(&self, _: &str) -> Result<Quote> {
            Ok(Quote { bid: 0.0, ask: 0.0, last: 0.0 })
        }
        async fn get_option_bid(
            &self,
            _: &str,
            _: f64,
            _: NaiveDate,
            _: OptionType,
        ) -> Result<f64> {
            Ok(0.0)
        }
        async fn submit_order(&self, _: &BrokerOrderRequest) -> Result<String> {
            Ok("noop".to_string())
        }
        async fn get_order_status(&self, _: &str) -> Result<BrokerOrderStatus> {
            Ok(BrokerOrderStatus::Filled)
        }
    }

    struct CannedHistory(Vec<Candle>);

    #[async_trait]
    impl HistoricalData for CannedHistory {
        async fn get_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _start: NaiveDate,
            _end: NaiveDate,
            _filter: MarketFilter,
        ) -> Result<Vec<Candle>> {
            Ok(self.0.clone())
        }
    }

    fn manager(session: SharedSessionState) -> Arc<OrderManager> {
        let dir = std::env::temp_dir().join(format!(
            "flag_bot_eod_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(OrderManager::new(
            OrderManagerSettings {
                symbol: "SPY".to_string(),
                real_money: false,
                num_out_of_money: 3,
                quantity_cap: 30,
                account_order_percentage: 0.005,
                per_contract_fee: 0.65,
                order_cost_buffer: 5.0,
                price_bands: Vec::new(),
                stop_loss: crate::config::StopLossRule::Percent(-50.0),
                take_profit_percentages: vec![20.0],
                expiration_dte: Some(0),
            },
            Arc::new(NoopBroker),
            Arc::new(LogNotifier::new()),
            session,
            Arc::new(RwLock::new(EmaView::default())),
            OrderLog::open(dir.join("orders.csv")),
        ))
    }

    #[tokio::test]
    async fn balance_roll_seals_and_clears_the_session() {
        let session = SessionState::new(100_000.0, 0.0).shared();
        {
            let mut s = session.lock().unwrap();
            s.record_pnl(673.0);
            s.record_pnl(1211.0);
            s.record_pnl(-450.0);
        }
        let om = manager(session.clone());
        let dir = std::env::temp_dir().join(format!(
            "flag_bot_eod_store_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let mut store = CandleStore::new(dir);
        let history = CannedHistory(crate::test_helpers::make_candles(&[
            (450.0, 450.5, 449.5, 450.2),
        ]).into_iter().collect());

        let now = Utc.with_ymd_and_hms(2025, 3, 14, 20, 0, 5).unwrap();
        let reconciler = EodReconciler::new("SPY");
        let ran = reconciler
            .run(now, &om, &session, &mut store, &history, &LogNotifier::new())
            .await
            .unwrap();
        assert!(ran);

        {
            let s = session.lock().unwrap();
            assert!((s.start_of_day_balance - 101_434.0).abs() < 1e-9);
            assert!((s.end_of_day_balance - 0.0).abs() < 1e-9);
            assert!(s.realized_pnl.is_empty());
        }
        // authoritative candles merged into the history store
        assert_eq!(store.load_history().len(), 1);

        // second run on the same date is a no-op
        let ran_again = reconciler
            .run(now, &om, &session, &mut store, &history, &LogNotifier::new())
            .await
            .unwrap();
        assert!(!ran_again);
        let s = session.lock().unwrap();
        assert!((s.start_of_day_balance - 101_434.0).abs() < 1e-9);
    }
}
