use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use flag_trading_bot::broker::{
    Broker, HistoricalData, HttpBroker, HttpHistoricalClient, MarketFilter, PaperBroker,
};
use flag_trading_bot::config::SharedConfig;
use flag_trading_bot::core::aggregator::CandleAggregator;
use flag_trading_bot::core::calendar::MarketCalendar;
use flag_trading_bot::core::candle_store::CandleStore;
use flag_trading_bot::core::classifier::{classify, ZoneClassifier};
use flag_trading_bot::core::ema::EmaEngine;
use flag_trading_bot::core::events::{EventCalendar, FileEventCalendar};
use flag_trading_bot::core::flags::FlagEngine;
use flag_trading_bot::core::zones::{ZoneEngine, ZoneSettings};
use flag_trading_bot::feed::{FeedClient, FeedHandle};
use flag_trading_bot::models::{Candle, Timeframe, TradeEvent};
use flag_trading_bot::notify::{LogNotifier, Notifier, WebhookNotifier};
use flag_trading_bot::storage;
use flag_trading_bot::strategies::signals::Decision;
use flag_trading_bot::strategies::RuleGate;
use flag_trading_bot::trading::order_manager::{EmaView, SharedEmaView};
use flag_trading_bot::trading::{
    EodReconciler, OrderLog, OrderManager, OrderManagerSettings, SessionState, SharedSessionState,
    SubmitOutcome,
};

const FEED_LEAD_MINUTES: i64 = 2;
const EMA_WARMUP_MINUTES: i64 = 15;

/// The supervisor: wires the components, owns the session loop, starts
/// the feed ahead of the open and drives the end-of-day reconciliation.
pub struct TradingBot {
    config: SharedConfig,
    calendar: MarketCalendar,
    session: SharedSessionState,
    aggregator: CandleAggregator,
    candle_store: CandleStore,
    emas: HashMap<Timeframe, EmaEngine>,
    zone_engine: ZoneEngine,
    classifier: ZoneClassifier,
    flag_engine: FlagEngine,
    rule_gate: RuleGate,
    order_manager: Arc<OrderManager>,
    reconciler: EodReconciler,
    historical: Arc<dyn HistoricalData>,
    events: Arc<dyn EventCalendar>,
    notifier: Arc<dyn Notifier>,
    ema_view: SharedEmaView,
    decision_tf: Timeframe,
    feed_handle: Option<FeedHandle>,
    zones_built_for: Option<NaiveDate>,
}

impl TradingBot {
    pub async fn new(config: SharedConfig) -> Self {
        let cfg = config.read().await.clone();

        info!("{}", "=".repeat(60));
        info!("Flag breakout bot starting up");
        info!(
            "Mode: {}",
            if cfg.real_money_activated {
                "REAL MONEY"
            } else {
                "PAPER TRADING"
            }
        );
        info!("Symbol: {} | timeframes: {:?}", cfg.symbol, cfg.timeframes);
        info!(
            "Stops: {:?} | targets: {:?}",
            cfg.stop_loss, cfg.take_profit_percentages
        );
        info!("{}", "=".repeat(60));

        let notifier: Arc<dyn Notifier> = if cfg.webhook_url.is_empty() {
            Arc::new(LogNotifier::new())
        } else {
            Arc::new(WebhookNotifier::new(cfg.webhook_url.clone()))
        };

        let live = Arc::new(HttpBroker::new(
            &cfg.broker,
            cfg.real_money_activated,
            cfg.retry_count,
        ));
        let broker: Arc<dyn Broker> = if cfg.real_money_activated {
            live
        } else {
            Arc::new(PaperBroker::new(cfg.account_balances.0, live))
        };

        let session = SessionState::new(cfg.account_balances.0, cfg.account_balances.1).shared();
        let ema_view: SharedEmaView = Arc::new(std::sync::RwLock::new(EmaView::default()));
        let order_manager = Arc::new(OrderManager::new(
            OrderManagerSettings::from_config(&cfg),
            broker,
            notifier.clone(),
            session.clone(),
            ema_view.clone(),
            OrderLog::open(format!("{}/orders.csv", cfg.data_dir)),
        ));

        let mut emas = HashMap::new();
        for tf in &cfg.timeframes {
            emas.insert(*tf, EmaEngine::new(*tf, cfg.ema_periods()));
        }

        let decision_tf = cfg.timeframes.first().copied().unwrap_or(Timeframe::M2);
        let buffer_cap = cfg.flagpole.max_num_candles * 3;

        Self {
            calendar: MarketCalendar::new(),
            session,
            aggregator: CandleAggregator::new(cfg.timeframes.clone(), cfg.candle_buffer_secs),
            candle_store: CandleStore::new(cfg.data_dir.clone()),
            emas,
            zone_engine: ZoneEngine::new(ZoneSettings::from_config(&cfg)),
            classifier: ZoneClassifier::new(buffer_cap),
            flag_engine: FlagEngine::new(cfg.flagpole.clone()),
            rule_gate: RuleGate::new(),
            order_manager,
            reconciler: EodReconciler::new(cfg.symbol.clone()),
            historical: Arc::new(HttpHistoricalClient::new(
                cfg.historical_base_url.clone(),
                cfg.historical_api_key.clone(),
            )),
            events: Arc::new(FileEventCalendar::load(
                std::path::Path::new(&cfg.events_file),
                3,
            )),
            notifier,
            ema_view,
            decision_tf,
            feed_handle: None,
            zones_built_for: None,
            config,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Bot is now running. Press Ctrl+C to stop.");
        let (tx, mut rx) = mpsc::channel::<TradeEvent>(1024);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown().await;
                    return Ok(());
                }
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.on_trade(event).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    self.on_clock(Utc::now(), &tx).await;
                }
            }
        }
    }

    /// Wall-clock transitions: morning boot, feed start ahead of the
    /// open, end-of-day reconciliation after the close.
    async fn on_clock(&mut self, now: DateTime<Utc>, tx: &mpsc::Sender<TradeEvent>) {
        let date = self.calendar.et_date(now);
        let session = match self.calendar.session_for(date) {
            Some(s) => s,
            None => return,
        };

        if self.zones_built_for != Some(date) && now >= session.premarket_start {
            if let Err(e) = self.prepare_session(date).await {
                warn!("session preparation failed: {}", e);
            }
            self.zones_built_for = Some(date);
        }

        let feed_start = session.open - chrono::Duration::minutes(FEED_LEAD_MINUTES);
        if self.feed_handle.is_none() && now >= feed_start && now < session.close {
            let cfg = self.config.read().await.clone();
            let mut feed = FeedClient::new(&cfg);
            self.feed_handle = Some(feed.handle());
            let out = tx.clone();
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = feed.start(out).await {
                    error!("feed terminated: {}", e);
                    let _ = notifier
                        .send(&format!("CRITICAL: market data feed down: {}", e))
                        .await;
                }
            });
            info!("market data feed started ({} before open)", FEED_LEAD_MINUTES);
        }

        let reconciled = self.session.lock().unwrap().reconciled_date == Some(date);
        if now >= session.close && !reconciled {
            if let Some(handle) = self.feed_handle.take() {
                handle.stop();
            }
            if let Err(e) = self.run_eod(now).await {
                error!("end-of-day reconciliation failed: {}", e);
            }
        }
    }

    /// Rebuild the zone set for the day from the rolling 15-minute window.
    async fn prepare_session(&mut self, date: NaiveDate) -> Result<()> {
        let cfg = self.config.read().await.clone();
        let window_start = {
            let mut d = date;
            for _ in 0..cfg.past_days {
                d = self.calendar.prev_trading_day(d);
            }
            d
        };
        let yesterday = self.calendar.prev_trading_day(date);

        match self
            .historical
            .get_candles(
                &cfg.symbol,
                Timeframe::M15,
                window_start,
                yesterday,
                MarketFilter::Market,
            )
            .await
        {
            Ok(candles) => {
                self.candle_store.append_history(&candles)?;
            }
            Err(e) => warn!("historical window fetch failed: {}", e),
        }

        let history = self.candle_store.load_history();
        if history.is_empty() {
            warn!("no 15M history; zones unavailable until end of day");
            return Ok(());
        }
        self.zone_engine.rebuild(&history);
        info!(
            "session {} ready: {} zones, {} TPLs",
            date,
            self.zone_engine.zones().len(),
            self.zone_engine.tpls().len()
        );

        // in-session audit artifacts; in-memory state stays authoritative
        let zones_map: HashMap<String, (u64, f64, f64)> = self
            .zone_engine
            .zones()
            .iter()
            .map(|z| (z.id.clone(), (z.anchor_seq, z.important, z.buffer)))
            .collect();
        let tpl_map: HashMap<String, (u64, f64)> = self
            .zone_engine
            .tpls()
            .iter()
            .map(|t| (t.id.clone(), (t.anchor_seq, t.price)))
            .collect();
        let data_dir = std::path::PathBuf::from(&cfg.data_dir);
        if let Err(e) = storage::safe_write_json(&data_dir.join("zones.json"), &zones_map) {
            warn!("zone artifact write failed: {}", e);
        }
        if let Err(e) = storage::safe_write_json(&data_dir.join("tpls.json"), &tpl_map) {
            warn!("TPL artifact write failed: {}", e);
        }
        Ok(())
    }

    async fn on_trade(&mut self, event: TradeEvent) {
        let closed = self.aggregator.on_trade(event);
        for candle in closed {
            if let Err(e) = self.handle_candle(candle, event.ts).await {
                error!("candle handling failed: {}", e);
            }
        }
    }

    /// Per closed candle: store, EMA update, and on the decision
    /// timeframe the classifier -> flag engine -> rule gate chain. Runs
    /// synchronously so a flag decision sees the EMA state of its own
    /// candle.
    async fn handle_candle(&mut self, candle: Candle, now: DateTime<Utc>) -> Result<()> {
        let cfg = self.config.read().await.clone();
        self.candle_store.append(candle.clone())?;

        let date = self.calendar.et_date(candle.open_ts);
        let warmup_done = self
            .calendar
            .session_for(date)
            .map(|s| now >= s.open + chrono::Duration::minutes(EMA_WARMUP_MINUTES))
            .unwrap_or(false);

        let tf = candle.timeframe;
        let needs_bootstrap = {
            let engine = self.emas.get_mut(&tf).expect("engine per timeframe");
            if engine.has_calculated() {
                engine.on_candle(&candle);
                false
            } else {
                engine.buffer_candle(&candle);
                warmup_done
            }
        };
        if needs_bootstrap {
            let warmup = self.bootstrap_candles(&cfg.symbol, tf, date).await;
            let engine = self.emas.get_mut(&tf).expect("engine per timeframe");
            engine.bootstrap(&warmup);
        }

        if tf != self.decision_tf {
            return Ok(());
        }

        // snapshot for the order manager's stop rules
        {
            let engine = &self.emas[&tf];
            let mut view = self.ema_view.write().unwrap();
            view.last_candle = Some(candle.clone());
            for period in cfg.ema_periods() {
                if let Some(v) = engine.latest(period) {
                    view.values.insert(period, v);
                }
            }
        }

        // classifier -> flag engine
        let update = self.classifier.on_candle(&candle, self.zone_engine.zones());
        for context in &update.disarmed {
            self.flag_engine.disarm(context);
        }
        for (context, flag_type) in &update.armed {
            self.flag_engine.arm(context, *flag_type, &candle);
        }
        let completed = self.flag_engine.on_candle(&candle);
        if completed.is_empty() {
            return Ok(());
        }
        info!(
            "completed flags at {}: {:?}",
            update.classification,
            completed.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
        );

        // rule gate -> order manager
        let classification = classify(candle.close, self.zone_engine.zones());
        let ema_200 = self.emas[&tf].latest(200);
        let decision = self
            .rule_gate
            .evaluate(
                &completed,
                &candle,
                &classification,
                self.zone_engine.zones(),
                ema_200,
                self.events.as_ref(),
                now,
                &cfg,
            )
            .await;

        match decision {
            Decision::Fire(request) => {
                match self.order_manager.submit_buy(&request, now).await {
                    Ok(SubmitOutcome::Submitted { order_id }) => {
                        self.rule_gate.record_order(&request.zone_classification);
                        info!("order {} submitted; manage loop spawned", order_id);
                        tokio::spawn(self.order_manager.clone().run_manage_loop());
                    }
                    Ok(outcome) => debug!("submit declined: {:?}", outcome),
                    Err(e) => error!("submit failed: {}", e),
                }
            }
            Decision::Refuse(reason) => {
                debug!("rule gate refusal: {}", reason);
                if let Err(e) = self
                    .notifier
                    .send(&format!("order refused: {}", reason))
                    .await
                {
                    debug!("notifier send failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Previous day's aftermarket plus today's premarket candles for the
    /// one-shot EMA bootstrap.
    async fn bootstrap_candles(&self, symbol: &str, tf: Timeframe, date: NaiveDate) -> Vec<Candle> {
        let prev = self.calendar.prev_trading_day(date);
        let mut out = Vec::new();
        match self
            .historical
            .get_candles(symbol, tf, prev, prev, MarketFilter::Aftermarket)
            .await
        {
            Ok(candles) => out.extend(candles),
            Err(e) => warn!("{} aftermarket fetch failed: {}", tf, e),
        }
        match self
            .historical
            .get_candles(symbol, tf, date, date, MarketFilter::Premarket)
            .await
        {
            Ok(candles) => out.extend(candles),
            Err(e) => warn!("{} premarket fetch failed: {}", tf, e),
        }
        out
    }

    async fn run_eod(&mut self, now: DateTime<Utc>) -> Result<()> {
        let day_candles = self.candle_store.session_len(Timeframe::M15) as u64;
        let ran = self
            .reconciler
            .run(
                now,
                &self.order_manager,
                &self.session,
                &mut self.candle_store,
                self.historical.as_ref(),
                self.notifier.as_ref(),
            )
            .await?;
        if !ran {
            return Ok(());
        }

        // seal the day's EMA series before the reset wipes it
        let cfg = self.config.read().await.clone();
        let data_dir = std::path::PathBuf::from(&cfg.data_dir);
        for (tf, engine) in &self.emas {
            let path = data_dir.join(format!("ema_{}.json", tf));
            if let Err(e) = storage::safe_write_json(&path, &engine.artifact_rows()) {
                warn!("EMA artifact write failed for {}: {}", tf, e);
            }
        }

        // in-session engine state resets; zones stay resident but shift
        // with the cumulative candle index
        self.zone_engine.advance_anchors(day_candles);
        for engine in self.emas.values_mut() {
            engine.reset();
        }
        self.classifier.reset();
        self.flag_engine.reset();
        self.rule_gate.reset();
        self.ema_view.write().unwrap().last_candle = None;
        info!("session state reset for next trading day");
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Shutting down...");
        if let Some(handle) = self.feed_handle.take() {
            handle.stop();
        }
        if let Some(order) = self.order_manager.active_order() {
            warn!(
                "position still open at shutdown: {} {} x{}",
                order.symbol,
                order.option_type,
                order.remaining_quantity()
            );
        }
        let session = self.session.lock().unwrap().clone();
        info!(
            "Balance: ${:.2} | realized today: ${:+.2}",
            session.current_balance(),
            session.realized_pnl.iter().sum::<f64>()
        );
        info!("Bot stopped.");
    }
}
