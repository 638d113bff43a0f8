use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerOrderRequest, OptionQuote};
use crate::config::{Config, PriceBand, StopLossRule};
use crate::core::calendar::MarketCalendar;
use crate::error::BotError;
use crate::models::{
    ActiveOrder, BrokerOrderStatus, Candle, OptionType, OrderSide, OrderStatus, PartialExit,
};
use crate::notify::Notifier;
use crate::strategies::signals::OrderRequest;
use crate::trading::ladder::compute_exit_ladder;
use crate::trading::order_log::OrderLog;
use crate::trading::session_state::SharedSessionState;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_BUDGET: u32 = 40;
/// Manage loop cadence (~2 Hz).
pub const MANAGE_INTERVAL: Duration = Duration::from_millis(500);

/// Snapshot of the 2M EMA state, refreshed by the strategy task on every
/// closed candle and read by the manage loop for stop rules.
#[derive(Debug, Default, Clone)]
pub struct EmaView {
    pub last_candle: Option<Candle>,
    pub values: HashMap<u32, f64>,
}

pub type SharedEmaView = Arc<RwLock<EmaView>>;

#[derive(Debug, Clone)]
pub struct OrderManagerSettings {
    pub symbol: String,
    pub real_money: bool,
    pub num_out_of_money: usize,
    pub quantity_cap: u32,
    pub account_order_percentage: f64,
    pub per_contract_fee: f64,
    pub order_cost_buffer: f64,
    pub price_bands: Vec<PriceBand>,
    pub stop_loss: StopLossRule,
    pub take_profit_percentages: Vec<f64>,
    pub expiration_dte: Option<u32>,
}

impl OrderManagerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            symbol: cfg.symbol.clone(),
            real_money: cfg.real_money_activated,
            num_out_of_money: cfg.num_out_of_money,
            quantity_cap: cfg.quantity_cap,
            account_order_percentage: cfg.account_order_percentage,
            per_contract_fee: cfg.per_contract_fee,
            order_cost_buffer: cfg.order_cost_buffer,
            price_bands: cfg.price_bands.clone(),
            stop_loss: cfg.stop_loss.clone(),
            take_profit_percentages: cfg.take_profit_percentages.clone(),
            expiration_dte: cfg.expiration_dte(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { order_id: String },
    RefusedSameType,
    RefusedHalted,
    RefusedNoContract,
    RefusedNoBuyingPower,
    RejectedByBroker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No active order.
    Idle,
    /// Position still open after this tick.
    Holding,
    /// Position went flat this tick.
    Closed,
}

/// Owns the single active option position and drives it to flat. The
/// submit/close decision path runs under one async mutex so the
/// at-most-one-active invariant holds across directional switches.
pub struct OrderManager {
    settings: OrderManagerSettings,
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    session: SharedSessionState,
    calendar: MarketCalendar,
    decision: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveOrder>>,
    order_log: Mutex<OrderLog>,
    ema_view: SharedEmaView,
}

impl OrderManager {
    pub fn new(
        settings: OrderManagerSettings,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        session: SharedSessionState,
        ema_view: SharedEmaView,
        order_log: OrderLog,
    ) -> Self {
        Self {
            settings,
            broker,
            notifier,
            session,
            calendar: MarketCalendar::new(),
            decision: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            order_log: Mutex::new(order_log),
            ema_view,
        }
    }

    pub fn active_order(&self) -> Option<ActiveOrder> {
        self.active.lock().unwrap().clone()
    }

    pub fn has_active_order(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Full buy pipeline. An opposite-type active order is closed first
    /// under the decision lock; a same-type one refuses the request.
    pub async fn submit_buy(
        &self,
        request: &OrderRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let _guard = self.decision.lock().await;

        if self.session.lock().unwrap().orders_halted {
            warn!("orders halted; refusing buy");
            return Ok(SubmitOutcome::RefusedHalted);
        }

        let existing = self.active.lock().unwrap().clone();
        if let Some(active) = existing {
            if active.option_type == request.option_type {
                debug!("same-type re-entry refused while {} active", active.order_id);
                return Ok(SubmitOutcome::RefusedSameType);
            }
            info!(
                "directional switch: closing {} before {} entry",
                active.order_id, request.option_type
            );
            self.close_rest(now, "switch").await?;
        }

        // pre-flight: expiration and contract selection
        let today = self.calendar.trading_date(now);
        let expiration = self
            .calendar
            .expiration_for_dte(today, self.settings.expiration_dte.unwrap_or(0));

        let quote = self.broker.get_quote(&self.settings.symbol).await?;
        let chain = self
            .broker
            .get_option_chain(&self.settings.symbol, expiration)
            .await?;
        let contract = match self.select_contract(&chain, quote.last, request.option_type) {
            Some(c) => c,
            None => {
                warn!("no contract in any price band; refusing");
                self.notify(&format!(
                    "refused {} entry: no strike within price bands",
                    request.option_type
                ))
                .await;
                return Ok(SubmitOutcome::RefusedNoContract);
            }
        };

        // sizing against the session balance
        let (balance, available) = {
            let session = self.session.lock().unwrap();
            (session.current_balance(), session.available_buying_power())
        };
        let budget = balance * self.settings.account_order_percentage;
        let per_contract = contract.ask * 100.0;
        let mut quantity = (budget / per_contract).floor() as u32;
        if quantity == 0 {
            quantity = 1;
        }
        quantity = quantity.min(self.settings.quantity_cap);
        if quantity > 1 && quantity as f64 * per_contract > budget {
            quantity -= 1;
        }

        let cost_with_buffer = (per_contract
            + self.settings.per_contract_fee
            + self.settings.order_cost_buffer)
            * quantity as f64;
        if cost_with_buffer > available {
            info!(
                "refusing buy: cost {:.2} exceeds buying power {:.2}",
                cost_with_buffer, available
            );
            self.notify(&format!(
                "no_bp: {} {} x{} needs ${:.2}, available ${:.2}",
                self.settings.symbol, request.option_type, quantity, cost_with_buffer, available
            ))
            .await;
            return Ok(SubmitOutcome::RefusedNoBuyingPower);
        }

        // submit and poll to terminal
        let broker_request = BrokerOrderRequest {
            symbol: self.settings.symbol.clone(),
            strike: contract.strike,
            option_type: request.option_type,
            limit: Some(contract.ask),
            expiration,
            quantity,
            side: OrderSide::BuyToOpen,
        };
        let broker_ref = match self.broker.submit_order(&broker_request).await {
            Ok(r) => r,
            Err(e) => {
                warn!("buy submit failed: {}", e);
                self.notify(&format!("entry rejected: {}", e)).await;
                return Ok(SubmitOutcome::RejectedByBroker);
            }
        };
        let status = self.poll_terminal(&broker_ref).await?;
        if status != BrokerOrderStatus::Filled {
            warn!("buy order {} ended {}", broker_ref, status);
            return Ok(SubmitOutcome::RejectedByBroker);
        }

        let order_id = Uuid::new_v4().to_string();
        let exit_targets = compute_exit_ladder(
            contract.ask,
            quantity,
            &self.settings.take_profit_percentages,
        );
        let order = ActiveOrder {
            order_id: order_id.clone(),
            broker_ref: Some(broker_ref),
            symbol: self.settings.symbol.clone(),
            option_type: request.option_type,
            strike: contract.strike,
            expiration,
            entry_time: now,
            entry_price: contract.ask,
            quantity,
            partial_exits: Vec::new(),
            exit_targets,
            tp_price: request.tp_price,
            zone_classification: request.zone_classification.clone(),
            lowest_bid: f64::INFINITY,
            highest_bid: f64::NEG_INFINITY,
            adjustments: 0,
            status: OrderStatus::Open,
        };

        {
            let mut session = self.session.lock().unwrap();
            session.debit(&order_id, order.original_cost());
        }
        let handle = self
            .notifier
            .send(&format!(
                "BUY {} {} {:.0} {} x{} @ {:.2} ({})",
                order.symbol,
                order.expiration,
                order.strike,
                order.option_type,
                order.quantity,
                order.entry_price,
                request.flag_name
            ))
            .await
            .unwrap_or_default();
        self.session
            .lock()
            .unwrap()
            .message_ids
            .insert(order_id.clone(), handle);

        if let Err(e) = self.order_log.lock().unwrap().upsert(&order, None) {
            warn!("order log write failed: {}", e);
        }
        info!(
            "entered {} {} x{} @ {:.2}, {} ladder rungs",
            order.option_type,
            order.strike,
            order.quantity,
            order.entry_price,
            order.exit_targets.len()
        );
        *self.active.lock().unwrap() = Some(order);

        Ok(SubmitOutcome::Submitted { order_id })
    }

    /// Candidate strikes on the out-of-the-money side, then the first ask
    /// landing in a band, bands tried narrow to wide (band-outer,
    /// strike-inner).
    fn select_contract(
        &self,
        chain: &[OptionQuote],
        spot: f64,
        option_type: OptionType,
    ) -> Option<OptionQuote> {
        let mut candidates: Vec<OptionQuote> = chain
            .iter()
            .filter(|q| q.option_type == option_type)
            .filter(|q| match option_type {
                OptionType::Call => q.strike > spot,
                OptionType::Put => q.strike < spot,
            })
            .copied()
            .collect();
        match option_type {
            OptionType::Call => {
                candidates.sort_by(|a, b| a.strike.partial_cmp(&b.strike).unwrap())
            }
            OptionType::Put => candidates.sort_by(|a, b| b.strike.partial_cmp(&a.strike).unwrap()),
        }
        candidates.truncate(self.settings.num_out_of_money);

        for band in &self.settings.price_bands {
            for quote in &candidates {
                if quote.ask >= band.low && quote.ask <= band.high {
                    return Some(*quote);
                }
            }
        }
        None
    }

    async fn poll_terminal(&self, broker_ref: &str) -> Result<BrokerOrderStatus> {
        for _ in 0..POLL_BUDGET {
            let status = self.broker.get_order_status(broker_ref).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(BotError::TransientNetwork(format!("order {} never terminal", broker_ref)).into())
    }

    /// One pass of the ~2 Hz manage loop. Public so tests and the
    /// supervisor drive it with explicit time.
    pub async fn manage_tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let _guard = self.decision.lock().await;

        let order = match self.active.lock().unwrap().clone() {
            Some(o) => o,
            None => return Ok(TickOutcome::Idle),
        };

        let bid = self
            .broker
            .get_option_bid(
                &order.symbol,
                order.strike,
                order.expiration,
                order.option_type,
            )
            .await?;

        // track extremes for the drawdown/gain columns
        {
            let mut active = self.active.lock().unwrap();
            if let Some(o) = active.as_mut() {
                o.lowest_bid = o.lowest_bid.min(bid);
                o.highest_bid = o.highest_bid.max(bid);
            }
        }

        // forced flat one minute before close is authoritative
        if self.past_eod_cutoff(now) {
            info!("end of day: flattening {}", order.order_id);
            self.close_rest(now, "eod").await?;
            return Ok(TickOutcome::Closed);
        }

        if self.stop_loss_hit(&order, bid) {
            info!("stop loss: closing {} at {:.2}", order.order_id, bid);
            self.close_rest(now, "stop_loss").await?;
            return Ok(TickOutcome::Closed);
        }

        // take-profit zone on the underlying
        if let Some(tp) = order.tp_price {
            let quote = self.broker.get_quote(&order.symbol).await?;
            let hit = match order.option_type {
                OptionType::Call => quote.last >= tp,
                OptionType::Put => quote.last <= tp,
            };
            if hit {
                info!("tp zone {:.2} reached: closing {}", tp, order.order_id);
                self.close_rest(now, "tp_zone").await?;
                return Ok(TickOutcome::Closed);
            }
        }

        // ladder: non-runner rungs sell on touch
        let rungs: Vec<(usize, f64, u32)> = order
            .exit_targets
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.hit && !t.runner && bid >= t.target_price)
            .map(|(i, t)| (i, t.target_price, t.quantity))
            .collect();
        for (idx, target_price, target_qty) in rungs {
            let remaining = match self.active.lock().unwrap().as_ref() {
                Some(o) => o.remaining_quantity(),
                None => 0,
            };
            let qty = target_qty.min(remaining);
            if qty == 0 {
                continue;
            }
            self.sell_contracts(&order, qty, bid, target_price, now).await?;
            let mut active = self.active.lock().unwrap();
            if let Some(o) = active.as_mut() {
                o.exit_targets[idx].hit = true;
                o.status = OrderStatus::PartiallyClosed;
            }
        }

        // the runner exits only on the EMA-13 break, once every earlier
        // rung has been trimmed
        let runner_only_left = {
            let active = self.active.lock().unwrap();
            active
                .as_ref()
                .map(|o| {
                    o.remaining_quantity() > 0
                        && o.exit_targets.iter().filter(|t| !t.runner).all(|t| t.hit)
                })
                .unwrap_or(false)
        };
        if runner_only_left && self.ema_break(order.option_type, 13) {
            info!("runner exit: EMA-13 break against {}", order.option_type);
            self.close_rest(now, "runner_exit").await?;
            return Ok(TickOutcome::Closed);
        }

        let remaining = {
            let active = self.active.lock().unwrap();
            active.as_ref().map(|o| o.remaining_quantity()).unwrap_or(0)
        };
        if remaining == 0 {
            self.finalize(now).await?;
            return Ok(TickOutcome::Closed);
        }
        Ok(TickOutcome::Holding)
    }

    /// Loop `manage_tick` until flat. Spawned once per active order; the
    /// loop also exits if a directional switch replaced its order.
    pub async fn run_manage_loop(self: Arc<Self>) {
        let my_order = match self.active_order() {
            Some(o) => o.order_id,
            None => return,
        };
        loop {
            let still_mine = self
                .active_order()
                .map(|o| o.order_id == my_order)
                .unwrap_or(false);
            if !still_mine {
                break;
            }
            match self.manage_tick(Utc::now()).await {
                Ok(TickOutcome::Holding) => {}
                Ok(_) => break,
                Err(e) => {
                    warn!("manage tick error: {}", e);
                }
            }
            tokio::time::sleep(MANAGE_INTERVAL).await;
        }
    }

    /// Force-flat entry point for the end-of-day reconciler. Idempotent.
    pub async fn force_flat(&self, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.decision.lock().await;
        if self.active.lock().unwrap().is_some() {
            self.close_rest(now, "eod").await?;
        }
        Ok(())
    }

    fn past_eod_cutoff(&self, now: DateTime<Utc>) -> bool {
        let date = self.calendar.et_date(now);
        match self.calendar.session_for(date) {
            Some(session) => now >= session.close - chrono::Duration::minutes(1),
            None => false,
        }
    }

    fn stop_loss_hit(&self, order: &ActiveOrder, bid: f64) -> bool {
        let pct_change = (bid - order.entry_price) / order.entry_price * 100.0;
        match &self.settings.stop_loss {
            StopLossRule::Percent(p) => pct_change <= *p,
            StopLossRule::EmaBreak(period) => self.ema_break(order.option_type, *period),
            StopLossRule::Both(period, p) => {
                pct_change <= *p
                    && self.ema_break(order.option_type, *period)
                    && !order.partial_exits.is_empty()
            }
        }
    }

    /// A closed 2M candle on the losing side of the EMA, with the
    /// open-vs-close sanity check.
    fn ema_break(&self, option_type: OptionType, period: u32) -> bool {
        let view = self.ema_view.read().unwrap();
        let candle = match &view.last_candle {
            Some(c) => c,
            None => return false,
        };
        let ema = match view.values.get(&period) {
            Some(v) => *v,
            None => return false,
        };
        match option_type {
            OptionType::Call => candle.is_bearish() && candle.close < ema && ema > candle.close,
            OptionType::Put => candle.is_bullish() && candle.close > ema && ema < candle.close,
        }
    }

    /// Sell the whole remaining quantity as one order, then finalize.
    async fn close_rest(&self, now: DateTime<Utc>, reason: &str) -> Result<()> {
        let order = match self.active.lock().unwrap().clone() {
            Some(o) => o,
            None => return Ok(()),
        };
        let remaining = order.remaining_quantity();
        if remaining > 0 {
            let bid = self
                .broker
                .get_option_bid(
                    &order.symbol,
                    order.strike,
                    order.expiration,
                    order.option_type,
                )
                .await?;
            self.sell_contracts(&order, remaining, bid, bid, now).await?;
            debug!("sell_rest {} x{} ({})", order.order_id, remaining, reason);
        }
        self.finalize(now).await
    }

    async fn sell_contracts(
        &self,
        order: &ActiveOrder,
        quantity: u32,
        bid: f64,
        target_price: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let remaining = {
            let active = self.active.lock().unwrap();
            active.as_ref().map(|o| o.remaining_quantity()).unwrap_or(0)
        };
        if quantity == 0 || quantity > remaining {
            self.halt_orders(&format!(
                "oversell attempt on {}: {} requested, {} remaining",
                order.order_id, quantity, remaining
            ))
            .await;
            return Err(BotError::InvariantViolation("oversell".to_string()).into());
        }

        let request = BrokerOrderRequest {
            symbol: order.symbol.clone(),
            strike: order.strike,
            option_type: order.option_type,
            limit: None,
            expiration: order.expiration,
            quantity,
            side: OrderSide::SellToClose,
        };
        let broker_ref = self.broker.submit_order(&request).await?;
        let status = self.poll_terminal(&broker_ref).await?;
        if status != BrokerOrderStatus::Filled {
            return Err(BotError::Rejected(format!("sell ended {}", status)).into());
        }

        {
            let mut active = self.active.lock().unwrap();
            if let Some(o) = active.as_mut() {
                o.partial_exits.push(PartialExit {
                    target_price,
                    sold_price: bid,
                    quantity,
                    ts: now,
                });
            }
        }

        let snapshot = self.active.lock().unwrap().clone();
        if let Some(o) = snapshot {
            if let Err(e) = self.order_log.lock().unwrap().upsert(&o, None) {
                warn!("order log write failed: {}", e);
            }
            let handle = self
                .session
                .lock()
                .unwrap()
                .message_ids
                .get(&o.order_id)
                .cloned();
            let text = format!(
                "TRIM {} x{} @ {:.2} ({} remaining)",
                o.symbol,
                quantity,
                bid,
                o.remaining_quantity()
            );
            match handle {
                Some(h) => {
                    if let Err(e) = self.notifier.edit(&h, &text).await {
                        debug!("notifier edit failed: {}", e);
                    }
                }
                None => self.notify(&text).await,
            }
        }
        Ok(())
    }

    /// Seal the order: realized P&L, final log row, session bookkeeping.
    async fn finalize(&self, now: DateTime<Utc>) -> Result<()> {
        let mut order = match self.active.lock().unwrap().take() {
            Some(o) => o,
            None => return Ok(()),
        };
        order.status = OrderStatus::Closed;

        if !order.exits_consistent() {
            self.halt_orders(&format!(
                "order {} closed with inconsistent exits",
                order.order_id
            ))
            .await;
            return Err(BotError::InvariantViolation("exit accounting".to_string()).into());
        }

        let pnl = order.realized_pnl();
        {
            let mut session = self.session.lock().unwrap();
            session.record_pnl(pnl);
            session.credit(&order.order_id);
        }
        let exit_time = now.to_rfc3339();
        if let Err(e) = self.order_log.lock().unwrap().upsert(&order, Some(&exit_time)) {
            warn!("order log write failed: {}", e);
        }

        let text = format!(
            "CLOSED {} {} x{}: P&L ${:+.2} ({:+.1}%) | maxDD {:.1}% maxGain {:.1}%",
            order.symbol,
            order.option_type,
            order.quantity,
            pnl,
            if order.original_cost() > 0.0 {
                pnl / order.original_cost() * 100.0
            } else {
                0.0
            },
            order.max_drawdown_pct(),
            order.max_gain_pct()
        );
        let handle = self
            .session
            .lock()
            .unwrap()
            .message_ids
            .get(&order.order_id)
            .cloned();
        match handle {
            Some(h) => {
                if let Err(e) = self.notifier.edit(&h, &text).await {
                    debug!("notifier edit failed: {}", e);
                }
            }
            None => self.notify(&text).await,
        }
        info!("{}", text);
        Ok(())
    }

    async fn halt_orders(&self, reason: &str) {
        error!("INVARIANT VIOLATION: {}", reason);
        self.session.lock().unwrap().orders_halted = true;
        self.notify(&format!("CRITICAL: {}; order intake halted", reason))
            .await;
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.send(text).await {
            debug!("notifier send failed: {}", e);
        }
    }
}
