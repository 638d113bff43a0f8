use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::core::calendar::MarketCalendar;
use crate::models::{Candle, Timeframe, TradeEvent};

/// One candle-close boundary. `close_at` is the grid instant; a match
/// anywhere in [close_at, buffered] closes the candle, and the window is
/// consumed either way so each boundary fires at most once.
#[derive(Debug, Clone, Copy)]
struct Boundary {
    open_ts: DateTime<Utc>,
    close_at: DateTime<Utc>,
    buffered: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct WorkingCandle {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    prints: u64,
}

impl WorkingCandle {
    fn seed(price: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            prints: 1,
        }
    }

    fn apply(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.prints += 1;
    }
}

struct TimeframeState {
    working: Option<WorkingCandle>,
    pending: std::collections::VecDeque<Boundary>,
    seq: u64,
}

/// Rolls second-resolution trade prints into per-timeframe OHLC candles.
/// Candles for a given timeframe are emitted in strict time order.
pub struct CandleAggregator {
    calendar: MarketCalendar,
    timeframes: Vec<Timeframe>,
    buffer_secs: i64,
    session_date: Option<NaiveDate>,
    states: HashMap<Timeframe, TimeframeState>,
}

impl CandleAggregator {
    pub fn new(timeframes: Vec<Timeframe>, buffer_secs: i64) -> Self {
        Self {
            calendar: MarketCalendar::new(),
            timeframes,
            buffer_secs,
            session_date: None,
            states: HashMap::new(),
        }
    }

    pub fn seq(&self, tf: Timeframe) -> u64 {
        self.states.get(&tf).map(|s| s.seq).unwrap_or(0)
    }

    /// Feed one trade print; returns any candles closed by it.
    pub fn on_trade(&mut self, event: TradeEvent) -> Vec<Candle> {
        let et_date = self.calendar.et_date(event.ts);
        if self.session_date != Some(et_date) {
            self.roll_to(et_date);
        }

        let mut closed = Vec::new();
        for tf in self.timeframes.clone() {
            if let Some(candle) = self.advance_timeframe(tf, &event) {
                closed.push(candle);
            }
        }
        closed
    }

    /// Reset the grid and all per-timeframe state for a new session date.
    fn roll_to(&mut self, date: NaiveDate) {
        if self.session_date.is_some() {
            info!("day rollover: rebuilding candle boundaries for {}", date);
        }
        self.session_date = Some(date);
        self.states.clear();

        let session = match self.calendar.session_for(date) {
            Some(s) => s,
            None => {
                debug!("{} is not a trading day; no boundaries", date);
                return;
            }
        };

        for tf in &self.timeframes {
            let step = chrono::Duration::seconds(tf.as_seconds());
            let buffer = chrono::Duration::seconds(self.buffer_secs);
            let mut pending = std::collections::VecDeque::new();
            let mut open_ts = session.open;
            while open_ts + step <= session.close {
                let close_at = open_ts + step;
                pending.push_back(Boundary {
                    open_ts,
                    close_at,
                    buffered: close_at + buffer,
                });
                open_ts = close_at;
            }
            self.states.insert(
                *tf,
                TimeframeState {
                    working: None,
                    pending,
                    seq: 0,
                },
            );
        }
    }

    fn advance_timeframe(&mut self, tf: Timeframe, event: &TradeEvent) -> Option<Candle> {
        let state = self.states.get_mut(&tf)?;
        let first_open = state.pending.front()?.open_ts;
        if event.ts < first_open && state.working.is_none() {
            // pre-open prints are not part of the session grid
            return None;
        }

        let mut emitted = None;
        while let Some(boundary) = state.pending.front().copied() {
            if event.ts < boundary.close_at {
                break;
            }
            if event.ts <= boundary.buffered {
                // boundary (or its buffered variant) observed: close now
                state.pending.pop_front();
                if let Some(w) = state.working.take() {
                    let candle = Candle {
                        timeframe: tf,
                        open_ts: boundary.open_ts,
                        open: w.open,
                        high: w.high,
                        low: w.low,
                        close: w.close,
                        volume: w.prints as f64,
                        seq: state.seq,
                    };
                    state.seq += 1;
                    emitted = Some(candle);
                }
                break;
            }
            // no print landed inside the buffer window: the boundary is
            // missed and its partial candle is discarded, never emitted
            warn!(
                "{} boundary {} missed; dropping partial candle",
                tf, boundary.close_at
            );
            state.pending.pop_front();
            state.working = None;
        }

        match &mut state.working {
            Some(w) => w.apply(event.price),
            None => {
                if !state.pending.is_empty() {
                    state.working = Some(WorkingCandle::seed(event.price));
                }
            }
        }

        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2025-03-14 is a Friday; ET = UTC-4, so 13:30 UTC = 09:30 ET
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, s).unwrap()
    }

    fn agg() -> CandleAggregator {
        CandleAggregator::new(vec![Timeframe::M2], 3)
    }

    fn trade(price: f64, t: DateTime<Utc>) -> TradeEvent {
        TradeEvent { price, ts: t }
    }

    #[test]
    fn accumulates_and_closes_on_exact_boundary() {
        let mut a = agg();
        assert!(a.on_trade(trade(450.0, ts(13, 30, 5))).is_empty());
        assert!(a.on_trade(trade(451.0, ts(13, 30, 40))).is_empty());
        assert!(a.on_trade(trade(449.5, ts(13, 31, 10))).is_empty());

        // first print at/after 13:32 closes the 13:30 candle
        let closed = a.on_trade(trade(450.2, ts(13, 32, 0)));
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert_eq!(c.seq, 0);
        assert_eq!(c.open_ts, ts(13, 30, 0));
        assert!((c.open - 450.0).abs() < 1e-9);
        assert!((c.high - 451.0).abs() < 1e-9);
        assert!((c.low - 449.5).abs() < 1e-9);
        assert!((c.close - 449.5).abs() < 1e-9);
        assert!(c.is_well_formed());
    }

    #[test]
    fn buffered_variant_also_closes() {
        let mut a = agg();
        a.on_trade(trade(450.0, ts(13, 30, 5)));
        // next print lands 2s after the boundary, inside CANDLE_BUFFER=3
        let closed = a.on_trade(trade(450.4, ts(13, 32, 2)));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].open_ts, ts(13, 30, 0));
        // the triggering print seeds the next candle, not the closed one
        assert!((closed[0].close - 450.0).abs() < 1e-9);
    }

    #[test]
    fn missed_boundary_discards_partial() {
        let mut a = agg();
        a.on_trade(trade(450.0, ts(13, 30, 5)));
        // feed gap: next print is 13:34:30, past 13:32 + buffer AND inside
        // the 13:34 window, so the 13:30 candle is dropped and the 13:32
        // candle (never seeded) emits nothing either
        let closed = a.on_trade(trade(452.0, ts(13, 34, 1)));
        assert!(closed.is_empty());

        // the new working candle starts from the late print
        let closed = a.on_trade(trade(452.5, ts(13, 36, 0)));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].open_ts, ts(13, 34, 0));
        assert!((closed[0].open - 452.0).abs() < 1e-9);
        assert_eq!(closed[0].seq, 0, "discarded candles consume no seq");
    }

    #[test]
    fn seq_strictly_increases() {
        let mut a = agg();
        let mut seqs = Vec::new();
        let mut t = ts(13, 30, 1);
        for i in 0..300 {
            let price = 450.0 + (i % 7) as f64 * 0.1;
            for c in a.on_trade(trade(price, t)) {
                seqs.push(c.seq);
            }
            t += chrono::Duration::seconds(30);
        }
        assert!(!seqs.is_empty());
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn multi_timeframe_boundaries_fire_independently() {
        let mut a = CandleAggregator::new(vec![Timeframe::M2, Timeframe::M5], 3);
        let mut t = ts(13, 30, 1);
        let mut by_tf: HashMap<Timeframe, u64> = HashMap::new();
        for _ in 0..70 {
            for c in a.on_trade(trade(450.0, t)) {
                *by_tf.entry(c.timeframe).or_insert(0) += 1;
            }
            t += chrono::Duration::seconds(30);
        }
        // ~34.5 minutes of prints: 2M closes 17 candles, 5M closes 6
        assert_eq!(by_tf[&Timeframe::M2], 17);
        assert_eq!(by_tf[&Timeframe::M5], 6);
    }

    #[test]
    fn pre_open_prints_are_ignored() {
        let mut a = agg();
        assert!(a.on_trade(trade(449.0, ts(13, 0, 0))).is_empty());
        a.on_trade(trade(450.0, ts(13, 30, 5)));
        let closed = a.on_trade(trade(450.1, ts(13, 32, 0)));
        assert_eq!(closed.len(), 1);
        // 13:00 print did not leak into the open
        assert!((closed[0].open - 450.0).abs() < 1e-9);
    }
}
