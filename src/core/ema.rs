use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::models::{Candle, Timeframe};

/// One EMA reading per period, joined to its candle by `x` (the candle's
/// session sequence number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaSample {
    pub x: u64,
    pub values: BTreeMap<u32, f64>,
}

fn alpha(period: u32) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Per-timeframe EMA state. Before market_open + 15 min, live candles are
/// buffered (deduped by second-truncated timestamp) and only provisional
/// values are available; the one-shot bootstrap then warms the state from
/// historical pre/after-market candles, replays the buffer, and switches
/// to incremental updates.
pub struct EmaEngine {
    timeframe: Timeframe,
    periods: Vec<u32>,
    running: BTreeMap<u32, f64>,
    samples: Vec<EmaSample>,
    buffer: BTreeMap<i64, Candle>,
    has_calculated: bool,
}

impl EmaEngine {
    pub fn new(timeframe: Timeframe, periods: Vec<u32>) -> Self {
        Self {
            timeframe,
            periods,
            running: BTreeMap::new(),
            samples: Vec::new(),
            buffer: BTreeMap::new(),
            has_calculated: false,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn has_calculated(&self) -> bool {
        self.has_calculated
    }

    pub fn samples(&self) -> &[EmaSample] {
        &self.samples
    }

    pub fn latest(&self, period: u32) -> Option<f64> {
        self.running.get(&period).copied()
    }

    pub fn sample_for(&self, x: u64) -> Option<&EmaSample> {
        self.samples.iter().find(|s| s.x == x)
    }

    /// Pre-open phase: stash the candle, deduped by second.
    pub fn buffer_candle(&mut self, candle: &Candle) {
        self.buffer.insert(candle.open_ts.timestamp(), candle.clone());
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Provisional from-scratch series over historical + buffered candles.
    /// Displayed only; nothing is stored.
    pub fn provisional(&self, historical: &[Candle]) -> Vec<EmaSample> {
        let mut closes: Vec<(i64, f64)> = historical
            .iter()
            .map(|c| (c.open_ts.timestamp(), c.close))
            .chain(self.buffer.values().map(|c| (c.open_ts.timestamp(), c.close)))
            .collect();
        closes.sort_by_key(|(ts, _)| *ts);
        closes.dedup_by_key(|(ts, _)| *ts);

        let mut running: BTreeMap<u32, f64> = BTreeMap::new();
        let mut out = Vec::with_capacity(closes.len());
        for (i, (_, close)) in closes.iter().enumerate() {
            let mut values = BTreeMap::new();
            for &p in &self.periods {
                let next = match running.get(&p) {
                    Some(prev) => alpha(p) * close + (1.0 - alpha(p)) * prev,
                    None => *close,
                };
                running.insert(p, next);
                values.insert(p, next);
            }
            out.push(EmaSample { x: i as u64, values });
        }
        out
    }

    /// One-shot bootstrap: warm the running state on historical candles
    /// (no samples emitted for them), then replay the buffered live
    /// candles in timestamp order, emitting one sample per candle.
    pub fn bootstrap(&mut self, historical: &[Candle]) {
        if self.has_calculated {
            debug!("{} ema bootstrap skipped; already calculated", self.timeframe);
            return;
        }

        let mut hist: Vec<&Candle> = historical.iter().collect();
        hist.sort_by_key(|c| c.open_ts);
        for candle in hist {
            for &p in &self.periods.clone() {
                self.advance_period(p, candle.close);
            }
        }

        let buffered: Vec<Candle> = self.buffer.values().cloned().collect();
        for candle in &buffered {
            self.push_sample(candle);
        }

        self.has_calculated = true;
        self.buffer.clear();
        info!(
            "{} ema bootstrap complete: {} samples, periods {:?}",
            self.timeframe,
            self.samples.len(),
            self.periods
        );
    }

    /// Incremental phase: exactly one sample per closed candle.
    pub fn on_candle(&mut self, candle: &Candle) {
        self.push_sample(candle);
    }

    fn push_sample(&mut self, candle: &Candle) {
        let mut values = BTreeMap::new();
        for &p in &self.periods.clone() {
            values.insert(p, self.advance_period(p, candle.close));
        }
        self.samples.push(EmaSample {
            x: candle.seq,
            values,
        });
    }

    fn advance_period(&mut self, period: u32, close: f64) -> f64 {
        let next = match self.running.get(&period) {
            Some(prev) => alpha(period) * close + (1.0 - alpha(period)) * prev,
            None => close,
        };
        self.running.insert(period, next);
        next
    }

    /// Drop all session state; bootstrap may run again next session.
    pub fn reset(&mut self) {
        self.running.clear();
        self.samples.clear();
        self.buffer.clear();
        self.has_calculated = false;
    }

    /// Persisted-artifact rows: one object per sample, period values keyed
    /// by period string plus the candle index under "x".
    pub fn artifact_rows(&self) -> Vec<serde_json::Value> {
        self.samples
            .iter()
            .map(|sample| {
                let mut row = serde_json::Map::new();
                for (period, value) in &sample.values {
                    row.insert(period.to_string(), serde_json::json!(value));
                }
                row.insert("x".to_string(), serde_json::json!(sample.x));
                serde_json::Value::Object(row)
            })
            .collect()
    }
}
