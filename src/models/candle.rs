use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;

/// One closed OHLC candle. `open_ts` is aligned to the timeframe grid and
/// `seq` is strictly increasing per timeframe within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timeframe: Timeframe,
    pub open_ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub seq: u64,
}

impl Candle {
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn total_range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body_top(&self) -> f64 {
        self.close.max(self.open)
    }

    pub fn body_bottom(&self) -> f64 {
        self.close.min(self.open)
    }

    /// Candle invariant from the data model: low <= body <= high.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.body_bottom() && self.body_top() <= self.high
    }
}

/// Wraps Vec<Candle> with the lookups the engines need.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push(candle);
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }

    pub fn slice(&self, start: usize, end: usize) -> CandleSeries {
        let s = start.min(self.candles.len());
        let e = end.min(self.candles.len());
        CandleSeries::new(self.candles[s..e].to_vec())
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Index and value of the highest high.
    pub fn high_idx_max(&self) -> Option<(usize, f64)> {
        self.candles
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.high.partial_cmp(&b.high).unwrap())
            .map(|(i, c)| (i, c.high))
    }

    /// Index and value of the lowest low.
    pub fn low_idx_min(&self) -> Option<(usize, f64)> {
        self.candles
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.low.partial_cmp(&b.low).unwrap())
            .map(|(i, c)| (i, c.low))
    }

    pub fn find_by_seq(&self, seq: u64) -> Option<&Candle> {
        self.candles.iter().find(|c| c.seq == seq)
    }

    /// Candles whose open_ts falls on the given Eastern-time date.
    pub fn filter_by_date(&self, date: chrono::NaiveDate) -> CandleSeries {
        let candles: Vec<Candle> = self
            .candles
            .iter()
            .filter(|c| c.open_ts.with_timezone(&chrono_tz::US::Eastern).date_naive() == date)
            .cloned()
            .collect();
        CandleSeries::new(candles)
    }

    /// Distinct Eastern-time dates present, oldest first.
    pub fn trading_dates(&self) -> Vec<chrono::NaiveDate> {
        let mut dates: Vec<chrono::NaiveDate> = Vec::new();
        for c in &self.candles {
            let d = c.open_ts.with_timezone(&chrono_tz::US::Eastern).date_naive();
            if dates.last() != Some(&d) {
                dates.push(d);
            }
        }
        dates
    }
}

impl std::ops::Index<usize> for CandleSeries {
    type Output = Candle;
    fn index(&self, index: usize) -> &Self::Output {
        &self.candles[index]
    }
}

impl IntoIterator for CandleSeries {
    type Item = Candle;
    type IntoIter = std::vec::IntoIter<Candle>;
    fn into_iter(self) -> Self::IntoIter {
        self.candles.into_iter()
    }
}

impl<'a> IntoIterator for &'a CandleSeries {
    type Item = &'a Candle;
    type IntoIter = std::slice::Iter<'a, Candle>;
    fn into_iter(self) -> Self::IntoIter {
        self.candles.iter()
    }
}
