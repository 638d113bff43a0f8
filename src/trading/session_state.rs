use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide session state, owned by the supervisor and shared behind
/// a single lock. Only the order manager mutates the order fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub start_of_day_balance: f64,
    pub end_of_day_balance: f64,
    pub used_buying_power: HashMap<String, f64>,
    /// order_id -> notifier handle
    pub message_ids: HashMap<String, String>,
    pub realized_pnl: Vec<f64>,
    /// Set on an invariant violation; no new orders until operator reset.
    pub orders_halted: bool,
    pub reconciled_date: Option<NaiveDate>,
}

pub type SharedSessionState = Arc<Mutex<SessionState>>;

impl SessionState {
    pub fn new(start_of_day: f64, end_of_day: f64) -> Self {
        Self {
            start_of_day_balance: start_of_day,
            end_of_day_balance: end_of_day,
            used_buying_power: HashMap::new(),
            message_ids: HashMap::new(),
            realized_pnl: Vec::new(),
            orders_halted: false,
            reconciled_date: None,
        }
    }

    pub fn shared(self) -> SharedSessionState {
        Arc::new(Mutex::new(self))
    }

    /// Session balance as of now: start of day plus realized P&L.
    pub fn current_balance(&self) -> f64 {
        self.start_of_day_balance + self.realized_pnl.iter().sum::<f64>()
    }

    pub fn available_buying_power(&self) -> f64 {
        self.current_balance() - self.used_buying_power.values().sum::<f64>()
    }

    pub fn debit(&mut self, order_id: &str, cost: f64) {
        self.used_buying_power.insert(order_id.to_string(), cost);
    }

    pub fn credit(&mut self, order_id: &str) {
        self.used_buying_power.remove(order_id);
    }

    pub fn record_pnl(&mut self, pnl: f64) {
        self.realized_pnl.push(pnl);
    }

    /// Session rollover: seal end-of-day, move it to start-of-day, clear
    /// per-session maps. Safe to call once per date (the caller guards).
    pub fn roll(&mut self, date: NaiveDate) {
        self.end_of_day_balance = self.current_balance();
        self.start_of_day_balance = self.end_of_day_balance;
        self.end_of_day_balance = 0.0;
        self.realized_pnl.clear();
        self.used_buying_power.clear();
        self.message_ids.clear();
        self.reconciled_date = Some(date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_tracks_realized_pnl() {
        let mut s = SessionState::new(100_000.0, 0.0);
        s.record_pnl(673.0);
        s.record_pnl(1211.0);
        s.record_pnl(-450.0);
        assert!((s.current_balance() - 101_434.0).abs() < 1e-9);
    }

    #[test]
    fn buying_power_subtracts_open_costs() {
        let mut s = SessionState::new(10_000.0, 0.0);
        s.debit("o1", 430.0);
        assert!((s.available_buying_power() - 9570.0).abs() < 1e-9);
        s.credit("o1");
        assert!((s.available_buying_power() - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn roll_moves_end_to_start_and_clears() {
        let mut s = SessionState::new(100_000.0, 0.0);
        s.record_pnl(673.0);
        s.record_pnl(1211.0);
        s.record_pnl(-450.0);
        s.debit("o1", 100.0);
        s.message_ids.insert("o1".to_string(), "7".to_string());

        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        s.roll(date);

        assert!((s.start_of_day_balance - 101_434.0).abs() < 1e-9);
        assert!((s.end_of_day_balance - 0.0).abs() < 1e-9);
        assert!(s.realized_pnl.is_empty());
        assert!(s.used_buying_power.is_empty());
        assert!(s.message_ids.is_empty());
        assert_eq!(s.reconciled_date, Some(date));
    }
}
