use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{OptionType, OrderStatus};

/// One rung of the take-profit ladder, fixed at submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitTarget {
    pub target_pct: f64,
    pub target_price: f64,
    pub quantity: u32,
    /// The runner is held past its target until the EMA-13 break.
    pub runner: bool,
    pub hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialExit {
    pub target_price: f64,
    pub sold_price: f64,
    pub quantity: u32,
    pub ts: DateTime<Utc>,
}

/// The one live option position. At most one non-closed ActiveOrder exists
/// process-wide at any moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub order_id: String,
    pub broker_ref: Option<String>,
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: u32,
    pub partial_exits: Vec<PartialExit>,
    pub exit_targets: Vec<ExitTarget>,
    pub tp_price: Option<f64>,
    pub zone_classification: String,
    pub lowest_bid: f64,
    pub highest_bid: f64,
    pub adjustments: u32,
    pub status: OrderStatus,
}

impl ActiveOrder {
    pub fn sold_quantity(&self) -> u32 {
        self.partial_exits.iter().map(|pe| pe.quantity).sum()
    }

    pub fn remaining_quantity(&self) -> u32 {
        self.quantity.saturating_sub(self.sold_quantity())
    }

    /// Entry cost in dollars (contracts are 100 shares).
    pub fn original_cost(&self) -> f64 {
        self.entry_price * self.quantity as f64 * 100.0
    }

    pub fn realized_pnl(&self) -> f64 {
        let proceeds: f64 = self
            .partial_exits
            .iter()
            .map(|pe| pe.sold_price * pe.quantity as f64 * 100.0)
            .sum();
        proceeds - self.original_cost()
    }

    pub fn average_sold_price(&self) -> f64 {
        let sold = self.sold_quantity();
        if sold == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .partial_exits
            .iter()
            .map(|pe| pe.sold_price * pe.quantity as f64)
            .sum();
        weighted / sold as f64
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        if self.entry_price <= 0.0 || !self.lowest_bid.is_finite() {
            return 0.0;
        }
        (self.entry_price - self.lowest_bid) / self.entry_price * 100.0
    }

    pub fn max_gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 || !self.highest_bid.is_finite() {
            return 0.0;
        }
        (self.highest_bid - self.entry_price) / self.entry_price * 100.0
    }

    /// Oversell guard: sum of partial exits never exceeds quantity, and a
    /// closed order is fully sold.
    pub fn exits_consistent(&self) -> bool {
        let sold = self.sold_quantity();
        if sold > self.quantity {
            return false;
        }
        if self.status == OrderStatus::Closed && sold != self.quantity {
            return false;
        }
        true
    }
}
