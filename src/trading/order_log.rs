use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::ActiveOrder;

/// One persisted row per order, progressively filled as the order moves
/// through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLogRow {
    pub order_id: String,
    pub symbol: String,
    pub option_type: String,
    pub strike: f64,
    pub expiration: String,
    pub entry_time: String,
    pub entry_price: f64,
    pub quantity: u32,
    pub cost: f64,
    pub lowest_bid: f64,
    pub max_drawdown: f64,
    pub highest_bid: f64,
    pub max_gain: f64,
    pub avg_sold_bid: f64,
    pub total_profit: f64,
    pub total_percentage: f64,
    pub exit_time: String,
    pub zone_classification: String,
}

impl OrderLogRow {
    fn from_order(order: &ActiveOrder, exit_time: Option<&str>) -> Self {
        let cost = order.original_cost();
        let closed = order.sold_quantity() == order.quantity && order.quantity > 0;
        let (avg_sold, profit, pct) = if order.partial_exits.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let profit = order.realized_pnl();
            (
                order.average_sold_price(),
                profit,
                if cost > 0.0 { profit / cost * 100.0 } else { 0.0 },
            )
        };
        Self {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            option_type: order.option_type.to_string(),
            strike: order.strike,
            expiration: order.expiration.format("%Y-%m-%d").to_string(),
            entry_time: order.entry_time.to_rfc3339(),
            entry_price: order.entry_price,
            quantity: order.quantity,
            cost,
            lowest_bid: if order.lowest_bid.is_finite() {
                order.lowest_bid
            } else {
                0.0
            },
            max_drawdown: order.max_drawdown_pct(),
            highest_bid: if order.highest_bid.is_finite() {
                order.highest_bid
            } else {
                0.0
            },
            max_gain: order.max_gain_pct(),
            avg_sold_bid: avg_sold,
            total_profit: profit,
            total_percentage: pct,
            exit_time: if closed {
                exit_time.unwrap_or_default().to_string()
            } else {
                String::new()
            },
            zone_classification: order.zone_classification.clone(),
        }
    }
}

/// CSV order log. Rows live in memory and the whole file is rewritten
/// through a temp-rename on every update, so readers never see a torn row.
pub struct OrderLog {
    path: PathBuf,
    rows: Vec<OrderLogRow>,
}

impl OrderLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rows = Self::read_rows(&path).unwrap_or_default();
        Self { path, rows }
    }

    fn read_rows(path: &Path) -> Result<Vec<OrderLogRow>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    pub fn rows(&self) -> &[OrderLogRow] {
        &self.rows
    }

    /// Insert or update the row for this order and flush.
    pub fn upsert(&mut self, order: &ActiveOrder, exit_time: Option<&str>) -> Result<()> {
        let row = OrderLogRow::from_order(order, exit_time);
        match self.rows.iter_mut().find(|r| r.order_id == row.order_id) {
            Some(existing) => *existing = row,
            None => self.rows.push(row),
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            writer.serialize(row)?;
        }
        let bytes = writer.into_inner().context("csv flush")?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}
