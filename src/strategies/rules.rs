use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::Config;
use crate::core::classifier::Classification;
use crate::core::events::EventCalendar;
use crate::core::flags::CompletedFlag;
use crate::models::{Candle, FlagType, OptionType, Zone, ZoneLine};
use crate::strategies::signals::{Decision, OrderRequest, RefusalReason};

/// Take-profit price for a position opened below a zone line.
fn tp_below(zone: &Zone, line: ZoneLine, option_type: OptionType) -> Option<f64> {
    match (option_type, line) {
        (OptionType::Call, ZoneLine::Pdl) => Some(zone.top()),
        (OptionType::Call, ZoneLine::Buffer) => Some(zone.important),
        (OptionType::Call, ZoneLine::Pdh) => Some(zone.bottom()),
        (OptionType::Put, _) => None,
    }
}

/// Take-profit price for a position opened above a zone line.
fn tp_above(zone: &Zone, line: ZoneLine, option_type: OptionType) -> Option<f64> {
    match (option_type, line) {
        (OptionType::Put, ZoneLine::Pdh) => Some(zone.bottom()),
        (OptionType::Put, ZoneLine::Buffer) => Some(zone.important),
        (OptionType::Put, ZoneLine::Pdl) => Some(zone.top()),
        (OptionType::Call, _) => None,
    }
}

/// The mapping table: classification + direction -> target line price.
pub fn take_profit_for(
    classification: &Classification,
    zones: &[Zone],
    option_type: OptionType,
) -> Option<f64> {
    let find = |id: &str| zones.iter().find(|z| z.id == id);
    match classification {
        Classification::Inside { .. } | Classification::Clear => None,
        Classification::Above { zone_id, line, .. } => {
            tp_above(find(zone_id)?, *line, option_type)
        }
        Classification::Below { zone_id, line, .. } => {
            tp_below(find(zone_id)?, *line, option_type)
        }
        Classification::Between {
            below_id,
            below_line,
            above_id,
            above_line,
            ..
        } => match option_type {
            // calls target the zone overhead, puts the zone underneath
            OptionType::Call => tp_below(find(above_id)?, *above_line, option_type),
            OptionType::Put => tp_above(find(below_id)?, *below_line, option_type),
        },
    }
}

/// Pre-trade checks between a completed flag and the order manager.
pub struct RuleGate {
    zone_order_counts: HashMap<String, u32>,
}

impl Default for RuleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleGate {
    pub fn new() -> Self {
        Self {
            zone_order_counts: HashMap::new(),
        }
    }

    /// Decide whether the completed flags on this candle become a buy.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        flags: &[CompletedFlag],
        candle: &Candle,
        classification: &Classification,
        zones: &[Zone],
        ema_200_2m: Option<f64>,
        events: &dyn EventCalendar,
        now: DateTime<Utc>,
        cfg: &Config,
    ) -> Decision {
        // 1. direction from the 2M EMA(200) bias
        let ema = match ema_200_2m {
            Some(v) => v,
            None => return Decision::Refuse(RefusalReason::NoEmaData),
        };
        let option_type = if candle.close > ema {
            OptionType::Call
        } else {
            OptionType::Put
        };

        // 2. economic-event blackout
        let clear = events
            .is_clear_of_events(now, cfg.mins_before_news_cancelation)
            .await
            .unwrap_or(false);
        if !clear {
            info!("refusing order: economic event inside blackout window");
            return Decision::Refuse(RefusalReason::EcomBlackout);
        }

        // 3. the flags must not all point the other way
        let any_bull = flags.iter().any(|f| f.flag_type == FlagType::Bull);
        let any_bear = flags.iter().any(|f| f.flag_type == FlagType::Bear);
        let mismatch = match option_type {
            OptionType::Call => any_bear && !any_bull,
            OptionType::Put => any_bull && !any_bear,
        };
        if mismatch {
            debug!(
                "refusing {}: completed flags all point the other way",
                option_type
            );
            return Decision::Refuse(RefusalReason::DirectionalMismatch);
        }

        // 4. take-profit target from the zone classification
        let tp_price = take_profit_for(classification, zones, option_type);

        // 5. per-zone trade cap
        let label = classification.label();
        let prior = self.zone_order_counts.get(&label).copied().unwrap_or(0);
        if prior >= cfg.orders_zone_threshold {
            info!(
                "refusing order: {} orders already taken at '{}'",
                prior, label
            );
            return Decision::Refuse(RefusalReason::ZoneCapReached);
        }

        let flag_name = flags
            .first()
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "unflagged".to_string());

        Decision::Fire(OrderRequest {
            option_type,
            tp_price,
            zone_classification: label,
            flag_name,
        })
    }

    /// Record a successful submit against its classification for the cap.
    pub fn record_order(&mut self, classification: &str) {
        *self
            .zone_order_counts
            .entry(classification.to_string())
            .or_insert(0) += 1;
    }

    pub fn reset(&mut self) {
        self.zone_order_counts.clear();
    }
}
