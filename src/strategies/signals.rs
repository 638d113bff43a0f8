use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::OptionType;

/// What the rule gate hands to the order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub option_type: OptionType,
    pub tp_price: Option<f64>,
    pub zone_classification: String,
    pub flag_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    EcomBlackout,
    DirectionalMismatch,
    ZoneCapReached,
    NoEmaData,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::EcomBlackout => write!(f, "ecom_blackout"),
            RefusalReason::DirectionalMismatch => write!(f, "directional_mismatch"),
            RefusalReason::ZoneCapReached => write!(f, "zone_cap_reached"),
            RefusalReason::NoEmaData => write!(f, "no_ema_data"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Fire(OrderRequest),
    Refuse(RefusalReason),
}

impl Decision {
    pub fn is_fire(&self) -> bool {
        matches!(self, Decision::Fire(_))
    }
}
