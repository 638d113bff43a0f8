use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }

    pub fn opposite(&self) -> OptionType {
        match self {
            OptionType::Call => OptionType::Put,
            OptionType::Put => OptionType::Call,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Bull,
    Bear,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Bull => "bull",
            FlagType::Bear => "bear",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneKind {
    Support,
    Resistance,
    #[serde(rename = "PDHL")]
    Pdhl,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Support => "support",
            ZoneKind::Resistance => "resistance",
            ZoneKind::Pdhl => "PDHL",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which line of a zone price is interacting with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneLine {
    #[serde(rename = "PDH")]
    Pdh,
    #[serde(rename = "PDL")]
    Pdl,
    Buffer,
}

impl ZoneLine {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneLine::Pdh => "PDH",
            ZoneLine::Pdl => "PDL",
            ZoneLine::Buffer => "Buffer",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<ZoneLine> {
        match s {
            "PDH" => Some(ZoneLine::Pdh),
            "PDL" => Some(ZoneLine::Pdl),
            "Buffer" => Some(ZoneLine::Buffer),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointMode {
    Flow,
    Pivot,
}

impl fmt::Display for PointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointMode::Flow => write!(f, "flow"),
            PointMode::Pivot => write!(f, "pivot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyClosed,
    Closed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PartiallyClosed => write!(f, "partially_closed"),
            OrderStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Broker-side lifecycle of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderStatus {
    Open,
    Filled,
    Canceled,
    Rejected,
}

impl BrokerOrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BrokerOrderStatus::Open)
    }
}

impl fmt::Display for BrokerOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerOrderStatus::Open => write!(f, "open"),
            BrokerOrderStatus::Filled => write!(f, "filled"),
            BrokerOrderStatus::Canceled => write!(f, "canceled"),
            BrokerOrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    BuyToOpen,
    SellToClose,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::BuyToOpen => "buy_to_open",
            OrderSide::SellToClose => "sell_to_close",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
