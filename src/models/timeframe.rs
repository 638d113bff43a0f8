use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "2M")]
    M2,
    #[serde(rename = "5M")]
    M5,
    #[serde(rename = "15M")]
    M15,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M2 => "2M",
            Timeframe::M5 => "5M",
            Timeframe::M15 => "15M",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Timeframe::M2 => Duration::from_secs(120),
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::M15 => Duration::from_secs(900),
        }
    }

    pub fn as_seconds(&self) -> i64 {
        self.as_duration().as_secs() as i64
    }

    pub fn as_minutes(&self) -> i64 {
        self.as_seconds() / 60
    }

    /// Historical-data API interval parameters: (interval, timescale).
    pub fn historical_interval(&self) -> (u32, &'static str) {
        match self {
            Timeframe::M2 => (2, "minute"),
            Timeframe::M5 => (5, "minute"),
            Timeframe::M15 => (15, "minute"),
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Timeframe> {
        match s.trim().to_uppercase().as_str() {
            "2M" => Some(Timeframe::M2),
            "5M" => Some(Timeframe::M5),
            "15M" => Some(Timeframe::M15),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for tf in [Timeframe::M2, Timeframe::M5, Timeframe::M15] {
            assert_eq!(Timeframe::from_str_loose(tf.as_str()), Some(tf));
        }
        assert_eq!(Timeframe::from_str_loose("2m"), Some(Timeframe::M2));
        assert_eq!(Timeframe::from_str_loose("1h"), None);
    }

    #[test]
    fn durations() {
        assert_eq!(Timeframe::M2.as_seconds(), 120);
        assert_eq!(Timeframe::M5.as_minutes(), 5);
        assert_eq!(Timeframe::M15.as_seconds(), 900);
    }
}
