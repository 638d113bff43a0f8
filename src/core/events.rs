use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One scheduled economic release from the weekly-scraped cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub ts: DateTime<Utc>,
    pub severity: u8,
    pub title: String,
}

/// Blackout check consumed by the rule gate. The scraper that produces the
/// cache is an external collaborator; we only read its artifact.
#[async_trait]
pub trait EventCalendar: Send + Sync {
    async fn is_clear_of_events(&self, now: DateTime<Utc>, window_minutes: i64) -> Result<bool>;
}

pub struct FileEventCalendar {
    events: Vec<EconomicEvent>,
    min_severity: u8,
}

impl FileEventCalendar {
    /// Load the cached events file. A missing cache means no known events,
    /// which is "clear", not an error.
    pub fn load(path: &Path, min_severity: u8) -> Self {
        let events: Vec<EconomicEvent> = crate::storage::safe_read_json(path).unwrap_or_default();
        debug!("loaded {} economic events from {}", events.len(), path.display());
        Self {
            events,
            min_severity,
        }
    }

    pub fn from_events(events: Vec<EconomicEvent>, min_severity: u8) -> Self {
        Self {
            events,
            min_severity,
        }
    }
}

#[async_trait]
impl EventCalendar for FileEventCalendar {
    async fn is_clear_of_events(&self, now: DateTime<Utc>, window_minutes: i64) -> Result<bool> {
        for event in &self.events {
            if event.severity < self.min_severity {
                continue;
            }
            let delta_mins = (event.ts - now).num_minutes();
            if delta_mins >= 0 && delta_mins <= window_minutes {
                debug!(
                    "event blackout: '{}' in {} min (window {})",
                    event.title, delta_mins, window_minutes
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn event_inside_window_blocks() {
        let cal = FileEventCalendar::from_events(
            vec![EconomicEvent {
                ts: at(10, 20),
                severity: 3,
                title: "CPI".to_string(),
            }],
            3,
        );
        // 10:05, event at 10:20, window 20 -> delta 15 <= 20 -> blocked
        assert!(!cal.is_clear_of_events(at(10, 5), 20).await.unwrap());
    }

    #[tokio::test]
    async fn event_outside_window_allows() {
        let cal = FileEventCalendar::from_events(
            vec![EconomicEvent {
                ts: at(10, 30),
                severity: 3,
                title: "FOMC".to_string(),
            }],
            3,
        );
        // delta 25 > 20 -> clear
        assert!(cal.is_clear_of_events(at(10, 5), 20).await.unwrap());
    }

    #[tokio::test]
    async fn past_events_do_not_block() {
        let cal = FileEventCalendar::from_events(
            vec![EconomicEvent {
                ts: at(9, 0),
                severity: 3,
                title: "claims".to_string(),
            }],
            3,
        );
        assert!(cal.is_clear_of_events(at(10, 5), 20).await.unwrap());
    }

    #[tokio::test]
    async fn low_severity_ignored() {
        let cal = FileEventCalendar::from_events(
            vec![EconomicEvent {
                ts: at(10, 10),
                severity: 1,
                title: "minor speech".to_string(),
            }],
            3,
        );
        assert!(cal.is_clear_of_events(at(10, 5), 20).await.unwrap());
    }
}
