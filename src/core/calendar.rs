use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::US::Eastern;

/// Session boundaries for one trading day, in UTC.
#[derive(Debug, Clone, Copy)]
pub struct MarketSession {
    pub premarket_start: DateTime<Utc>,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
    pub aftermarket_end: DateTime<Utc>,
}

impl MarketSession {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.open && t < self.close
    }
}

/// Wall-clock and trading-day awareness for US equity hours. All session
/// math happens in Eastern time; callers inject `now` so tests drive time.
pub struct MarketCalendar {
    holidays: Vec<NaiveDate>,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketCalendar {
    pub fn new() -> Self {
        Self {
            holidays: observed_holidays(),
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.succ_opt().expect("date overflow");
        while !self.is_trading_day(d) {
            d = d.succ_opt().expect("date overflow");
        }
        d
    }

    pub fn prev_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date.pred_opt().expect("date underflow");
        while !self.is_trading_day(d) {
            d = d.pred_opt().expect("date underflow");
        }
        d
    }

    /// Session boundaries for `date`, or None on weekends/holidays.
    pub fn session_for(&self, date: NaiveDate) -> Option<MarketSession> {
        if !self.is_trading_day(date) {
            return None;
        }
        let at = |h: u32, m: u32| -> DateTime<Utc> {
            Eastern
                .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()))
                .single()
                .expect("unambiguous eastern time")
                .with_timezone(&Utc)
        };
        Some(MarketSession {
            premarket_start: at(4, 0),
            open: at(9, 30),
            close: at(16, 0),
            aftermarket_end: at(20, 0),
        })
    }

    /// The Eastern-time trading date containing `now` (today if a trading
    /// day, otherwise the next one).
    pub fn trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.with_timezone(&Eastern).date_naive();
        if self.is_trading_day(today) {
            today
        } else {
            self.next_trading_day(today)
        }
    }

    /// Expiration date N calendar days out, pushed past weekends and
    /// holidays. Used by the order pre-flight for the `"NdtE"` config.
    pub fn expiration_for_dte(&self, today: NaiveDate, dte: u32) -> NaiveDate {
        let mut d = today + chrono::Duration::days(dte as i64);
        while !self.is_trading_day(d) {
            d = d.succ_opt().expect("date overflow");
        }
        d
    }

    pub fn et_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&Eastern).date_naive()
    }
}

/// Observed NYSE full-day closures for the supported window.
fn observed_holidays() -> Vec<NaiveDate> {
    let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
    vec![
        // 2025
        d(2025, 1, 1),
        d(2025, 1, 20),
        d(2025, 2, 17),
        d(2025, 4, 18),
        d(2025, 5, 26),
        d(2025, 6, 19),
        d(2025, 7, 4),
        d(2025, 9, 1),
        d(2025, 11, 27),
        d(2025, 12, 25),
        // 2026
        d(2026, 1, 1),
        d(2026, 1, 19),
        d(2026, 2, 16),
        d(2026, 4, 3),
        d(2026, 5, 25),
        d(2026, 6, 19),
        d(2026, 7, 3),
        d(2026, 9, 7),
        d(2026, 11, 26),
        d(2026, 12, 25),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekends_are_not_trading_days() {
        let cal = MarketCalendar::new();
        assert!(cal.is_trading_day(date(2025, 3, 14))); // Friday
        assert!(!cal.is_trading_day(date(2025, 3, 15))); // Saturday
        assert!(!cal.is_trading_day(date(2025, 3, 16))); // Sunday
    }

    #[test]
    fn holidays_are_closed() {
        let cal = MarketCalendar::new();
        assert!(!cal.is_trading_day(date(2025, 7, 4)));
        assert!(!cal.is_trading_day(date(2026, 1, 1)));
    }

    #[test]
    fn session_boundaries_in_eastern() {
        let cal = MarketCalendar::new();
        // March 14 2025 is after the DST switch: ET = UTC-4
        let s = cal.session_for(date(2025, 3, 14)).unwrap();
        assert_eq!(s.open.to_rfc3339(), "2025-03-14T13:30:00+00:00");
        assert_eq!(s.close.to_rfc3339(), "2025-03-14T20:00:00+00:00");
        assert!(s.contains(s.open));
        assert!(!s.contains(s.close));

        // January: ET = UTC-5
        let w = cal.session_for(date(2025, 1, 6)).unwrap();
        assert_eq!(w.open.to_rfc3339(), "2025-01-06T14:30:00+00:00");
    }

    #[test]
    fn expiration_skips_weekend() {
        let cal = MarketCalendar::new();
        // Friday + 1 day lands on Saturday -> pushed to Monday
        assert_eq!(
            cal.expiration_for_dte(date(2025, 3, 14), 1),
            date(2025, 3, 17)
        );
        // 0dte on a trading day stays put
        assert_eq!(
            cal.expiration_for_dte(date(2025, 3, 14), 0),
            date(2025, 3, 14)
        );
    }

    #[test]
    fn next_trading_day_rolls_past_holiday() {
        let cal = MarketCalendar::new();
        // July 3 2025 (Thu) -> July 4 holiday, July 5-6 weekend -> July 7
        assert_eq!(cal.next_trading_day(date(2025, 7, 3)), date(2025, 7, 7));
        assert_eq!(cal.prev_trading_day(date(2025, 7, 7)), date(2025, 7, 3));
    }
}
