use serde::{Deserialize, Serialize};

use crate::models::ZoneKind;

/// Fixed epsilon for "are these prices equal" comparisons.
pub const PRICE_EPSILON: f64 = 1e-6;

/// A support/resistance zone between two horizontal lines. `important` is
/// the line that matters for break detection (the daily extreme); `buffer`
/// is the body side. For PDHL both lines are important.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub kind: ZoneKind,
    pub anchor_seq: u64,
    pub important: f64,
    pub buffer: f64,
}

impl Zone {
    pub fn new(id: impl Into<String>, kind: ZoneKind, anchor_seq: u64, important: f64, buffer: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            anchor_seq,
            important,
            buffer,
        }
    }

    pub fn top(&self) -> f64 {
        self.important.max(self.buffer)
    }

    pub fn bottom(&self) -> f64 {
        self.important.min(self.buffer)
    }

    pub fn height(&self) -> f64 {
        (self.important - self.buffer).abs()
    }

    pub fn contains_price(&self, price: f64) -> bool {
        price >= self.bottom() - PRICE_EPSILON && price <= self.top() + PRICE_EPSILON
    }

    /// True when `other` lies entirely within this zone.
    pub fn contains_zone(&self, other: &Zone) -> bool {
        self.bottom() <= other.bottom() + PRICE_EPSILON && self.top() >= other.top() - PRICE_EPSILON
    }

    /// True when the two vertical intervals intersect at all.
    pub fn overlaps(&self, other: &Zone) -> bool {
        self.bottom() <= other.top() + PRICE_EPSILON && other.bottom() <= self.top() + PRICE_EPSILON
    }

    /// Minimum distance between any pair of lines (important/buffer) of the
    /// two zones.
    pub fn min_line_distance(&self, other: &Zone) -> f64 {
        let mut min = f64::INFINITY;
        for a in [self.important, self.buffer] {
            for b in [other.important, other.buffer] {
                min = min.min((a - b).abs());
            }
        }
        min
    }

    /// Exempt from resizing: PDHL and the `b_`-prefixed both-important
    /// convention.
    pub fn resize_exempt(&self) -> bool {
        self.kind == ZoneKind::Pdhl || self.id.starts_with("b_")
    }
}

/// A lightweight horizontal target produced when two zones are too close
/// to co-exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitLine {
    pub id: String,
    pub anchor_seq: u64,
    pub price: f64,
}

impl TakeProfitLine {
    pub fn new(id: impl Into<String>, anchor_seq: u64, price: f64) -> Self {
        Self {
            id: id.into(),
            anchor_seq,
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resistance(important: f64, buffer: f64) -> Zone {
        Zone::new("resistance_1", ZoneKind::Resistance, 10, important, buffer)
    }

    #[test]
    fn top_bottom_orientation() {
        let z = resistance(450.0, 449.6);
        assert!((z.top() - 450.0).abs() < 1e-9);
        assert!((z.bottom() - 449.6).abs() < 1e-9);
        assert!((z.height() - 0.4).abs() < 1e-9);

        // support: important is the low, buffer above it
        let s = Zone::new("support_1", ZoneKind::Support, 3, 445.0, 445.3);
        assert!((s.top() - 445.3).abs() < 1e-9);
        assert!((s.bottom() - 445.0).abs() < 1e-9);
    }

    #[test]
    fn containment_and_overlap() {
        let outer = resistance(450.0, 448.0);
        let inner = Zone::new("support_1", ZoneKind::Support, 5, 448.5, 449.5);
        let disjoint = Zone::new("support_2", ZoneKind::Support, 7, 440.0, 440.4);

        assert!(outer.contains_zone(&inner));
        assert!(outer.overlaps(&inner));
        assert!(!outer.contains_zone(&disjoint));
        assert!(!outer.overlaps(&disjoint));
    }

    #[test]
    fn min_line_distance_picks_closest_pair() {
        let a = resistance(450.0, 449.5);
        let b = Zone::new("support_1", ZoneKind::Support, 2, 449.0, 449.3);
        // closest pair is buffer(449.5) vs buffer(449.3)
        assert!((a.min_line_distance(&b) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn resize_exemptions() {
        assert!(Zone::new("PDHL_1", ZoneKind::Pdhl, 0, 450.0, 445.0).resize_exempt());
        assert!(Zone::new("b_resistance_1", ZoneKind::Resistance, 0, 450.0, 449.0).resize_exempt());
        assert!(!resistance(450.0, 449.6).resize_exempt());
    }
}
