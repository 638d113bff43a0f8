use std::collections::HashMap;
use tracing::debug;

use crate::models::{Candle, FlagType, Zone, ZoneKind, ZoneLine};

/// Where price sits relative to the zone set.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// No zones known yet; no decision possible.
    Clear,
    Inside {
        zone_id: String,
        kind: ZoneKind,
    },
    Above {
        zone_id: String,
        kind: ZoneKind,
        line: ZoneLine,
    },
    Below {
        zone_id: String,
        kind: ZoneKind,
        line: ZoneLine,
    },
    Between {
        below_id: String,
        below_kind: ZoneKind,
        below_line: ZoneLine,
        above_id: String,
        above_kind: ZoneKind,
        above_line: ZoneLine,
    },
}

impl Classification {
    /// The canonical string used for order records and the per-zone cap.
    pub fn label(&self) -> String {
        match self {
            Classification::Clear => "clear".to_string(),
            Classification::Inside { zone_id, .. } => format!("inside {}", zone_id),
            Classification::Above { zone_id, line, .. } => {
                format!("above {} {}", zone_id, line)
            }
            Classification::Below { zone_id, line, .. } => {
                format!("below {} {}", zone_id, line)
            }
            Classification::Between {
                below_id,
                below_line,
                above_id,
                above_line,
                ..
            } => format!("{} {}---{} {}", below_id, below_line, above_id, above_line),
        }
    }
}

fn upper_line(kind: ZoneKind) -> ZoneLine {
    match kind {
        ZoneKind::Resistance => ZoneLine::Pdh,
        ZoneKind::Support => ZoneLine::Buffer,
        ZoneKind::Pdhl => ZoneLine::Pdh,
    }
}

fn lower_line(kind: ZoneKind) -> ZoneLine {
    match kind {
        ZoneKind::Resistance => ZoneLine::Buffer,
        ZoneKind::Support => ZoneLine::Pdl,
        ZoneKind::Pdhl => ZoneLine::Pdl,
    }
}

/// Pure classification of a price against the zone set.
pub fn classify(price: f64, zones: &[Zone]) -> Classification {
    if zones.is_empty() {
        return Classification::Clear;
    }

    if let Some(z) = zones.iter().find(|z| z.contains_price(price)) {
        return Classification::Inside {
            zone_id: z.id.clone(),
            kind: z.kind,
        };
    }

    // nearest zone entirely below price, and entirely above
    let below = zones
        .iter()
        .filter(|z| z.top() < price)
        .max_by(|a, b| a.top().partial_cmp(&b.top()).unwrap());
    let above = zones
        .iter()
        .filter(|z| z.bottom() > price)
        .min_by(|a, b| a.bottom().partial_cmp(&b.bottom()).unwrap());

    match (below, above) {
        (Some(b), Some(a)) => Classification::Between {
            below_id: b.id.clone(),
            below_kind: b.kind,
            below_line: upper_line(b.kind),
            above_id: a.id.clone(),
            above_kind: a.kind,
            above_line: lower_line(a.kind),
        },
        (Some(b), None) => Classification::Above {
            zone_id: b.id.clone(),
            kind: b.kind,
            line: upper_line(b.kind),
        },
        (None, Some(a)) => Classification::Below {
            zone_id: a.id.clone(),
            kind: a.kind,
            line: lower_line(a.kind),
        },
        (None, None) => Classification::Clear,
    }
}

/// One armed flag-watching context and the candles recorded while armed.
#[derive(Debug, Clone)]
pub struct ArmedContext {
    pub flag_type: FlagType,
    pub priority_candles: Vec<Candle>,
}

#[derive(Debug, Default)]
pub struct ArmingUpdate {
    pub classification: String,
    /// Contexts that just became armed (context key, direction).
    pub armed: Vec<(String, FlagType)>,
    /// Contexts whose arming condition ended this candle.
    pub disarmed: Vec<String>,
}

/// Tracks which zone-extension contexts are currently armed and buffers
/// the candles recorded under each. Flag states are created on arming and
/// must be destroyed by the caller on disarm.
pub struct ZoneClassifier {
    contexts: HashMap<String, ArmedContext>,
    buffer_cap: usize,
}

impl ZoneClassifier {
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            buffer_cap,
        }
    }

    pub fn priority_candles(&self, context: &str) -> Option<&[Candle]> {
        self.contexts
            .get(context)
            .map(|c| c.priority_candles.as_slice())
    }

    pub fn armed_contexts(&self) -> impl Iterator<Item = (&String, &ArmedContext)> {
        self.contexts.iter()
    }

    /// Desired (context, direction) pairs for a classification. `Above`
    /// arms bull, `Below` arms bear; inside a support arms the bounce,
    /// inside a resistance the rejection, inside a PDHL both.
    fn desired(classification: &Classification) -> Vec<(String, FlagType)> {
        let label = classification.label();
        match classification {
            Classification::Above { .. } => vec![(label, FlagType::Bull)],
            Classification::Below { .. } => vec![(label, FlagType::Bear)],
            Classification::Inside { kind, .. } => match kind {
                ZoneKind::Support => vec![(label, FlagType::Bull)],
                ZoneKind::Resistance => vec![(label, FlagType::Bear)],
                ZoneKind::Pdhl => vec![
                    (format!("{} bull", label), FlagType::Bull),
                    (format!("{} bear", label), FlagType::Bear),
                ],
            },
            Classification::Between { .. } | Classification::Clear => Vec::new(),
        }
    }

    pub fn on_candle(&mut self, candle: &Candle, zones: &[Zone]) -> ArmingUpdate {
        let classification = classify(candle.close, zones);
        let desired = Self::desired(&classification);

        let mut update = ArmingUpdate {
            classification: classification.label(),
            ..Default::default()
        };

        // contexts whose arming condition ended
        let keep: Vec<String> = desired.iter().map(|(k, _)| k.clone()).collect();
        let ended: Vec<String> = self
            .contexts
            .keys()
            .filter(|k| !keep.contains(k))
            .cloned()
            .collect();
        for key in ended {
            debug!("disarmed: {}", key);
            self.contexts.remove(&key);
            update.disarmed.push(key);
        }

        for (key, flag_type) in desired {
            match self.contexts.get_mut(&key) {
                Some(ctx) => {
                    ctx.priority_candles.push(candle.clone());
                    if ctx.priority_candles.len() > self.buffer_cap {
                        ctx.priority_candles.remove(0);
                    }
                }
                None => {
                    debug!("armed: {} ({})", key, flag_type);
                    self.contexts.insert(
                        key.clone(),
                        ArmedContext {
                            flag_type,
                            priority_candles: vec![candle.clone()],
                        },
                    );
                    update.armed.push((key, flag_type));
                }
            }
        }

        update
    }

    pub fn reset(&mut self) {
        self.contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use crate::test_helpers::make_candles;

    fn zones() -> Vec<Zone> {
        vec![
            Zone::new("support_1", ZoneKind::Support, 3, 445.0, 445.4),
            Zone::new("resistance_1", ZoneKind::Resistance, 20, 450.0, 449.6),
        ]
    }

    #[test]
    fn labels_for_every_position() {
        let zs = zones();
        assert_eq!(classify(450.5, &zs).label(), "above resistance_1 PDH");
        assert_eq!(classify(444.0, &zs).label(), "below support_1 PDL");
        assert_eq!(classify(449.8, &zs).label(), "inside resistance_1");
        assert_eq!(classify(445.2, &zs).label(), "inside support_1");
        assert_eq!(
            classify(447.0, &zs).label(),
            "support_1 Buffer---resistance_1 Buffer"
        );
        assert_eq!(classify(447.0, &[]).label(), "clear");
    }

    #[test]
    fn pdhl_lines_are_both_important() {
        let zs = vec![Zone::new("PDHL_1", ZoneKind::Pdhl, 0, 450.0, 445.0)];
        assert_eq!(classify(451.0, &zs).label(), "above PDHL_1 PDH");
        assert_eq!(classify(444.0, &zs).label(), "below PDHL_1 PDL");
    }

    #[test]
    fn arming_transitions_and_buffering() {
        let zs = zones();
        let mut classifier = ZoneClassifier::new(16);
        let candles = make_candles(&[
            (450.4, 450.8, 450.3, 450.6), // above resistance -> bull armed
            (450.6, 450.9, 450.4, 450.7), // still above -> buffered
            (450.7, 450.8, 446.9, 447.0), // drops between -> disarmed
        ]);

        let u0 = classifier.on_candle(&candles[0], &zs);
        assert_eq!(u0.armed.len(), 1);
        assert_eq!(u0.armed[0].0, "above resistance_1 PDH");
        assert_eq!(u0.armed[0].1, FlagType::Bull);

        let u1 = classifier.on_candle(&candles[1], &zs);
        assert!(u1.armed.is_empty() && u1.disarmed.is_empty());
        assert_eq!(
            classifier
                .priority_candles("above resistance_1 PDH")
                .unwrap()
                .len(),
            2
        );

        let u2 = classifier.on_candle(&candles[2], &zs);
        assert_eq!(u2.disarmed, vec!["above resistance_1 PDH".to_string()]);
        assert!(classifier.priority_candles("above resistance_1 PDH").is_none());
    }

    #[test]
    fn inside_pdhl_arms_both_directions() {
        let zs = vec![Zone::new("PDHL_1", ZoneKind::Pdhl, 0, 450.0, 445.0)];
        let mut classifier = ZoneClassifier::new(16);
        let candles = make_candles(&[(447.0, 447.5, 446.5, 447.2)]);
        let update = classifier.on_candle(&candles[0], &zs);
        assert_eq!(update.armed.len(), 2);
        let types: Vec<FlagType> = update.armed.iter().map(|(_, t)| *t).collect();
        assert!(types.contains(&FlagType::Bull));
        assert!(types.contains(&FlagType::Bear));
    }

    #[test]
    fn buffer_is_bounded() {
        let zs = zones();
        let mut classifier = ZoneClassifier::new(3);
        let rows: Vec<(f64, f64, f64, f64)> =
            (0..6).map(|_| (450.4, 450.8, 450.3, 450.6)).collect();
        for c in &make_candles(&rows) {
            classifier.on_candle(c, &zs);
        }
        assert_eq!(
            classifier
                .priority_candles("above resistance_1 PDH")
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn candle_timeframe_is_preserved_in_buffer() {
        let zs = zones();
        let mut classifier = ZoneClassifier::new(4);
        let candles = make_candles(&[(450.4, 450.8, 450.3, 450.6)]);
        classifier.on_candle(&candles[0], &zs);
        let buffered = classifier.priority_candles("above resistance_1 PDH").unwrap();
        assert_eq!(buffered[0].timeframe, Timeframe::M2);
    }
}
