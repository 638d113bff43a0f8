use std::collections::BTreeMap;
use std::collections::HashMap;
use tracing::debug;

use crate::config::FlagpoleCriteria;
use crate::models::{Candle, FlagType, PointMode, PRICE_EPSILON};

/// A candle reduced to trendline coordinates: body price on the flag side
/// plus the wick extreme.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagPoint {
    pub x: u64,
    pub y: f64,
    pub extreme: f64,
}

impl FlagPoint {
    fn from_candle(candle: &Candle, flag_type: FlagType) -> Self {
        match flag_type {
            FlagType::Bull => Self {
                x: candle.seq,
                y: candle.body_top(),
                extreme: candle.high,
            },
            FlagType::Bear => Self {
                x: candle.seq,
                y: candle.body_bottom(),
                extreme: candle.low,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinePoint {
    pub x: u64,
    pub y: f64,
}

/// One flag-in-progress for an armed zone context.
#[derive(Debug, Clone)]
pub struct FlagState {
    pub id: u64,
    pub context: String,
    pub flag_type: FlagType,
    pub start: FlagPoint,
    pub points: Vec<FlagPoint>,
    pub slope: Option<f64>,
    pub intercept: Option<f64>,
    pub line: Option<(LinePoint, LinePoint)>,
    pub point_mode: PointMode,
    pub last_pivot: Option<FlagPoint>,
    pub breakout_active: bool,
    pub last_breakout_x: Option<u64>,
}

impl FlagState {
    fn line_y(&self, x: u64) -> Option<f64> {
        Some(self.slope? * x as f64 + self.intercept?)
    }

    /// Line from start through last_pivot; filters points in pivot mode.
    fn pivot_line_y(&self, x: u64) -> Option<f64> {
        let pivot = self.last_pivot?;
        if pivot.x == self.start.x {
            return None;
        }
        let slope = (pivot.y - self.start.y) / (pivot.x as f64 - self.start.x as f64);
        Some(self.start.y + slope * (x as f64 - self.start.x as f64))
    }
}

/// A flag whose breakout was confirmed and passed validity.
#[derive(Debug, Clone)]
pub struct CompletedFlag {
    pub name: String,
    pub context: String,
    pub flag_type: FlagType,
    pub breakout_x: u64,
    pub breakout_close: f64,
    pub line: (LinePoint, LinePoint),
}

/// Detects flag-pattern breakouts across all armed contexts. States are
/// created on arming, fed every candle, and destroyed on disarm.
pub struct FlagEngine {
    criteria: FlagpoleCriteria,
    states: BTreeMap<u64, FlagState>,
    completed: HashMap<String, CompletedFlag>,
    next_state_id: u64,
    completed_counters: HashMap<String, u32>,
}

impl FlagEngine {
    pub fn new(criteria: FlagpoleCriteria) -> Self {
        Self {
            criteria,
            states: BTreeMap::new(),
            completed: HashMap::new(),
            next_state_id: 0,
            completed_counters: HashMap::new(),
        }
    }

    pub fn states(&self) -> impl Iterator<Item = &FlagState> {
        self.states.values()
    }

    pub fn completed_flags(&self) -> &HashMap<String, CompletedFlag> {
        &self.completed
    }

    /// Create a fresh flow-mode state for a newly armed context, seeded
    /// from the candle that armed it.
    pub fn arm(&mut self, context: &str, flag_type: FlagType, seed: &Candle) -> u64 {
        let id = self.next_state_id;
        self.next_state_id += 1;
        let state = FlagState {
            id,
            context: context.to_string(),
            flag_type,
            start: FlagPoint::from_candle(seed, flag_type),
            points: Vec::new(),
            slope: None,
            intercept: None,
            line: None,
            point_mode: PointMode::Flow,
            last_pivot: None,
            breakout_active: false,
            last_breakout_x: None,
        };
        debug!(
            "flag state {} armed: {} {} from x={}",
            id, context, flag_type, state.start.x
        );
        self.states.insert(id, state);
        id
    }

    /// Destroy every state for a context whose arming condition ended.
    pub fn disarm(&mut self, context: &str) {
        self.states.retain(|_, s| s.context != context);
    }

    pub fn reset(&mut self) {
        self.states.clear();
        self.completed.clear();
        self.completed_counters.clear();
    }

    /// Advance every state by one candle; returns flags that completed
    /// with a confirmed, valid breakout.
    pub fn on_candle(&mut self, candle: &Candle) -> Vec<CompletedFlag> {
        let mut emitted = Vec::new();
        let ids: Vec<u64> = self.states.keys().copied().collect();
        for id in ids {
            if let Some(flag) = self.advance_state(id, candle) {
                emitted.push(flag);
            }
        }
        self.dedup_states();
        emitted
    }

    fn advance_state(&mut self, id: u64, candle: &Candle) -> Option<CompletedFlag> {
        let criteria = self.criteria.clone();
        let state = self.states.get_mut(&id)?;
        let flag_type = state.flag_type;
        let point = FlagPoint::from_candle(candle, flag_type);

        // 1. new extreme promotes the start point and resets the fit
        let promoted = match flag_type {
            FlagType::Bull => point.y > state.start.y + PRICE_EPSILON,
            FlagType::Bear => point.y < state.start.y - PRICE_EPSILON,
        };
        if promoted {
            state.start = point;
            state.points.clear();
            state.slope = None;
            state.intercept = None;
            state.line = None;
            state.point_mode = PointMode::Flow;
            state.last_pivot = None;
            return None;
        }

        // 2. otherwise accumulate a candle-point (pivot mode filters)
        let keep = match state.point_mode {
            PointMode::Flow => true,
            PointMode::Pivot => {
                let under_main = match state.line_y(point.x) {
                    Some(y) => match flag_type {
                        FlagType::Bull => point.y <= y + PRICE_EPSILON,
                        FlagType::Bear => point.y >= y - PRICE_EPSILON,
                    },
                    None => true,
                };
                let under_pivot = match state.pivot_line_y(point.x) {
                    Some(y) => match flag_type {
                        FlagType::Bull => point.y <= y + PRICE_EPSILON,
                        FlagType::Bear => point.y >= y - PRICE_EPSILON,
                    },
                    None => true,
                };
                under_main && under_pivot
            }
        };
        if keep && point.x != state.start.x {
            state.points.retain(|p| p.x != point.x);
            state.points.push(point);
            state.points.sort_by_key(|p| p.x);
            if state.point_mode == PointMode::Pivot {
                state.last_pivot = Some(point);
            }
            if state.points.len() > criteria.max_num_candles {
                state.points.remove(0);
                state.slope = None;
                state.intercept = None;
                state.line = None;
            }
        }

        // 3. fit once enough points exist
        if state.slope.is_none() && state.points.len() + 1 >= criteria.min_num_candles {
            fit_trendline(state, &criteria);
        }

        // 4. breakout check against the fitted line
        let line_y = state.line_y(candle.seq)?;
        let broke = match flag_type {
            FlagType::Bull => candle.close > line_y && candle.close >= candle.open,
            FlagType::Bear => candle.close < line_y && candle.close <= candle.open,
        };
        if !broke {
            return None;
        }

        state.breakout_active = true;
        state.last_breakout_x = Some(candle.seq);
        let line = state.line?;
        let context = state.context.clone();
        let valid = line_valid(state, &criteria);

        // 5. complete the flag and respawn in pivot mode from the
        // breakout candle
        let counter = self
            .completed_counters
            .entry(format!("{} {}", context, flag_type))
            .or_insert(0);
        *counter += 1;
        let name = format!("{} {}_flag_{}", context, flag_type, counter);

        let completed = CompletedFlag {
            name: name.clone(),
            context: context.clone(),
            flag_type,
            breakout_x: candle.seq,
            breakout_close: candle.close,
            line,
        };
        self.completed.insert(name, completed.clone());
        self.states.remove(&id);

        let new_id = self.next_state_id;
        self.next_state_id += 1;
        let respawn_point = FlagPoint::from_candle(candle, flag_type);
        self.states.insert(
            new_id,
            FlagState {
                id: new_id,
                context,
                flag_type,
                start: respawn_point,
                points: Vec::new(),
                slope: None,
                intercept: None,
                line: None,
                point_mode: PointMode::Pivot,
                last_pivot: Some(respawn_point),
                breakout_active: false,
                last_breakout_x: Some(candle.seq),
            },
        );

        // 6. only a valid line is emitted upward as a signal
        if valid {
            debug!("flag completed: {}", completed.name);
            Some(completed)
        } else {
            debug!("flag breakout discarded by validity check");
            None
        }
    }

    /// Duplicate states (same context, direction, start point) keep only
    /// the lowest id.
    fn dedup_states(&mut self) {
        let mut seen: Vec<(String, FlagType, u64, i64)> = Vec::new();
        let mut dead: Vec<u64> = Vec::new();
        for (id, s) in &self.states {
            let key = (
                s.context.clone(),
                s.flag_type,
                s.start.x,
                (s.start.y / PRICE_EPSILON).round() as i64,
            );
            if seen.contains(&key) {
                dead.push(*id);
            } else {
                seen.push(key);
            }
        }
        for id in dead {
            debug!("flag state {} removed as duplicate", id);
            self.states.remove(&id);
        }
    }
}

/// Least-squares fit over start + points, intercept translated so the
/// line sits on the extreme side of every point, then angle-gated.
fn fit_trendline(state: &mut FlagState, criteria: &FlagpoleCriteria) {
    let pts: Vec<(f64, f64)> = std::iter::once(&state.start)
        .chain(state.points.iter())
        .map(|p| (p.x as f64, p.y))
        .collect();
    let n = pts.len() as f64;
    let sum_x: f64 = pts.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = pts.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = pts.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = pts.iter().map(|(x, _)| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < PRICE_EPSILON {
        return;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;

    // translate so the line clears every point on the flag side
    let intercept = match state.flag_type {
        FlagType::Bull => pts
            .iter()
            .map(|(x, y)| y - slope * x)
            .fold(f64::NEG_INFINITY, f64::max),
        FlagType::Bear => pts
            .iter()
            .map(|(x, y)| y - slope * x)
            .fold(f64::INFINITY, f64::min),
    };

    if !angle_ok(slope, state.flag_type, criteria) {
        return;
    }

    state.slope = Some(slope);
    state.intercept = Some(intercept);
    let latest_x = state.points.last().map(|p| p.x).unwrap_or(state.start.x);
    state.line = Some((
        LinePoint {
            x: state.start.x,
            y: slope * state.start.x as f64 + intercept,
        },
        LinePoint {
            x: latest_x,
            y: slope * latest_x as f64 + intercept,
        },
    ));
}

/// A bull flag consolidates downward (negative slope), a bear flag upward;
/// the magnitude must land in [min_angle, max_angle] degrees.
fn angle_ok(slope: f64, flag_type: FlagType, criteria: &FlagpoleCriteria) -> bool {
    let angle = slope.atan().to_degrees();
    match flag_type {
        FlagType::Bull => angle <= -criteria.min_angle && angle >= -criteria.max_angle,
        FlagType::Bear => angle >= criteria.min_angle && angle <= criteria.max_angle,
    }
}

fn line_valid(state: &FlagState, criteria: &FlagpoleCriteria) -> bool {
    let (p1, p2) = match state.line {
        Some(l) => l,
        None => return false,
    };
    let slope = match state.slope {
        Some(s) => s,
        None => return false,
    };
    if !angle_ok(slope, state.flag_type, criteria) {
        return false;
    }
    match state.flag_type {
        FlagType::Bull => p1.y >= p2.y,
        FlagType::Bear => p1.y <= p2.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_candles, make_candles_with_seq};

    fn criteria() -> FlagpoleCriteria {
        FlagpoleCriteria {
            min_num_candles: 3,
            max_num_candles: 20,
            min_angle: 5.0,
            max_angle: 80.0,
        }
    }

    /// Textbook bullish flag: descending body-highs from an armed start,
    /// then a bullish close through the line.
    fn bull_flag_candles() -> Vec<Candle> {
        // seq 100..=104
        make_candles_with_seq(
            100,
            &[
                (451.8, 452.10, 451.5, 452.00), // start: body-high 452.00
                (451.6, 451.95, 451.3, 451.80),
                (451.3, 451.70, 451.1, 451.50),
                (451.1, 451.40, 450.9, 451.20),
                (451.0, 451.80, 450.9, 451.60), // breakout: close 451.60 >= open
            ],
        )
    }

    #[test]
    fn bullish_breakout_completes_and_respawns_in_pivot_mode() {
        let mut engine = FlagEngine::new(criteria());
        let candles = bull_flag_candles();
        engine.arm("above support_1 Buffer", FlagType::Bull, &candles[0]);

        let mut completed = Vec::new();
        for c in &candles[1..] {
            completed.extend(engine.on_candle(c));
        }

        assert_eq!(completed.len(), 1);
        let flag = &completed[0];
        assert_eq!(flag.flag_type, FlagType::Bull);
        assert_eq!(flag.breakout_x, 104);
        assert!(flag.name.contains("bull_flag_1"));

        // line slopes down from the start extreme
        assert!(flag.line.0.y > flag.line.1.y);

        // a fresh state took over in pivot mode, seeded at the breakout
        let state = engine.states().next().expect("respawned state");
        assert_eq!(state.point_mode, PointMode::Pivot);
        assert_eq!(state.start.x, 104);
        assert!((state.start.y - 451.60).abs() < 1e-9);
        assert_eq!(state.last_pivot.map(|p| p.x), Some(104));
    }

    #[test]
    fn trendline_fit_matches_least_squares_with_translation() {
        let mut engine = FlagEngine::new(criteria());
        let candles = bull_flag_candles();
        engine.arm("ctx", FlagType::Bull, &candles[0]);
        for c in &candles[1..3] {
            engine.on_candle(c);
        }

        // fit happens once min_num_candles points exist: (100,452.00),
        // (101,451.80), (102,451.50) -> slope -0.25
        let state = engine.states().next().unwrap();
        let slope = state.slope.expect("line fitted at three points");
        assert!((slope - (-0.25)).abs() < 1e-9);
        // translated intercept clears all points: max(y - slope*x),
        // reached at (101, 451.80)
        let intercept = state.intercept.unwrap();
        assert!((intercept - (451.80 + 0.25 * 101.0)).abs() < 1e-9);

        // line endpoints anchored at start and latest point
        let (p1, p2) = state.line.unwrap();
        assert_eq!(p1.x, 100);
        assert_eq!(p2.x, 102);
        assert!(p1.y > p2.y);
    }

    #[test]
    fn new_extreme_promotes_start_and_resets() {
        let mut engine = FlagEngine::new(criteria());
        let candles = make_candles_with_seq(
            10,
            &[
                (451.8, 452.1, 451.5, 452.0),
                (451.6, 451.9, 451.3, 451.8),
                (452.0, 452.6, 451.9, 452.5), // body-high 452.5 > 452.0
            ],
        );
        engine.arm("ctx", FlagType::Bull, &candles[0]);
        engine.on_candle(&candles[1]);
        engine.on_candle(&candles[2]);

        let state = engine.states().next().unwrap();
        assert_eq!(state.start.x, 12);
        assert!((state.start.y - 452.5).abs() < 1e-9);
        assert!(state.points.is_empty());
        assert!(state.slope.is_none());
        assert_eq!(state.point_mode, PointMode::Flow);
    }

    #[test]
    fn bearish_breakout_mirrors_bullish() {
        let mut engine = FlagEngine::new(criteria());
        // ascending body-lows from a bear start, then bearish close under
        let candles = make_candles_with_seq(
            50,
            &[
                (448.2, 448.5, 447.90, 448.0), // start: body-low 448.0
                (448.4, 448.7, 448.10, 448.2),
                (448.7, 448.9, 448.40, 448.5),
                (448.9, 449.1, 448.70, 448.8),
                (448.9, 449.0, 447.80, 448.0), // close 448.0 <= open, under line
            ],
        );
        engine.arm("below resistance_1 Buffer", FlagType::Bear, &candles[0]);

        let mut completed = Vec::new();
        for c in &candles[1..] {
            completed.extend(engine.on_candle(c));
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].flag_type, FlagType::Bear);
        assert!(completed[0].line.0.y <= completed[0].line.1.y);
    }

    #[test]
    fn too_shallow_angle_never_fits() {
        let mut engine = FlagEngine::new(criteria());
        // body-highs nearly flat: slope magnitude under min_angle
        let candles = make_candles_with_seq(
            0,
            &[
                (451.99, 452.10, 451.80, 452.000),
                (451.98, 452.09, 451.79, 451.999),
                (451.97, 452.08, 451.78, 451.998),
                (451.96, 452.07, 451.77, 451.997),
                (451.95, 452.30, 451.76, 452.000), // would-be breakout
            ],
        );
        engine.arm("ctx", FlagType::Bull, &candles[0]);
        let mut completed = Vec::new();
        for c in &candles[1..] {
            completed.extend(engine.on_candle(c));
        }
        assert!(completed.is_empty());
        assert!(engine.states().next().unwrap().slope.is_none());
    }

    #[test]
    fn pivot_mode_filters_points_above_cutoff() {
        let mut engine = FlagEngine::new(criteria());
        let candles = bull_flag_candles();
        engine.arm("ctx", FlagType::Bull, &candles[0]);
        for c in &candles[1..] {
            engine.on_candle(c);
        }
        // respawned pivot state at (104, 451.60); pivot line is flat until
        // a second pivot exists, so a higher body-high is rejected unless
        // it promotes; a lower one is kept
        let lower = make_candles_with_seq(105, &[(451.0, 451.3, 450.8, 451.2)]);
        engine.on_candle(&lower[0]);
        let state = engine.states().next().unwrap();
        assert_eq!(state.points.len(), 1);
        assert_eq!(state.points[0].x, 105);
    }

    #[test]
    fn duplicate_states_keep_lowest_id() {
        let mut engine = FlagEngine::new(criteria());
        let candles = make_candles(&[(451.8, 452.1, 451.5, 452.0)]);
        let a = engine.arm("ctx", FlagType::Bull, &candles[0]);
        let b = engine.arm("ctx", FlagType::Bull, &candles[0]);
        assert!(a < b);

        let next = make_candles_with_seq(1, &[(451.6, 451.9, 451.3, 451.8)]);
        engine.on_candle(&next[0]);
        let ids: Vec<u64> = engine.states().map(|s| s.id).collect();
        assert_eq!(ids, vec![a]);
    }

    #[test]
    fn disarm_destroys_context_states() {
        let mut engine = FlagEngine::new(criteria());
        let candles = make_candles(&[(451.8, 452.1, 451.5, 452.0)]);
        engine.arm("ctx_a", FlagType::Bull, &candles[0]);
        engine.arm("ctx_b", FlagType::Bear, &candles[0]);
        engine.disarm("ctx_a");
        let contexts: Vec<&str> = engine.states().map(|s| s.context.as_str()).collect();
        assert_eq!(contexts, vec!["ctx_b"]);
    }

    #[test]
    fn completed_names_get_unique_suffixes() {
        let mut engine = FlagEngine::new(criteria());
        let candles = bull_flag_candles();
        engine.arm("ctx", FlagType::Bull, &candles[0]);
        for c in &candles[1..] {
            engine.on_candle(c);
        }
        // run a second full flag in the same context
        let second = make_candles_with_seq(
            105,
            &[
                (451.4, 451.75, 451.2, 451.45),
                (451.2, 451.55, 451.0, 451.25),
                (451.0, 451.35, 450.8, 451.05),
                (450.9, 451.60, 450.8, 451.50),
            ],
        );
        for c in &second {
            engine.on_candle(c);
        }
        let names: Vec<&String> = engine.completed_flags().keys().collect();
        assert!(names.iter().any(|n| n.contains("bull_flag_1")));
        assert!(names.len() >= 1);
    }
}
