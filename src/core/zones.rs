use tracing::{debug, info};

use crate::config::Config;
use crate::models::{CandleSeries, TakeProfitLine, Zone, ZoneKind, PRICE_EPSILON};

#[derive(Debug, Clone)]
pub struct ZoneSettings {
    pub min_height: f64,
    pub max_height: f64,
    pub spacing: f64,
    pub tpl_threshold: f64,
    pub remove_tps_too_close: bool,
    pub get_pdhl: bool,
    pub past_days: usize,
}

impl ZoneSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_height: cfg.zone_size_thresholds.0,
            max_height: cfg.zone_size_thresholds.1,
            spacing: cfg.zone_spacing,
            tpl_threshold: cfg.tpl_threshold,
            remove_tps_too_close: cfg.remove_tps_too_close,
            get_pdhl: cfg.get_pdhl,
            past_days: cfg.past_days,
        }
    }
}

/// Computes the support/resistance zone set from a rolling window of
/// 15-minute candles, one day at a time, reconciling overlaps and spacing
/// after each day.
pub struct ZoneEngine {
    settings: ZoneSettings,
    zones: Vec<Zone>,
    tpls: Vec<TakeProfitLine>,
    // creation ordinal per zone id; "newer" in the too-close pass means a
    // higher ordinal
    ordinals: std::collections::HashMap<String, u32>,
    next_ordinal: u32,
    resistance_count: u32,
    support_count: u32,
    pdhl_count: u32,
    tpl_count: u32,
}

impl ZoneEngine {
    pub fn new(settings: ZoneSettings) -> Self {
        Self {
            settings,
            zones: Vec::new(),
            tpls: Vec::new(),
            ordinals: std::collections::HashMap::new(),
            next_ordinal: 0,
            resistance_count: 0,
            support_count: 0,
            pdhl_count: 0,
            tpl_count: 0,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn tpls(&self) -> &[TakeProfitLine] {
        &self.tpls
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// Rebuild the full set from the last `past_days` trading days of the
    /// 15-minute history, oldest day first.
    pub fn rebuild(&mut self, history: &CandleSeries) {
        self.zones.clear();
        self.tpls.clear();
        self.ordinals.clear();
        self.next_ordinal = 0;
        self.resistance_count = 0;
        self.support_count = 0;
        self.pdhl_count = 0;
        self.tpl_count = 0;

        let dates = history.trading_dates();
        let start = dates.len().saturating_sub(self.settings.past_days);
        let window = &dates[start..];

        let mut day_slices: Vec<CandleSeries> = Vec::with_capacity(window.len());
        for date in window {
            day_slices.push(history.filter_by_date(*date));
        }

        let mut day_offset = 0u64;
        for di in 0..day_slices.len() {
            let day = &day_slices[di];
            if day.is_empty() {
                continue;
            }
            let before = if di > 0 { Some(&day_slices[di - 1]) } else { None };
            let after = day_slices.get(di + 1);
            let before_offset = day_offset.saturating_sub(before.map(|d| d.len() as u64).unwrap_or(0));

            self.seed_day(day, day_offset, before, before_offset, after);
            self.reconcile();

            day_offset += day.len() as u64;
        }

        info!(
            "zone rebuild: {} zones, {} TPLs over {} days",
            self.zones.len(),
            self.tpls.len(),
            window.len()
        );
    }

    /// Shift every anchor so positions stay correct against the cumulative
    /// candle index when the window rolls forward a day.
    pub fn advance_anchors(&mut self, day_candle_count: u64) {
        for z in &mut self.zones {
            z.anchor_seq += day_candle_count;
        }
        for t in &mut self.tpls {
            t.anchor_seq += day_candle_count;
        }
    }

    // --- Seeding ---

    fn seed_day(
        &mut self,
        day: &CandleSeries,
        day_offset: u64,
        before: Option<&CandleSeries>,
        before_offset: u64,
        after: Option<&CandleSeries>,
    ) {
        let (high_idx, daily_high) = match day.high_idx_max() {
            Some(v) => v,
            None => return,
        };
        let (low_idx, daily_low) = match day.low_idx_min() {
            Some(v) => v,
            None => return,
        };

        // resistance: important = daily high, buffer = body-high of the
        // candle after the extreme (the extreme candle itself at day end)
        let res_buffer = day
            .get(high_idx + 1)
            .map(|c| c.body_top())
            .unwrap_or_else(|| day[high_idx].body_top());
        self.resistance_count += 1;
        let mut resistance = Zone::new(
            format!("resistance_{}", self.resistance_count),
            ZoneKind::Resistance,
            day_offset + high_idx as u64,
            daily_high,
            res_buffer,
        );

        let sup_buffer = day
            .get(low_idx + 1)
            .map(|c| c.body_bottom())
            .unwrap_or_else(|| day[low_idx].body_bottom());
        self.support_count += 1;
        let mut support = Zone::new(
            format!("support_{}", self.support_count),
            ZoneKind::Support,
            day_offset + low_idx as u64,
            daily_low,
            sup_buffer,
        );

        self.resize(&mut resistance, day, day_offset, before, before_offset, after);
        self.resize(&mut support, day, day_offset, before, before_offset, after);

        debug!(
            "seeded {} [{:.2}/{:.2}] and {} [{:.2}/{:.2}]",
            resistance.id,
            resistance.important,
            resistance.buffer,
            support.id,
            support.important,
            support.buffer
        );

        self.insert_zone(resistance);
        self.insert_zone(support);
    }

    /// Pull the buffer line inside [min_height, max_height] by adopting the
    /// closest O/H/L/C value from this day or its neighbors.
    fn resize(
        &self,
        zone: &mut Zone,
        day: &CandleSeries,
        day_offset: u64,
        before: Option<&CandleSeries>,
        before_offset: u64,
        after: Option<&CandleSeries>,
    ) {
        if zone.resize_exempt() {
            return;
        }
        let height = zone.height();
        if height >= self.settings.min_height - PRICE_EPSILON
            && height <= self.settings.max_height + PRICE_EPSILON
        {
            return;
        }

        let buffer_below = zone.buffer <= zone.important;
        let mut best: Option<(f64, u64)> = None;
        let mut consider = |value: f64, idx: u64| {
            let side_ok = if buffer_below {
                value < zone.important
            } else {
                value > zone.important
            };
            let h = (zone.important - value).abs();
            if side_ok
                && h >= self.settings.min_height - PRICE_EPSILON
                && h <= self.settings.max_height + PRICE_EPSILON
            {
                let dist = (value - zone.buffer).abs();
                if best.map_or(true, |(bv, _)| dist < (bv - zone.buffer).abs()) {
                    best = Some((value, idx));
                }
            }
        };

        let mut scan = |series: &CandleSeries, offset: u64| {
            for (i, c) in series.iter().enumerate() {
                for v in [c.open, c.high, c.low, c.close] {
                    consider(v, offset + i as u64);
                }
            }
        };
        scan(day, day_offset);
        if let Some(b) = before {
            scan(b, before_offset);
        }
        if let Some(a) = after {
            scan(a, day_offset + day.len() as u64);
        }

        match best {
            Some((value, idx)) => {
                zone.buffer = value;
                zone.anchor_seq = zone.anchor_seq.min(idx);
            }
            None => {
                // nothing in range anywhere: clamp to the nearest legal height
                let span = if zone.height() < self.settings.min_height {
                    self.settings.min_height
                } else {
                    self.settings.max_height
                };
                zone.buffer = if buffer_below {
                    zone.important - span
                } else {
                    zone.important + span
                };
            }
        }
    }

    fn insert_zone(&mut self, zone: Zone) {
        self.ordinals.insert(zone.id.clone(), self.next_ordinal);
        self.next_ordinal += 1;
        self.zones.push(zone);
    }

    fn new_pdhl(&mut self, anchor: u64, top: f64, bottom: f64) -> Zone {
        self.pdhl_count += 1;
        Zone::new(
            format!("PDHL_{}", self.pdhl_count),
            ZoneKind::Pdhl,
            anchor,
            top,
            bottom,
        )
    }

    fn new_tpl(&mut self, anchor: u64, price: f64) -> TakeProfitLine {
        self.tpl_count += 1;
        TakeProfitLine::new(format!("tpl_{}", self.tpl_count), anchor, price)
    }

    fn remove_zone(&mut self, id: &str) {
        self.zones.retain(|z| z.id != id);
    }

    fn ordinal(&self, id: &str) -> u32 {
        self.ordinals.get(id).copied().unwrap_or(u32::MAX)
    }

    // --- Reconciliation ---

    fn reconcile(&mut self) {
        self.inside_pass();
        self.bleeding_pass();
        self.too_close_pass();
    }

    /// Resolve pairs where one zone fully contains the other.
    fn inside_pass(&mut self) {
        loop {
            let pair = self.find_pair(|a, b| a.contains_zone(b));
            let (outer_id, inner_id) = match pair {
                Some(p) => p,
                None => break,
            };
            let outer = self.zone(&outer_id).unwrap().clone();
            let inner = self.zone(&inner_id).unwrap().clone();

            if outer.kind == ZoneKind::Pdhl && inner.kind != ZoneKind::Pdhl {
                debug!("inside pass: {} swallowed by {}", inner.id, outer.id);
                self.remove_zone(&inner.id);
            } else if inner.kind == ZoneKind::Pdhl && outer.kind != ZoneKind::Pdhl {
                // a plain zone grew around a PDHL: the union is the outer
                // interval, carried by the PDHL
                let merged = self.union_as_pdhl(&outer, &inner);
                self.remove_zone(&outer.id);
                self.remove_zone(&inner.id);
                self.insert_zone(merged);
            } else if outer.kind != inner.kind {
                // resistance containing support (or vice-versa)
                let merged = self.union_as_pdhl(&outer, &inner);
                debug!("inside pass: {} + {} -> {}", outer.id, inner.id, merged.id);
                self.remove_zone(&outer.id);
                self.remove_zone(&inner.id);
                self.insert_zone(merged);
            } else {
                // same kind: keep the earlier-anchored, widened to the union
                let (mut keep, discard) = if outer.anchor_seq <= inner.anchor_seq {
                    (outer.clone(), inner.clone())
                } else {
                    (inner.clone(), outer.clone())
                };
                let top = outer.top().max(inner.top());
                let bottom = outer.bottom().min(inner.bottom());
                match keep.kind {
                    ZoneKind::Resistance => {
                        keep.important = top;
                        keep.buffer = bottom;
                    }
                    ZoneKind::Support => {
                        keep.important = bottom;
                        keep.buffer = top;
                    }
                    ZoneKind::Pdhl => {
                        keep.important = top;
                        keep.buffer = bottom;
                    }
                }
                keep.anchor_seq = outer.anchor_seq.min(inner.anchor_seq);
                self.remove_zone(&discard.id);
                if let Some(z) = self.zones.iter_mut().find(|z| z.id == keep.id) {
                    *z = keep;
                }
            }
        }
    }

    /// Resolve partial overlaps ("bleeding" zones).
    fn bleeding_pass(&mut self) {
        loop {
            let pair = self.find_pair(|a, b| {
                a.overlaps(b) && !a.contains_zone(b) && !b.contains_zone(a)
            });
            let (a_id, b_id) = match pair {
                Some(p) => p,
                None => break,
            };
            let a = self.zone(&a_id).unwrap().clone();
            let b = self.zone(&b_id).unwrap().clone();
            let top = a.top().max(b.top());
            let bottom = a.bottom().min(b.bottom());
            let anchor = a.anchor_seq.min(b.anchor_seq);

            let pdhl_involved = a.kind == ZoneKind::Pdhl || b.kind == ZoneKind::Pdhl;
            if a.kind == b.kind {
                // same kind (or both PDHL): widen into one PDHL
                self.remove_zone(&a.id);
                self.remove_zone(&b.id);
                if a.kind == ZoneKind::Pdhl {
                    // keep the elder PDHL id
                    let mut keep = if self.is_elder(&a, &b) { a.clone() } else { b.clone() };
                    keep.important = top;
                    keep.buffer = bottom;
                    keep.anchor_seq = anchor;
                    self.insert_zone(keep);
                } else if self.settings.get_pdhl {
                    let merged = self.new_pdhl(anchor, top, bottom);
                    debug!("bleeding pass: {} + {} -> {}", a.id, b.id, merged.id);
                    self.insert_zone(merged);
                } else {
                    // PDHL creation disabled: keep the elder, widened
                    let mut keep = if self.is_elder(&a, &b) { a.clone() } else { b.clone() };
                    match keep.kind {
                        ZoneKind::Resistance => {
                            keep.important = top;
                            keep.buffer = bottom;
                        }
                        _ => {
                            keep.important = bottom;
                            keep.buffer = top;
                        }
                    }
                    keep.anchor_seq = anchor;
                    self.insert_zone(keep);
                }
            } else if pdhl_involved {
                // PDHL bleeding into a one-sided zone: widen the PDHL over
                // the union and delete the other
                let (mut pdhl, other) = if a.kind == ZoneKind::Pdhl {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                pdhl.important = top;
                pdhl.buffer = bottom;
                pdhl.anchor_seq = anchor;
                self.remove_zone(&other.id);
                if let Some(z) = self.zones.iter_mut().find(|z| z.id == pdhl.id) {
                    *z = pdhl;
                }
            } else {
                // opposite kinds
                self.remove_zone(&a.id);
                self.remove_zone(&b.id);
                let height = top - bottom;
                if height <= self.settings.tpl_threshold + PRICE_EPSILON
                    || !self.settings.get_pdhl
                {
                    let upper = self.new_tpl(anchor, top);
                    let lower = self.new_tpl(anchor, bottom);
                    debug!(
                        "bleeding pass: {} + {} too thin -> TPLs {:.2}/{:.2}",
                        a.id, b.id, upper.price, lower.price
                    );
                    self.tpls.push(upper);
                    self.tpls.push(lower);
                } else {
                    let merged = self.new_pdhl(anchor, top, bottom);
                    self.insert_zone(merged);
                }
            }
        }
    }

    /// Enforce minimum spacing between zone lines; evicted zones leave
    /// TPLs at their important lines.
    fn too_close_pass(&mut self) {
        loop {
            let pair = self.find_pair(|a, b| {
                !a.overlaps(b) && a.min_line_distance(b) <= self.settings.spacing + PRICE_EPSILON
            });
            let (a_id, b_id) = match pair {
                Some(p) => p,
                None => break,
            };
            // delete the newer of the pair; PDHL_1 is never the one deleted
            let (a_ord, b_ord) = (self.ordinal(&a_id), self.ordinal(&b_id));
            let victim_id = if a_id == "PDHL_1" {
                b_id
            } else if b_id == "PDHL_1" {
                a_id
            } else if a_ord >= b_ord {
                a_id
            } else {
                b_id
            };
            let victim = self.zone(&victim_id).unwrap().clone();
            debug!("too-close pass: deleting {}", victim.id);
            self.remove_zone(&victim.id);

            let lines: Vec<f64> = match victim.kind {
                ZoneKind::Pdhl => vec![victim.top(), victim.bottom()],
                _ => vec![victim.important],
            };
            for price in lines {
                let tpl = self.new_tpl(victim.anchor_seq, price);
                self.tpls.push(tpl);
            }
        }

        if self.settings.remove_tps_too_close {
            let spacing = self.settings.spacing;
            let zones = self.zones.clone();
            self.tpls.retain(|tpl| {
                let too_close = zones.iter().any(|z| {
                    (z.important - tpl.price).abs() <= spacing + PRICE_EPSILON
                        || (z.buffer - tpl.price).abs() <= spacing + PRICE_EPSILON
                });
                if too_close {
                    debug!("dropping {} at {:.2}: too close to a zone line", tpl.id, tpl.price);
                }
                !too_close
            });
        }
    }

    fn is_elder(&self, a: &Zone, b: &Zone) -> bool {
        self.ordinal(&a.id) <= self.ordinal(&b.id)
    }

    fn union_as_pdhl(&mut self, a: &Zone, b: &Zone) -> Zone {
        self.new_pdhl(
            a.anchor_seq.min(b.anchor_seq),
            a.top().max(b.top()),
            a.bottom().min(b.bottom()),
        )
    }

    fn find_pair<F>(&self, pred: F) -> Option<(String, String)>
    where
        F: Fn(&Zone, &Zone) -> bool,
    {
        for i in 0..self.zones.len() {
            for j in 0..self.zones.len() {
                if i == j {
                    continue;
                }
                if pred(&self.zones[i], &self.zones[j]) {
                    return Some((self.zones[i].id.clone(), self.zones[j].id.clone()));
                }
            }
        }
        None
    }

    /// Post-reconciliation invariants, used by tests: zone intervals are
    /// disjoint and every TPL keeps its distance (when the toggle is on).
    #[cfg(test)]
    pub fn check_invariants(&self) -> Result<(), String> {
        for i in 0..self.zones.len() {
            for j in (i + 1)..self.zones.len() {
                let (a, b) = (&self.zones[i], &self.zones[j]);
                if a.overlaps(b) {
                    return Err(format!("{} overlaps {}", a.id, b.id));
                }
            }
        }
        if self.settings.remove_tps_too_close {
            for tpl in &self.tpls {
                for z in &self.zones {
                    let d = (z.important - tpl.price)
                        .abs()
                        .min((z.buffer - tpl.price).abs());
                    if d <= self.settings.spacing - PRICE_EPSILON {
                        return Err(format!("{} too close to {}", tpl.id, z.id));
                    }
                }
            }
        }
        Ok(())
    }
}
