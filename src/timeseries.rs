// =============================================================================
// Time-Series Store — bounded per-symbol history for percentile/rolling stats
// =============================================================================
//
// One append-only ring per symbol, ordered by timestamp ascending, bounded by
// a configurable lookback. The detector is the sole reader per cycle; the
// fetcher->append path is the sole writer. A per-symbol `parking_lot::RwLock`
// serializes `append`/`evict` against queries for that symbol, matching the
// teacher's preference for `parking_lot` over `std::sync`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::MarketObservation;

/// Population mean/stddev plus 10th/90th percentile of open-interest value
/// over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OiStats {
    pub mean: f64,
    pub stddev: f64,
    pub p10: f64,
    pub p90: f64,
}

struct SymbolRing {
    observations: Vec<MarketObservation>,
}

impl SymbolRing {
    fn new() -> Self {
        Self {
            observations: Vec::new(),
        }
    }

    /// Appends are expected to be non-decreasing in timestamp within a
    /// cycle; out-of-order inserts are placed at their sorted position so the
    /// ring stays ordered regardless.
    fn append(&mut self, obs: MarketObservation) {
        match self
            .observations
            .binary_search_by_key(&obs.timestamp, |o| o.timestamp)
        {
            Ok(idx) => self.observations[idx] = obs,
            Err(idx) => self.observations.insert(idx, obs),
        }
    }

    fn evict(&mut self, cutoff: i64) {
        let first_kept = self
            .observations
            .partition_point(|o| o.timestamp < cutoff);
        if first_kept > 0 {
            self.observations.drain(0..first_kept);
        }
    }

    /// First entry whose timestamp is within `tolerance_ms` of `target`,
    /// preferring the closest match.
    fn nearest(&self, target: i64, tolerance_ms: i64) -> Option<&MarketObservation> {
        self.observations
            .iter()
            .filter(|o| (o.timestamp - target).abs() <= tolerance_ms)
            .min_by_key(|o| (o.timestamp - target).abs())
    }

    fn within_last(&self, now: i64, window_ms: i64) -> Vec<&MarketObservation> {
        let cutoff = now - window_ms;
        self.observations
            .iter()
            .filter(|o| o.timestamp >= cutoff)
            .collect()
    }
}

/// Bounded per-symbol history supporting percentile, rolling statistics, and
/// windowed deltas — the sole owner of the observation rings.
pub struct TimeSeriesStore {
    lookback_ms: i64,
    min_history_ms: i64,
    point_in_past_tolerance_ms: i64,
    rings: RwLock<HashMap<String, RwLock<SymbolRing>>>,
}

const DAY_MS: i64 = 24 * 3600 * 1000;

impl TimeSeriesStore {
    pub fn new(lookback_days: i64, min_history_days: i64, point_in_past_tolerance_ms: i64) -> Self {
        Self {
            lookback_ms: lookback_days * DAY_MS,
            min_history_ms: min_history_days * DAY_MS,
            point_in_past_tolerance_ms,
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn append(&self, symbol: &str, obs: MarketObservation) {
        let needs_insert = !self.rings.read().contains_key(symbol);
        if needs_insert {
            self.rings
                .write()
                .entry(symbol.to_string())
                .or_insert_with(|| RwLock::new(SymbolRing::new()));
        }
        let rings = self.rings.read();
        rings.get(symbol).unwrap().write().append(obs);
    }

    /// Drops entries older than `now - lookback`; symbols left empty are
    /// removed entirely.
    pub fn evict(&self, now: i64) {
        let cutoff = now - self.lookback_ms;
        let mut rings = self.rings.write();
        rings.retain(|_, ring| {
            ring.write().evict(cutoff);
            !ring.read().observations.is_empty()
        });
    }

    /// True iff the ring has at least one entry older than `now - 7 days`
    /// (the configured minimum-history window).
    pub fn has_minimum_history(&self, symbol: &str, now: i64) -> bool {
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return false;
        };
        let cutoff = now - self.min_history_ms;
        ring.read().observations.iter().any(|o| o.timestamp < cutoff)
    }

    /// Rank of `value` among the stored `funding_rate` sequence, 0-100 using
    /// a simple `<=` rank/count definition. Defined only once
    /// [`Self::has_minimum_history`] holds; otherwise `50.0` (neutral).
    pub fn percentile_of_funding(&self, symbol: &str, value: f64, now: i64) -> f64 {
        if !self.has_minimum_history(symbol, now) {
            return 50.0;
        }
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return 50.0;
        };
        let ring = ring.read();
        let total = ring.observations.len();
        if total == 0 {
            return 50.0;
        }
        let at_or_below = ring
            .observations
            .iter()
            .filter(|o| o.funding_rate <= value)
            .count();
        (at_or_below as f64 / total as f64) * 100.0
    }

    /// Population mean/stddev/p10/p90 of open-interest value over the subset
    /// within the last `window_ms`. An empty window returns all zeros.
    pub fn oi_stats(&self, symbol: &str, now: i64, window_ms: i64) -> OiStats {
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return OiStats::default();
        };
        let ring = ring.read();
        let mut values: Vec<f64> = ring
            .within_last(now, window_ms)
            .iter()
            .map(|o| o.open_interest_value)
            .collect();
        if values.is_empty() {
            return OiStats::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p10 = percentile_of_sorted(&values, 10.0);
        let p90 = percentile_of_sorted(&values, 90.0);

        OiStats {
            mean,
            stddev,
            p10,
            p90,
        }
    }

    /// `(current - past) / past * 100` where `past` is the entry closest to
    /// `now - window_ms` within a +-10 minute tolerance; 0 when unresolvable.
    pub fn oi_change(&self, symbol: &str, now: i64, window_ms: i64) -> f64 {
        self.windowed_pct_change(symbol, now, window_ms, |o| o.open_interest_value)
    }

    /// Same definition as [`Self::oi_change`], against `price`.
    pub fn price_change(&self, symbol: &str, now: i64, window_ms: i64) -> f64 {
        self.windowed_pct_change(symbol, now, window_ms, |o| o.price)
    }

    fn windowed_pct_change(
        &self,
        symbol: &str,
        now: i64,
        window_ms: i64,
        field: impl Fn(&MarketObservation) -> f64,
    ) -> f64 {
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return 0.0;
        };
        let ring = ring.read();
        let Some(current) = ring.observations.last() else {
            return 0.0;
        };
        let target = now - window_ms;
        let Some(past) = ring.nearest(target, self.point_in_past_tolerance_ms) else {
            return 0.0;
        };
        let past_val = field(past);
        if past_val == 0.0 {
            return 0.0;
        }
        (field(current) - past_val) / past_val * 100.0
    }

    /// `last.cvd - first.cvd` over the subset within the last `window_ms`;
    /// `0.0` with fewer than two entries in that window.
    pub fn vdelta(&self, symbol: &str, now: i64, window_ms: i64) -> f64 {
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return 0.0;
        };
        let ring = ring.read();
        let subset = ring.within_last(now, window_ms);
        if subset.len() < 2 {
            return 0.0;
        }
        let first = subset.first().unwrap();
        let last = subset.last().unwrap();
        last.cvd - first.cvd
    }

    /// Difference between the most recent and the earliest of the last six
    /// entries.
    pub fn funding_momentum(&self, symbol: &str) -> f64 {
        let rings = self.rings.read();
        let Some(ring) = rings.get(symbol) else {
            return 0.0;
        };
        let ring = ring.read();
        let len = ring.observations.len();
        if len < 2 {
            return 0.0;
        }
        let window = &ring.observations[len.saturating_sub(6)..];
        let earliest = window.first().unwrap().funding_rate;
        let latest = window.last().unwrap().funding_rate;
        latest - earliest
    }

    /// The most recently appended observation for `symbol`, if any.
    pub fn last(&self, symbol: &str) -> Option<MarketObservation> {
        let rings = self.rings.read();
        rings.get(symbol).and_then(|r| r.read().observations.last().copied())
    }

    /// The oldest observation retained for `symbol`, if any.
    pub fn first(&self, symbol: &str) -> Option<MarketObservation> {
        let rings = self.rings.read();
        rings
            .get(symbol)
            .and_then(|r| r.read().observations.first().copied())
    }

    pub fn len(&self, symbol: &str) -> usize {
        let rings = self.rings.read();
        rings.get(symbol).map(|r| r.read().observations.len()).unwrap_or(0)
    }
}

/// Nearest-rank percentile of an already-sorted slice.
fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
