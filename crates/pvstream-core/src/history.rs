//! Time-series history cache.
//!
//! Every variable owns a rolling buffer of numeric samples. When a buffer
//! grows past its raw-point bound it is compacted in place to half that bound
//! by bin-averaging, so memory stays bounded regardless of query activity.
//! Queries filter by time window and then apply the same bin-averaging to
//! meet their own point budget.
//!
//! Each buffer sits behind its own lock; appending to one busy variable never
//! stalls appends or queries on another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::model::{coerce_numeric, now_epoch, Sample};

/// Default bound on raw samples kept per variable.
pub const DEFAULT_MAX_RAW_POINTS: usize = 20_000;

/// Rolling sample buffer for a single variable.
#[derive(Debug, Clone)]
pub struct PvHistory {
    points: Vec<Sample>,
    max_raw_points: usize,
}

impl PvHistory {
    /// Create an empty buffer bounded by `max_raw_points` (at least 1).
    pub fn new(max_raw_points: usize) -> Self {
        Self {
            points: Vec::new(),
            max_raw_points: max_raw_points.max(1),
        }
    }

    /// Append a sample, compacting first if the bound is exceeded.
    pub fn push(&mut self, sample: Sample) {
        self.points.push(sample);
        if self.points.len() > self.max_raw_points {
            self.compact();
        }
    }

    /// Bin-average the buffer down to half its bound.
    fn compact(&mut self) {
        let target = (self.max_raw_points / 2).max(1);
        if self.points.len() <= target {
            return;
        }
        let before = self.points.len();
        self.points = downsample(&self.points, target);
        tracing::trace!(before, after = self.points.len(), "compacted history buffer");
    }

    /// Samples with `timestamp >= cutoff`, in stored order.
    pub fn window(&self, cutoff: f64) -> Vec<Sample> {
        self.points
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .copied()
            .collect()
    }

    pub fn points(&self) -> &[Sample] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn max_raw_points(&self) -> usize {
        self.max_raw_points
    }
}

/// Downsample time-ordered samples to at most `max_points` by bin-averaging.
///
/// The span `[min_ts, max_ts]` is split into `max_points` equal-width bins.
/// Each non-empty bin yields the mean timestamp and mean value of the samples
/// that fall in it; empty bins produce nothing. Inputs that already fit are
/// returned unchanged. When every sample shares one timestamp the span has no
/// width, so evenly strided samples are taken instead.
pub fn downsample(points: &[Sample], max_points: usize) -> Vec<Sample> {
    let n = points.len();
    if n <= max_points || max_points == 0 {
        return points.to_vec();
    }

    let (t_min, t_max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.timestamp), hi.max(s.timestamp))
        });
    let range = t_max - t_min;

    if !(range > 0.0) {
        let stride = (n / max_points).max(1);
        return points
            .iter()
            .step_by(stride)
            .take(max_points)
            .copied()
            .collect();
    }

    let width = range / max_points as f64;
    // (timestamp sum, value sum, count) per bin
    let mut bins = vec![(0.0_f64, 0.0_f64, 0_usize); max_points];

    for sample in points {
        // The final sample sits exactly on the upper edge; fold it into the last bin.
        let idx = (((sample.timestamp - t_min) / width) as usize).min(max_points - 1);
        let bin = &mut bins[idx];
        bin.0 += sample.timestamp;
        bin.1 += sample.value;
        bin.2 += 1;
    }

    bins.into_iter()
        .filter(|&(_, _, count)| count > 0)
        .map(|(t_sum, v_sum, count)| {
            let count = count as f64;
            Sample::new((t_sum / count).clamp(t_min, t_max), v_sum / count)
        })
        .collect()
}

/// Process-wide collection of per-variable histories.
#[derive(Debug)]
pub struct HistoryCache {
    max_raw_points: usize,
    histories: RwLock<HashMap<String, Arc<Mutex<PvHistory>>>>,
}

impl HistoryCache {
    pub fn new(max_raw_points: usize) -> Self {
        Self {
            max_raw_points: max_raw_points.max(1),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Record a value for a variable.
    ///
    /// Values without a numeric reading are not stored; returns whether the
    /// sample was kept.
    pub fn record(&self, name: &str, value: &Value, timestamp: f64) -> bool {
        let Some(v) = coerce_numeric(value) else {
            return false;
        };
        let history = self.get_or_create(name);
        history.lock().push(Sample::new(timestamp, v));
        true
    }

    /// Samples from the last `window_secs` seconds, at most `max_points` of them.
    pub fn query(&self, name: &str, window_secs: f64, max_points: usize) -> Vec<Sample> {
        self.query_at(name, window_secs, max_points, now_epoch())
    }

    /// Like [`HistoryCache::query`] with an explicit notion of "now".
    pub fn query_at(
        &self,
        name: &str,
        window_secs: f64,
        max_points: usize,
        now: f64,
    ) -> Vec<Sample> {
        let Some(history) = self.histories.read().get(name).cloned() else {
            return Vec::new();
        };
        let filtered = history.lock().window(now - window_secs);

        if filtered.len() <= max_points {
            return filtered;
        }
        downsample(&filtered, max_points)
    }

    /// Number of samples currently buffered for a variable.
    pub fn len(&self, name: &str) -> usize {
        self.histories
            .read()
            .get(name)
            .map(|h| h.lock().len())
            .unwrap_or(0)
    }

    /// Names of all variables with a history buffer, sorted.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.histories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total samples buffered across every variable.
    pub fn total_points(&self) -> usize {
        self.histories.read().values().map(|h| h.lock().len()).sum()
    }

    pub fn max_raw_points(&self) -> usize {
        self.max_raw_points
    }

    fn get_or_create(&self, name: &str) -> Arc<Mutex<PvHistory>> {
        if let Some(history) = self.histories.read().get(name) {
            return history.clone();
        }
        self.histories
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PvHistory::new(self.max_raw_points))))
            .clone()
    }
}

impl Default for HistoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RAW_POINTS)
    }
}
