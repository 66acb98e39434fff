// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DDSketch quantile sketch with relative-error guarantees, used as the
//! latency distribution of stats buckets.
//!
//! Values are mapped to logarithmically sized bins so any returned quantile
//! is within `alpha` relative error of the true value. The bin store is
//! bounded: when more than `max_bins` bins are needed, the lowest bins are
//! collapsed together, preserving accuracy for the high quantiles that
//! matter for latency monitoring.

use serde::Serialize;

const DEFAULT_ALPHA: f64 = 0.01;
const DEFAULT_MAX_BINS: usize = 2048;
/// Values at or below this are counted in a dedicated zero bin.
const DEFAULT_MIN_VALUE: f64 = 1.0e-9;
const INITIAL_BINS: usize = 128;

/// A quantile sketch over positive values (durations in nanoseconds).
#[derive(Clone, Debug, Serialize)]
pub struct DDSketch {
    gamma: f64,
    gamma_ln: f64,
    min_value: f64,
    max_bins: usize,
    /// Counts per bin; `bins[i]` holds the count for key `offset + i`.
    bins: Vec<u64>,
    offset: i32,
    zero_count: u64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for DDSketch {
    fn default() -> Self {
        DDSketch::new(DEFAULT_ALPHA, DEFAULT_MAX_BINS, DEFAULT_MIN_VALUE)
    }
}

impl DDSketch {
    pub fn new(alpha: f64, max_bins: usize, min_value: f64) -> Self {
        let gamma = (1.0 + alpha) / (1.0 - alpha);
        DDSketch {
            gamma,
            gamma_ln: gamma.ln(),
            min_value,
            max_bins,
            bins: Vec::new(),
            offset: 0,
            zero_count: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Number of values inserted.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Insert one value. Non-finite and negative values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if value <= self.min_value {
            self.zero_count += 1;
            return;
        }
        let key = self.key(value);
        self.increment(key, 1);
    }

    /// Merge another sketch built with the same parameters into this one.
    pub fn merge(&mut self, other: &DDSketch) {
        self.count += other.count;
        self.sum += other.sum;
        self.zero_count += other.zero_count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (i, &bin_count) in other.bins.iter().enumerate() {
            if bin_count > 0 {
                self.increment(other.offset + i as i32, bin_count);
            }
        }
    }

    /// Value at quantile `q` in `[0, 1]`, within the configured relative
    /// accuracy. `None` when the sketch is empty or `q` is out of range.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=1.0).contains(&q) {
            return None;
        }
        if q == 0.0 {
            return Some(self.min);
        }
        if q == 1.0 {
            return Some(self.max);
        }

        let rank = (q * (self.count - 1) as f64) as u64 + 1;
        if rank <= self.zero_count {
            return Some(0.0);
        }
        let mut cumulative = self.zero_count;
        for (i, &bin_count) in self.bins.iter().enumerate() {
            cumulative += bin_count;
            if cumulative >= rank {
                let key = self.offset + i as i32;
                let value = 2.0 * (key as f64 * self.gamma_ln).exp() / (1.0 + self.gamma);
                return Some(value.clamp(self.min, self.max));
            }
        }
        Some(self.max)
    }

    fn key(&self, value: f64) -> i32 {
        (value.ln() / self.gamma_ln).ceil() as i32
    }

    fn increment(&mut self, key: i32, by: u64) {
        if self.bins.is_empty() {
            self.offset = key;
            self.bins = vec![0; INITIAL_BINS.min(self.max_bins)];
        }
        if key < self.offset {
            self.grow_left(key);
        } else if key >= self.offset + self.bins.len() as i32 {
            self.grow_right(key);
        }
        // After growth the key is inside the store, except when it was
        // collapsed into the lowest bin.
        let index = (key.max(self.offset) - self.offset) as usize;
        let clamped = index.min(self.bins.len() - 1);
        self.bins[clamped] += by;
    }

    fn grow_left(&mut self, key: i32) {
        let span = (self.offset + self.bins.len() as i32 - key) as usize;
        if span > self.max_bins {
            // Store is full: collapse the new value into the lowest bin by
            // leaving the offset as is.
            return;
        }
        let grow_by = (self.offset - key) as usize;
        let mut bins = vec![0; grow_by + self.bins.len()];
        bins[grow_by..].copy_from_slice(&self.bins);
        self.bins = bins;
        self.offset = key;
    }

    fn grow_right(&mut self, key: i32) {
        let span = (key - self.offset + 1) as usize;
        if span <= self.max_bins {
            self.bins.resize(span, 0);
            return;
        }
        // Keep the highest `max_bins` keys and collapse everything below
        // into the new lowest bin.
        let new_offset = key - (self.max_bins as i32 - 1);
        let mut bins = vec![0u64; self.max_bins];
        for (i, &bin_count) in self.bins.iter().enumerate() {
            let old_key = self.offset + i as i32;
            let index = (old_key.max(new_offset) - new_offset) as usize;
            bins[index] += bin_count;
        }
        self.bins = bins;
        self.offset = new_offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_relative(actual: f64, expected: f64, alpha: f64) {
        let err = (actual - expected).abs() / expected;
        assert!(
            err <= alpha,
            "expected {expected} within {alpha}, got {actual} (err {err})"
        );
    }

    #[test]
    fn test_empty() {
        let sketch = DDSketch::default();
        assert_eq!(sketch.count(), 0);
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), None);
    }

    #[test]
    fn test_quantiles_uniform() {
        let mut sketch = DDSketch::default();
        for i in 1..=10_000 {
            sketch.add(i as f64);
        }
        assert_eq!(sketch.count(), 10_000);
        assert_relative(sketch.quantile(0.5).unwrap(), 5_000.0, 0.011);
        assert_relative(sketch.quantile(0.95).unwrap(), 9_500.0, 0.011);
        assert_relative(sketch.quantile(0.99).unwrap(), 9_900.0, 0.011);
        assert_eq!(sketch.quantile(0.0), Some(1.0));
        assert_eq!(sketch.quantile(1.0), Some(10_000.0));
    }

    #[test]
    fn test_latency_scale() {
        // Nanosecond latencies spanning 1us..10s.
        let mut sketch = DDSketch::default();
        let values = [1_000.0, 50_000.0, 1_000_000.0, 250_000_000.0, 1e10];
        for v in values {
            sketch.add(v);
        }
        assert_eq!(sketch.count(), 5);
        assert_relative(sketch.quantile(0.5).unwrap(), 1_000_000.0, 0.011);
    }

    #[test]
    fn test_merge() {
        let mut a = DDSketch::default();
        let mut b = DDSketch::default();
        for i in 1..=500 {
            a.add(i as f64);
        }
        for i in 501..=1_000 {
            b.add(i as f64);
        }
        a.merge(&b);
        assert_eq!(a.count(), 1_000);
        assert_relative(a.quantile(0.5).unwrap(), 500.0, 0.011);
        assert_relative(a.quantile(0.9).unwrap(), 900.0, 0.011);
    }

    #[test]
    fn test_ignores_garbage() {
        let mut sketch = DDSketch::default();
        sketch.add(f64::NAN);
        sketch.add(f64::INFINITY);
        sketch.add(-1.0);
        assert_eq!(sketch.count(), 0);
        sketch.add(0.0);
        assert_eq!(sketch.count(), 1);
        assert_eq!(sketch.quantile(0.5), Some(0.0));
    }
}
