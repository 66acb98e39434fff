// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The concentrator produces time-bucketed statistics from a stream of raw
//! spans.
//!
//! # Aggregation
//! Spans are aggregated into time buckets based on their end time; within
//! each bucket they are grouped by (env, resource, service, name, type)
//! plus the configured extra dimensions.
//!
//! # Lateness
//! A span whose end is older than `oldest_span_cutoff` is rejected; a
//! bucket is only flushed once it is older than both the cutoff and the
//! currently live bucket, so late-but-acceptable spans still find their
//! bucket in place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::Config;
use crate::span::Span;
use crate::telemetry::{SharedEmitter, METRIC_DISTRIBUTION_LEN, METRIC_LATE_SPAN};
use crate::time::Clock;

mod aggregation;
#[cfg(test)]
mod tests;

pub use aggregation::{AggregationKey, GroupedStats, StatsBucket, StatsGroup};

use aggregation::RawBucket;

/// Error returned for spans the concentrator refuses to aggregate.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConcentratorError {
    /// The span ended too long ago for any live bucket to cover it.
    #[error("rejecting late span, late by {late_by_ns}ns")]
    LateSpan { late_by_ns: i64 },
}

/// Align a timestamp on the start of a bucket.
#[inline]
fn align_timestamp(ts: i64, bucket_size: i64) -> i64 {
    ts - ts.rem_euclid(bucket_size)
}

/// Aggregates spans into per-time-bucket statistics, keyed by span
/// attributes. All methods take `&self`; the bucket map is guarded by one
/// internal mutex.
pub struct Concentrator {
    /// Size of the time buckets used for aggregation, in nanoseconds.
    bucket_size: i64,
    oldest_span_cutoff: i64,
    /// Extra aggregation dimensions, sorted. The finest grain we ever
    /// aggregate to.
    extra_aggregators: Vec<String>,
    buckets: Mutex<HashMap<i64, RawBucket>>,
    clock: Arc<dyn Clock>,
    emitter: SharedEmitter,
}

impl Concentrator {
    /// Return a concentrator ready to aggregate spans, reading "now" from
    /// `clock` and reporting to `emitter`.
    pub fn new(config: &Config, clock: Arc<dyn Clock>, emitter: SharedEmitter) -> Self {
        Concentrator {
            bucket_size: config.bucket_interval_ns(),
            oldest_span_cutoff: config.oldest_span_cutoff_ns(),
            extra_aggregators: config.extra_aggregators.clone(),
            buckets: Mutex::new(HashMap::new()),
            clock,
            emitter,
        }
    }

    /// Aggregate one span under the given env.
    ///
    /// The bucket is chosen from the span end, not its start: a
    /// long-running span is not late just because it began before the
    /// lateness window.
    pub fn handle_new_span(&self, span: &Span, env: &str) -> Result<(), ConcentratorError> {
        let end = span.end();
        let now = self.clock.now_ns();
        if now > end + self.oldest_span_cutoff {
            let late_by_ns = now - end - self.oldest_span_cutoff;
            debug!(
                cutoff_s = self.oldest_span_cutoff / 1_000_000_000,
                now_s = now / 1_000_000_000,
                end_s = end / 1_000_000_000,
                service = %span.service,
                "span rejected by concentrator: too old"
            );
            self.emitter.count(METRIC_LATE_SPAN, 1);
            return Err(ConcentratorError::LateSpan { late_by_ns });
        }

        let bucket_ts = align_timestamp(end, self.bucket_size);
        let key = AggregationKey::from_span(span, env, &self.extra_aggregators);
        let mut buckets = self.lock();
        buckets
            .entry(bucket_ts)
            .or_insert_with(|| RawBucket::new(bucket_ts))
            .insert(key, span);
        Ok(())
    }

    /// Remove and return the buckets that cannot be hit anymore: strictly
    /// older than the live bucket and beyond the lateness window. Returned
    /// buckets are in ascending start order.
    ///
    /// A span arriving at most `oldest_span_cutoff` late may target a
    /// bucket flushed on the same tick; it is then re-aggregated into a
    /// fresh bucket at the same timestamp and leaves with a later flush.
    /// Upstreams that need exactly-once grouping must deliver spans before
    /// the cutoff.
    pub fn flush(&self) -> Vec<StatsBucket> {
        let now = self.clock.now_ns();
        self.flush_before(now - self.oldest_span_cutoff, align_timestamp(now, self.bucket_size))
    }

    /// Flush every remaining bucket regardless of age. Shutdown path, so
    /// buffered stats are not lost when the input closes.
    pub fn force_flush(&self) -> Vec<StatsBucket> {
        self.flush_before(i64::MAX, i64::MAX)
    }

    fn flush_before(&self, cutoff_ts: i64, live_bucket_ts: i64) -> Vec<StatsBucket> {
        let mut flushed = Vec::new();
        {
            let mut buckets = self.lock();
            let mut expired: Vec<i64> = buckets
                .keys()
                .copied()
                .filter(|&ts| ts < cutoff_ts && ts < live_bucket_ts)
                .collect();
            expired.sort_unstable();
            for ts in expired {
                if let Some(bucket) = buckets.remove(&ts) {
                    debug!(bucket_start = ts, "concentrator: flushing bucket");
                    flushed.push(bucket.flush(self.bucket_size));
                }
            }
        }
        // Lock released before touching telemetry.
        for bucket in &flushed {
            for group in &bucket.stats {
                self.emitter
                    .histogram(METRIC_DISTRIBUTION_LEN, group.stats.summary.count() as f64);
            }
        }
        debug!(buckets = flushed.len(), "concentrator: flush done");
        flushed
    }

    /// Number of buckets currently under aggregation.
    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RawBucket>> {
        match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
