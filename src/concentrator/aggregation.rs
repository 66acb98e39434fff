// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Intra-bucket stats aggregation: the aggregation key grouping spans
//! together and the counters computed for each group.

use std::collections::HashMap;

use serde::Serialize;

use crate::sketch::DDSketch;
use crate::span::Span;

/// The key used to group spans together to compute stats.
///
/// `extra_tags` carries the values of the configured extra aggregation
/// dimensions, paired with their dimension name in sorted name order so
/// that equal groupings always hash identically.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default, Serialize)]
pub struct AggregationKey {
    pub env: String,
    pub resource: String,
    pub service: String,
    pub name: String,
    pub span_type: String,
    pub extra_tags: Vec<(String, String)>,
}

impl AggregationKey {
    /// Build the key matching a span. `extra_aggregators` must be sorted;
    /// dimensions the span does not carry are recorded with an empty value
    /// so that their absence is part of the key.
    pub fn from_span(span: &Span, env: &str, extra_aggregators: &[String]) -> Self {
        AggregationKey {
            env: env.to_string(),
            resource: span.resource.clone(),
            service: span.service.clone(),
            name: span.name.clone(),
            span_type: span.r#type.clone(),
            extra_tags: extra_aggregators
                .iter()
                .map(|key| {
                    let value = span.meta.get(key).cloned().unwrap_or_default();
                    (key.clone(), value)
                })
                .collect(),
        }
    }
}

/// The stats computed from a group of spans with the same AggregationKey.
#[derive(Debug, Default, Clone, Serialize)]
pub struct GroupedStats {
    pub hits: u64,
    pub errors: u64,
    /// Sum of span durations, in nanoseconds.
    pub duration: u64,
    pub summary: DDSketch,
}

impl GroupedStats {
    /// Update the stats of a GroupedStats by inserting a span.
    fn insert(&mut self, span: &Span) {
        self.hits += 1;
        self.duration += span.duration.max(0) as u64;
        if span.error != 0 {
            self.errors += 1;
        }
        self.summary.add(span.duration as f64);
    }
}

/// A time bucket under aggregation. It stores a map of GroupedStats
/// storing the stats of spans aggregated on their AggregationKey.
#[derive(Debug, Clone)]
pub(super) struct RawBucket {
    start: i64,
    data: HashMap<AggregationKey, GroupedStats>,
}

impl RawBucket {
    /// Return a new bucket starting at the given timestamp.
    pub(super) fn new(start: i64) -> Self {
        RawBucket {
            start,
            data: HashMap::new(),
        }
    }

    /// Insert a span as stats in the group corresponding to the
    /// aggregation key, creating the group on demand.
    pub(super) fn insert(&mut self, key: AggregationKey, span: &Span) {
        self.data.entry(key).or_default().insert(span);
    }

    /// Consume the bucket and render the flushed representation.
    /// `bucket_duration` is the bucket width of the owning concentrator.
    pub(super) fn flush(self, bucket_duration: i64) -> StatsBucket {
        let mut stats: Vec<StatsGroup> = self
            .data
            .into_iter()
            .map(|(key, group)| StatsGroup { key, stats: group })
            .collect();
        // Deterministic payload order regardless of map iteration.
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        StatsBucket {
            start: self.start,
            duration: bucket_duration,
            stats,
        }
    }
}

/// One flushed aggregation group.
#[derive(Debug, Clone, Serialize)]
pub struct StatsGroup {
    #[serde(flatten)]
    pub key: AggregationKey,
    #[serde(flatten)]
    pub stats: GroupedStats,
}

/// A completed stats bucket, covering `[start, start + duration)`.
///
/// Every span aggregated into the bucket had its end timestamp inside that
/// window at insertion time.
#[derive(Debug, Clone, Serialize)]
pub struct StatsBucket {
    pub start: i64,
    pub duration: i64,
    pub stats: Vec<StatsGroup>,
}

impl AggregationKey {
    fn cmp_key(&self) -> (&str, &str, &str, &str, &str, &[(String, String)]) {
        (
            &self.env,
            &self.resource,
            &self.service,
            &self.name,
            &self.span_type,
            &self.extra_tags,
        )
    }
}

impl PartialOrd for AggregationKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AggregationKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}
