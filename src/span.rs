// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span and trace model handled by the pipeline.

use serde::Serialize;
use std::collections::HashMap;

/// Checks if the `value` represents an empty string. Used to skip serializing
/// empty strings with serde.
fn is_empty_str(value: &str) -> bool {
    value.is_empty()
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

/// A finished unit of work reported by a tracer.
///
/// Timestamps and durations are in nanoseconds. `parent_id == 0` marks a
/// root span.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    #[serde(skip_serializing_if = "is_default")]
    pub parent_id: u64,
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub r#type: String,
    pub start: i64,
    pub duration: i64,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub env: String,
    #[serde(skip_serializing_if = "is_default")]
    pub error: i32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

impl Span {
    /// End timestamp of the span in nanoseconds.
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }

    /// True if this span is the in-band sentinel asking the concentrator to
    /// flush. Marker spans use span id 0, which tracers never emit.
    pub fn is_flush_marker(&self) -> bool {
        self.span_id == 0
    }
}

/// An ordered sequence of spans sharing a trace id, forming a tree rooted
/// at the span whose parent id is zero.
pub type Trace = Vec<Span>;

/// Return the index of the trace root: the span with `parent_id == 0`, the
/// earliest-start one if there are several. Returns `None` for an empty
/// trace or one with no identifiable root.
pub fn root_span_index(trace: &[Span]) -> Option<usize> {
    trace
        .iter()
        .enumerate()
        .filter(|(_, span)| span.parent_id == 0)
        .min_by_key(|(_, span)| span.start)
        .map(|(i, _)| i)
}

/// Env of the trace, taken from its root span. Empty when the trace carries
/// none; callers substitute the configured default.
pub fn get_env(trace: &[Span]) -> &str {
    match root_span_index(trace) {
        Some(i) => trace[i].env.as_str(),
        None => "",
    }
}

/// Build the single-span sentinel trace that triggers an immediate flush
/// when it reaches the concentrator loop.
pub fn flush_marker_trace() -> Trace {
    vec![Span::default()]
}
