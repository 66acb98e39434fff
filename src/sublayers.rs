// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sublayer metrics: attribution of a trace's wall-clock time to the
//! services and span types it crossed.
//!
//! For a single trace this computes, by sweeping over the span intervals,
//! how long each service (resp. span type) was the innermost active work,
//! plus the total span count. The resulting values are published into the
//! root span's metrics map and ride along with the trace.

use std::collections::HashMap;

use crate::span::{Span, Trace};

pub const METRIC_SPAN_COUNT: &str = "_sublayers.span_count";
pub const METRIC_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
pub const METRIC_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";

const TAG_SUBLAYER_SERVICE: &str = "sublayer_service";
const TAG_SUBLAYER_TYPE: &str = "sublayer_type";

/// A tag qualifying a [`SublayerValue`], e.g. `sublayer_service:mcnulty`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SublayerTag {
    pub name: &'static str,
    pub value: String,
}

/// One computed sublayer metric value. `tag` is `None` for the span count.
#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    pub metric: &'static str,
    pub tag: Option<SublayerTag>,
    pub value: f64,
}

/// A start or end of a span interval. At equal timestamps ends sort before
/// starts so that a span ending exactly where another begins is not counted
/// as concurrent with it.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EventKind {
    End,
    Start,
}

struct Event {
    ts: i64,
    kind: EventKind,
    span: usize,
}

/// Compute the sublayer values of a trace:
/// - `_sublayers.span_count`: number of spans in the trace;
/// - `_sublayers.duration.by_service`: per service, the time during which a
///   span of that service was the innermost active span;
/// - `_sublayers.duration.by_type`: same, keyed by span type.
///
/// The innermost active span is the active span with the latest start
/// (deepest span on ties). A span with an empty service or type does not
/// claim that dimension for itself: the value is inherited from the nearest
/// ancestor that has one, so e.g. an untyped utility span inside a `web`
/// request still counts as `web` time. When no ancestor carries a value the
/// empty string is used as a literal tag value.
pub fn compute_sublayers(trace: &Trace) -> Vec<SublayerValue> {
    let mut durations_by_service: HashMap<String, i64> = HashMap::new();
    let mut durations_by_type: HashMap<String, i64> = HashMap::new();

    let parents = build_parent_index(trace);
    let depths = build_depths(trace, &parents);

    let mut events: Vec<Event> = Vec::with_capacity(trace.len() * 2);
    for (i, span) in trace.iter().enumerate() {
        // Zero-duration spans only contribute to the span count.
        if span.duration <= 0 {
            continue;
        }
        events.push(Event {
            ts: span.start,
            kind: EventKind::Start,
            span: i,
        });
        events.push(Event {
            ts: span.end(),
            kind: EventKind::End,
            span: i,
        });
    }
    events.sort_by_key(|e| (e.ts, e.kind == EventKind::Start));

    let mut active: Vec<usize> = Vec::new();
    let mut previous_ts = i64::MIN;
    for event in &events {
        if !active.is_empty() && event.ts > previous_ts {
            let interval = event.ts - previous_ts;
            // Innermost active span: latest start, then deepest.
            if let Some(&innermost) = active
                .iter()
                .max_by_key(|&&i| (trace[i].start, depths[i]))
            {
                let service = inherited_attr(trace, &parents, innermost, |s| &s.service);
                let span_type = inherited_attr(trace, &parents, innermost, |s| &s.r#type);
                *durations_by_service.entry(service.to_string()).or_insert(0) += interval;
                *durations_by_type.entry(span_type.to_string()).or_insert(0) += interval;
            }
        }
        previous_ts = event.ts;
        match event.kind {
            EventKind::Start => active.push(event.span),
            EventKind::End => {
                if let Some(pos) = active.iter().position(|&i| i == event.span) {
                    active.swap_remove(pos);
                }
            }
        }
    }

    let mut values = Vec::with_capacity(1 + durations_by_service.len() + durations_by_type.len());
    values.push(SublayerValue {
        metric: METRIC_SPAN_COUNT,
        tag: None,
        value: trace.len() as f64,
    });
    values.extend(sorted_values(
        METRIC_DURATION_BY_SERVICE,
        TAG_SUBLAYER_SERVICE,
        durations_by_service,
    ));
    values.extend(sorted_values(
        METRIC_DURATION_BY_TYPE,
        TAG_SUBLAYER_TYPE,
        durations_by_type,
    ));
    values
}

/// Write sublayer values into the root span's metrics map. Tagged metrics
/// use the key `<metric>.<tag_name>:<tag_value>`, the untagged span count
/// uses the bare metric name. Non-root spans are never touched.
pub fn set_sublayers_on_span(root: &mut Span, values: &[SublayerValue]) {
    for value in values {
        let key = match &value.tag {
            Some(tag) => format!("{}.{}:{}", value.metric, tag.name, tag.value),
            None => value.metric.to_string(),
        };
        root.metrics.insert(key, value.value);
    }
}

fn build_parent_index(trace: &[Span]) -> Vec<Option<usize>> {
    let ids: HashMap<u64, usize> = trace
        .iter()
        .enumerate()
        .map(|(i, span)| (span.span_id, i))
        .collect();
    trace
        .iter()
        .enumerate()
        .map(|(i, span)| match ids.get(&span.parent_id) {
            Some(&p) if p != i => Some(p),
            _ => None,
        })
        .collect()
}

fn build_depths(trace: &[Span], parents: &[Option<usize>]) -> Vec<usize> {
    let mut depths = vec![0usize; trace.len()];
    for i in 0..trace.len() {
        let mut depth = 0;
        let mut cur = parents[i];
        // Bounded walk so a malformed parent cycle cannot hang us.
        while let Some(p) = cur {
            depth += 1;
            if depth > trace.len() {
                break;
            }
            cur = parents[p];
        }
        depths[i] = depth;
    }
    depths
}

/// Attribute value of `span`, inherited from the closest ancestor when the
/// span's own value is empty.
fn inherited_attr<'a>(
    trace: &'a [Span],
    parents: &[Option<usize>],
    span: usize,
    attr: impl Fn(&Span) -> &String,
) -> &'a str {
    let mut cur = Some(span);
    let mut hops = 0;
    while let Some(i) = cur {
        let value = attr(&trace[i]);
        if !value.is_empty() {
            return value;
        }
        hops += 1;
        if hops > trace.len() {
            break;
        }
        cur = parents[i];
    }
    ""
}

fn sorted_values(
    metric: &'static str,
    tag_name: &'static str,
    durations: HashMap<String, i64>,
) -> Vec<SublayerValue> {
    let mut entries: Vec<(String, i64)> = durations.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .into_iter()
        .map(|(value, duration)| SublayerValue {
            metric,
            tag: Some(SublayerTag {
                name: tag_name,
                value,
            }),
            value: duration as f64,
        })
        .collect()
}
