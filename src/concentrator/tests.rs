// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::telemetry::test_support::RecordingEmitter;
use crate::telemetry::NoopEmitter;
use crate::time::ManualClock;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;

const BUCKET_SIZE: i64 = 10_000_000_000;
const CUTOFF: i64 = 60_000_000_000;
const NOW: i64 = 1_700_000_000_000_000_000;

fn test_config() -> Config {
    let mut config = Config {
        bucket_interval: Duration::from_nanos(BUCKET_SIZE as u64),
        oldest_span_cutoff: Duration::from_nanos(CUTOFF as u64),
        ..Default::default()
    };
    config.validate().unwrap();
    config
}

fn test_concentrator(clock: Arc<ManualClock>) -> Concentrator {
    Concentrator::new(&test_config(), clock, Arc::new(NoopEmitter))
}

/// Create a test span ending `end_offset` ns before NOW, with a random
/// in-bucket start so tests do not depend on alignment accidents.
fn get_test_span(end_offset: i64, service: &str, resource: &str, error: i32) -> Span {
    let duration = thread_rng().gen_range(1..BUCKET_SIZE / 2);
    Span {
        trace_id: 1,
        span_id: 1,
        parent_id: 0,
        service: service.to_string(),
        name: "query".to_string(),
        resource: resource.to_string(),
        r#type: "db".to_string(),
        start: NOW - end_offset - duration,
        duration,
        error,
        ..Default::default()
    }
}

#[test]
fn test_late_span_rejection() {
    let clock = Arc::new(ManualClock::new(NOW));
    let emitter = Arc::new(RecordingEmitter::default());
    let concentrator = Concentrator::new(&test_config(), clock, emitter.clone());

    let span = get_test_span(61_000_000_000, "A1", "resource1", 0);
    let err = concentrator.handle_new_span(&span, "prod").unwrap_err();
    match err {
        ConcentratorError::LateSpan { late_by_ns } => {
            assert!(late_by_ns > 0);
        }
    }
    // The bucket map is untouched and the rejection was counted.
    assert_eq!(concentrator.bucket_count(), 0);
    assert_eq!(
        emitter.counts.lock().unwrap().as_slice(),
        &[(METRIC_LATE_SPAN, 1)]
    );
}

#[test]
fn test_lateness_gate_boundary() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock);

    // Exactly at the cutoff is still accepted; one nanosecond past is not.
    let at_cutoff = get_test_span(CUTOFF, "A1", "resource1", 0);
    assert!(concentrator.handle_new_span(&at_cutoff, "prod").is_ok());
    let past_cutoff = get_test_span(CUTOFF + 1, "A1", "resource1", 0);
    assert_eq!(
        concentrator.handle_new_span(&past_cutoff, "prod"),
        Err(ConcentratorError::LateSpan { late_by_ns: 1 })
    );
}

#[test]
fn test_bucket_containment() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock.clone());

    let mut ends = Vec::new();
    for _ in 0..100 {
        let offset = thread_rng().gen_range(0..CUTOFF);
        let span = get_test_span(offset, "A1", "resource1", 0);
        ends.push(span.end());
        concentrator.handle_new_span(&span, "prod").unwrap();
    }

    clock.advance(CUTOFF + 2 * BUCKET_SIZE);
    let buckets = concentrator.flush();
    let total_hits: u64 = buckets
        .iter()
        .flat_map(|b| &b.stats)
        .map(|g| g.stats.hits)
        .sum();
    assert_eq!(total_hits, 100);
    for bucket in &buckets {
        let covered = ends
            .iter()
            .filter(|&&end| bucket.start <= end && end < bucket.start + bucket.duration)
            .count();
        let hits: u64 = bucket.stats.iter().map(|g| g.stats.hits).sum();
        assert_eq!(hits as usize, covered, "bucket {}", bucket.start);
    }
}

#[test]
fn test_bucket_flush_timing() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock.clone());

    // Too old: rejected outright.
    let rejected = get_test_span(120_000_000_000, "A1", "resource1", 0);
    assert!(concentrator.handle_new_span(&rejected, "prod").is_err());
    assert!(concentrator
        .handle_new_span(&get_test_span(70_000_000_000, "A1", "resource1", 0), "prod")
        .is_err());

    // Recent: accepted into a live bucket.
    let accepted = get_test_span(5_000_000_000, "A1", "resource1", 0);
    concentrator.handle_new_span(&accepted, "prod").unwrap();

    // Nothing is old enough to flush yet.
    assert!(concentrator.flush().is_empty());
    assert_eq!(concentrator.bucket_count(), 1);

    // After two minutes the accepted span's bucket expires.
    clock.advance(120_000_000_000);
    let buckets = concentrator.flush();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].start, align_timestamp(accepted.end(), BUCKET_SIZE));
    assert_eq!(buckets[0].stats.len(), 1);
    assert_eq!(buckets[0].stats[0].stats.hits, 1);
    assert_eq!(concentrator.bucket_count(), 0);
}

#[test]
fn test_flush_keeps_live_buckets() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock.clone());

    concentrator
        .handle_new_span(&get_test_span(1_000_000_000, "A1", "resource1", 0), "prod")
        .unwrap();
    concentrator
        .handle_new_span(&get_test_span(30_000_000_000, "A1", "resource1", 0), "prod")
        .unwrap();

    // Both buckets are within the lateness window: flush returns nothing
    // and the map keeps every pre-flush timestamp.
    let before = concentrator.bucket_count();
    assert!(concentrator.flush().is_empty());
    assert_eq!(concentrator.bucket_count(), before);
}

#[test]
fn test_flush_ordering() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock.clone());

    // Three consecutive buckets, inserted out of order.
    for offset in [10_000_000_000i64, 30_000_000_000, 20_000_000_000] {
        let span = get_test_span(offset, "A1", "resource1", 0);
        concentrator.handle_new_span(&span, "prod").unwrap();
    }

    clock.advance(CUTOFF + 4 * BUCKET_SIZE);
    let buckets = concentrator.flush();
    assert_eq!(buckets.len(), 3);
    let starts: Vec<i64> = buckets.iter().map(|b| b.start).collect();
    let mut sorted = starts.clone();
    sorted.sort_unstable();
    assert_eq!(starts, sorted);
    assert_eq!(starts[1] - starts[0], BUCKET_SIZE);
    assert_eq!(starts[2] - starts[1], BUCKET_SIZE);
}

#[test]
fn test_flush_respects_live_bucket_even_past_cutoff() {
    // With a cutoff shorter than the bucket width, the live bucket must
    // still not be flushed.
    let clock = Arc::new(ManualClock::new(NOW));
    let mut config = test_config();
    config.oldest_span_cutoff = Duration::from_secs(1);
    let concentrator = Concentrator::new(&config, clock.clone(), Arc::new(NoopEmitter));

    let span = get_test_span(0, "A1", "resource1", 0);
    concentrator.handle_new_span(&span, "prod").unwrap();
    clock.advance(2_000_000_000);
    // The span's bucket may still be the live one.
    let live = align_timestamp(clock.now_ns(), BUCKET_SIZE);
    for bucket in concentrator.flush() {
        assert!(bucket.start < live);
    }
}

#[test]
fn test_force_flush_returns_everything() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock);

    concentrator
        .handle_new_span(&get_test_span(1_000_000_000, "A1", "resource1", 0), "prod")
        .unwrap();
    concentrator
        .handle_new_span(&get_test_span(15_000_000_000, "A2", "resource2", 1), "prod")
        .unwrap();

    assert!(concentrator.flush().is_empty());
    let buckets = concentrator.force_flush();
    assert_eq!(buckets.len(), 2);
    assert_eq!(concentrator.bucket_count(), 0);
}

#[test]
fn test_flush_emits_distribution_lengths() {
    let clock = Arc::new(ManualClock::new(NOW));
    let emitter = Arc::new(RecordingEmitter::default());
    let concentrator = Concentrator::new(&test_config(), clock.clone(), emitter.clone());

    for _ in 0..3 {
        concentrator
            .handle_new_span(&get_test_span(5_000_000_000, "A1", "resource1", 0), "prod")
            .unwrap();
    }
    clock.advance(CUTOFF + 2 * BUCKET_SIZE);
    let buckets = concentrator.flush();
    assert_eq!(buckets.len(), 1);
    assert_eq!(
        emitter.histograms.lock().unwrap().as_slice(),
        &[(METRIC_DISTRIBUTION_LEN, 3.0)]
    );
}

#[test]
fn test_error_spans_are_counted() {
    let clock = Arc::new(ManualClock::new(NOW));
    let concentrator = test_concentrator(clock.clone());

    concentrator
        .handle_new_span(&get_test_span(5_000_000_000, "A1", "resource1", 1), "prod")
        .unwrap();
    concentrator
        .handle_new_span(&get_test_span(5_000_000_000, "A1", "resource1", 0), "prod")
        .unwrap();

    clock.advance(CUTOFF + 2 * BUCKET_SIZE);
    let buckets = concentrator.flush();
    let group = &buckets[0].stats[0];
    assert_eq!(group.stats.hits, 2);
    assert_eq!(group.stats.errors, 1);
    assert_eq!(group.key.env, "prod");
}
