// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace signature computation.
//!
//! A signature is a structural fingerprint of a trace: traces whose spans
//! cover the same set of (service, operation name) pairs share one. It is
//! the key under which the sampler backend accumulates scores.

use crate::span::Trace;

const OFFSET_32: u32 = 2166136261;
const PRIME_32: u32 = 16777619;

/// Order-independent fingerprint of a trace's (service, name) pairs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Signature(pub u64);

fn write_hash(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME_32);
    }
    hash
}

fn span_hash(service: &str, name: &str) -> u32 {
    let mut h = OFFSET_32;
    h = write_hash(h, service.as_bytes());
    h = write_hash(h, b",");
    h = write_hash(h, name.as_bytes());
    h
}

/// Compute the signature of a trace.
///
/// Each span contributes an FNV-1a hash of its (service, name) pair; the
/// hashes are sorted, deduped and XOR-folded so the result does not depend
/// on span order or on repeated identical pairs.
pub fn compute_signature(trace: &Trace) -> Signature {
    let mut span_hashes: Vec<u32> = trace
        .iter()
        .map(|span| span_hash(&span.service, &span.name))
        .collect();
    span_hashes.sort_unstable();
    span_hashes.dedup();

    let mut trace_hash = 0u32;
    for &h in &span_hashes {
        trace_hash ^= h;
    }
    Signature(trace_hash as u64)
}
