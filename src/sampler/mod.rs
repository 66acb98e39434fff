// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adaptive trace sampler.
//!
//! The [`ScoreSampler`] fingerprints each trace with a [`Signature`],
//! counts it in the decayed-score [`Backend`] and admits traces at a rate
//! that keeps the overall kept volume close to a configured target. The
//! admission coin flip is deterministic on the trace id so every chunk of
//! a distributed trace gets the same decision.

mod backend;
mod signature;

pub use backend::Backend;
pub use signature::{compute_signature, Signature};

use std::sync::Arc;

use crate::span::Trace;

/// Metric key recording the rate applied to a kept trace.
const KEY_SAMPLING_RATE_GLOBAL: &str = "_sample_rate";

/// Using a prime number for better distribution.
const KNUTH_FACTOR: u64 = 1111111111111111111;
const MAX_TRACE_ID_FLOAT: f64 = u64::MAX as f64;

/// Floor under the measured total rate, so an idle pipeline keeps
/// everything instead of dividing by a vanishing score.
const MIN_TOTAL_SCORE: f64 = 1e-6;

/// Samples traces by signature score, keeping roughly
/// `target_traces_per_second` traces per second overall.
pub struct ScoreSampler {
    backend: Arc<Backend>,
    target_traces_per_second: f64,
}

impl ScoreSampler {
    pub fn new(backend: Arc<Backend>, target_traces_per_second: f64) -> Self {
        ScoreSampler {
            backend,
            target_traces_per_second,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Count an incoming trace and tell if it is a sample which has to be
    /// kept. `root` is the index of the trace's root span; kept traces get
    /// the applied rate recorded in the root's metrics.
    pub fn sample(&self, trace: &mut Trace, root: usize) -> bool {
        if trace.is_empty() || root >= trace.len() {
            return false;
        }

        let signature = compute_signature(trace);
        self.backend.count_signature(signature);

        let rate = self.sample_rate();
        let sampled = sample_by_rate(trace[root].trace_id, rate);
        if sampled {
            self.backend.count_sample();
            trace[root]
                .metrics
                .insert(KEY_SAMPLING_RATE_GLOBAL.to_string(), rate);
        }
        sampled
    }

    /// Ratio-based admission rate: the fraction of the measured total rate
    /// that fits in the configured target.
    fn sample_rate(&self) -> f64 {
        let total = self.backend.get_total_score().max(MIN_TOTAL_SCORE);
        (self.target_traces_per_second / total).min(1.0)
    }
}

/// Return whether to keep a trace, based on its id and a sampling rate.
/// This assumes that trace ids are nearly uniformly distributed.
fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    if rate < 1.0 {
        trace_id.wrapping_mul(KNUTH_FACTOR) < (rate * MAX_TRACE_ID_FLOAT) as u64
    } else {
        true
    }
}
