// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend storing the state required to run the sampling algorithms.
//!
//! The implementation is based on counters with geometric decay: every
//! `decay_period` each score is divided by `decay_factor`, so a steady
//! stream of traces converges to a score proportional to its rate. The
//! stored scores approximate real counts scaled by `count_scale_factor`,
//! with a steady-state bias between 1 and `decay_factor`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::signature::Signature;

/// At every decay tick, how much we reduce the scores.
/// Lower value is more reactive, but forgets quicker.
const DECAY_FACTOR: f64 = 1.125; // 9/8

/// Scores below `DECAY_FACTOR * MIN_SIGNATURE_SCORE_OFFSET` are dropped at
/// decay time so stale signatures cannot grow the map without bound.
const MIN_SIGNATURE_SCORE_OFFSET: f64 = 0.01;

/// `total_score` decays independently of the per-signature scores, so float
/// drift accumulates; every this many ticks it is recomputed from the map.
const RECONCILE_EVERY: u64 = 64;

#[derive(Debug, Default)]
struct BackendState {
    /// Score per signature.
    scores: HashMap<Signature, f64>,
    /// Score of all traces (equals the sum of all signature scores).
    total_score: f64,
    /// Score of sampled traces.
    sampled_score: f64,
    decay_ticks: u64,
}

/// Decayed score counters keyed by trace signature.
///
/// All operations go through one internal mutex: a decay is atomic with
/// respect to counts and getters, and any observer sees a consistent
/// snapshot.
#[derive(Debug)]
pub struct Backend {
    state: Mutex<BackendState>,

    /// Every `decay_period`, decay the scores.
    /// Lower value is more reactive, but forgets quicker.
    decay_period: Duration,
    decay_factor: f64,
    /// Factor to apply to move from a score to the represented number of
    /// traces per second. By definition of the decay formula:
    /// `count_scale_factor = (decay_factor / (decay_factor - 1)) * decay_period`.
    /// It also represents by how much a spike is smoothed: instantly
    /// receiving N times the same signature increases its immediate count
    /// by N / count_scale_factor.
    count_scale_factor: f64,

    exit: CancellationToken,
}

impl Backend {
    /// Return an initialized Backend decaying scores every `decay_period`.
    pub fn new(decay_period: Duration) -> Self {
        // With this factor, any past trace counts for less than 50% after
        // 6 periods and less than 1% after 39.
        Backend {
            state: Mutex::default(),
            decay_period,
            decay_factor: DECAY_FACTOR,
            count_scale_factor: (DECAY_FACTOR / (DECAY_FACTOR - 1.0))
                * decay_period.as_secs_f64(),
            exit: CancellationToken::new(),
        }
    }

    /// Run the decay loop until [`Backend::stop`] is called.
    pub async fn run(&self) {
        let start = Instant::now() + self.decay_period;
        let mut ticker = interval_at(start, self.decay_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.decay_score(),
                _ = self.exit.cancelled() => return,
            }
        }
    }

    /// Stop the decay loop. Safe to call more than once.
    pub fn stop(&self) {
        self.exit.cancel();
    }

    /// Count an incoming signature.
    pub fn count_signature(&self, signature: Signature) {
        let mut state = self.lock();
        *state.scores.entry(signature).or_insert(0.0) += 1.0;
        state.total_score += 1.0;
    }

    /// Count a trace kept by the sampler.
    pub fn count_sample(&self) {
        self.lock().sampled_score += 1.0;
    }

    /// Score of a signature, normalized to a number of traces per second.
    pub fn get_signature_score(&self, signature: Signature) -> f64 {
        self.lock().scores.get(&signature).copied().unwrap_or(0.0) / self.count_scale_factor
    }

    /// Global score of all sampled traces, in traces per second.
    pub fn get_sampled_score(&self) -> f64 {
        self.lock().sampled_score / self.count_scale_factor
    }

    /// Global score of all seen traces, in traces per second.
    pub fn get_total_score(&self) -> f64 {
        self.lock().total_score / self.count_scale_factor
    }

    /// Upper bound of the global count of sampled traces, overestimating
    /// the real score by the high limit of the decay bias.
    pub fn get_upper_sampled_score(&self) -> f64 {
        self.get_sampled_score() * self.decay_factor
    }

    /// Number of different signatures seen recently.
    pub fn get_cardinality(&self) -> usize {
        self.lock().scores.len()
    }

    /// Apply the decay to the rolling counters, evicting entries whose
    /// score became too small to matter.
    pub fn decay_score(&self) {
        let mut state = self.lock();
        let factor = self.decay_factor;
        state.scores.retain(|_, score| {
            if *score > factor * MIN_SIGNATURE_SCORE_OFFSET {
                *score /= factor;
                true
            } else {
                false
            }
        });
        state.total_score /= factor;
        state.sampled_score /= factor;

        state.decay_ticks += 1;
        if state.decay_ticks % RECONCILE_EVERY == 0 {
            state.total_score = state.scores.values().sum();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        // The state mutex cannot be poisoned: no panic can happen while
        // it is held.
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
