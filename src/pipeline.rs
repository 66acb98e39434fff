// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestrator.
//!
//! [`TracePipeline`] wires the subsystems together: traces read from the
//! input channel get their sublayer metrics computed, are aggregated by the
//! concentrator and scored by the sampler; kept traces are forwarded on the
//! sampled channel. A ticker injects an in-band flush marker every bucket
//! interval, and each resulting batch of expired stats buckets is pushed to
//! the output channel.
//!
//! Shutdown is channel-driven: when every input sender is gone the
//! processing loop drains, emits one final forced flush and drops the
//! output sender, closing the stream. [`TracePipeline::shutdown`] instead
//! cancels every worker promptly without a final flush.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::concentrator::{Concentrator, StatsBucket};
use crate::config::{Config, ConfigError};
use crate::sampler::{Backend, ScoreSampler};
use crate::span::{flush_marker_trace, root_span_index, Trace};
use crate::sublayers::{compute_sublayers, set_sublayers_on_span};
use crate::telemetry::{DogstatsdEmitter, NoopEmitter, SharedEmitter};
use crate::time::{Clock, SystemClock};

/// Error preventing the pipeline from starting.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize dogstatsd client: {0}")]
    Telemetry(anyhow::Error),
}

/// Channel endpoints handed to the caller by [`TracePipeline::start`].
pub struct PipelineChannels {
    /// Finished traces go in here. Dropping every clone closes the
    /// pipeline gracefully.
    pub traces: mpsc::Sender<Trace>,
    /// Batches of expired stats buckets, one per flush.
    pub stats: mpsc::Receiver<Vec<StatsBucket>>,
    /// Raw traces kept by the sampler.
    pub sampled: mpsc::Receiver<Trace>,
}

/// The in-process core of the trace agent.
pub struct TracePipeline {
    config: Config,
    concentrator: Arc<Concentrator>,
    sampler: Arc<ScoreSampler>,
    backend: Arc<Backend>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TracePipeline {
    /// Build a pipeline from `config`, with a system clock and, when a
    /// statsd host is configured, a dogstatsd telemetry emitter.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let emitter: SharedEmitter = match &config.statsd_host {
            Some(host) => Arc::new(
                DogstatsdEmitter::new(host, config.statsd_port)
                    .map_err(PipelineError::Telemetry)?,
            ),
            None => Arc::new(NoopEmitter),
        };
        Self::with_clock_and_emitter(config, Arc::new(SystemClock::new()), emitter)
    }

    /// Build a pipeline with an injected clock and telemetry emitter.
    pub fn with_clock_and_emitter(
        mut config: Config,
        clock: Arc<dyn Clock>,
        emitter: SharedEmitter,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let concentrator = Arc::new(Concentrator::new(&config, clock, emitter));
        let backend = Arc::new(Backend::new(config.decay_period));
        let sampler = Arc::new(ScoreSampler::new(
            backend.clone(),
            config.target_traces_per_second,
        ));
        Ok(TracePipeline {
            config,
            concentrator,
            sampler,
            backend,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn concentrator(&self) -> &Arc<Concentrator> {
        &self.concentrator
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Spawn the worker tasks on the current tokio runtime and return the
    /// pipeline channel endpoints. Call once.
    pub fn start(&self) -> PipelineChannels {
        let capacity = self.config.channel_capacity;
        let (trace_tx, trace_rx) = mpsc::channel::<Trace>(capacity);
        let (stats_tx, stats_rx) = mpsc::channel::<Vec<StatsBucket>>(capacity);
        let (sampled_tx, sampled_rx) = mpsc::channel::<Trace>(capacity);

        let process = ProcessLoop {
            concentrator: self.concentrator.clone(),
            sampler: self.sampler.clone(),
            default_env: self.config.default_env.clone(),
            shutdown: self.shutdown.clone(),
        };
        let mut workers = self.lock_workers();
        workers.push(tokio::spawn(
            process.run(trace_rx, stats_tx, sampled_tx),
        ));

        let ticker = FlushTicker {
            interval: self.config.bucket_interval,
            traces: trace_tx.downgrade(),
            shutdown: self.shutdown.clone(),
        };
        workers.push(tokio::spawn(ticker.run()));

        let backend = self.backend.clone();
        workers.push(tokio::spawn(async move { backend.run().await }));

        info!("trace pipeline started");
        PipelineChannels {
            traces: trace_tx,
            stats: stats_rx,
            sampled: sampled_rx,
        }
    }

    /// Cancel every worker and wait for them to exit. Idempotent; also
    /// safe to call after a graceful channel-driven drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.backend.stop();
        let workers = {
            let mut guard = self.lock_workers();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("trace pipeline stopped");
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Main processing loop: input traces to stats, sampling decisions and
/// flush batches.
struct ProcessLoop {
    concentrator: Arc<Concentrator>,
    sampler: Arc<ScoreSampler>,
    default_env: String,
    shutdown: CancellationToken,
}

impl ProcessLoop {
    async fn run(
        self,
        mut traces: mpsc::Receiver<Trace>,
        stats: mpsc::Sender<Vec<StatsBucket>>,
        sampled: mpsc::Sender<Trace>,
    ) {
        loop {
            let trace = tokio::select! {
                trace = traces.recv() => trace,
                _ = self.shutdown.cancelled() => {
                    debug!("processing loop cancelled");
                    return;
                }
            };
            let Some(trace) = trace else {
                break;
            };

            if trace.len() == 1 && trace[0].is_flush_marker() {
                let buckets = self.concentrator.flush();
                if stats.send(buckets).await.is_err() {
                    debug!("stats receiver gone, dropping flush batch");
                }
                continue;
            }

            self.process_trace(trace, &sampled).await;
        }

        // Input closed: emit whatever is still buffered before the output
        // channel closes with us.
        let buckets = self.concentrator.force_flush();
        if !buckets.is_empty() && stats.send(buckets).await.is_err() {
            debug!("stats receiver gone, dropping final flush batch");
        }
        debug!("processing loop drained");
    }

    async fn process_trace(&self, mut trace: Trace, sampled: &mpsc::Sender<Trace>) {
        let Some(root) = root_span_index(&trace) else {
            warn!(spans = trace.len(), "dropping malformed trace without root");
            return;
        };

        let sublayers = compute_sublayers(&trace);
        set_sublayers_on_span(&mut trace[root], &sublayers);

        let env = if trace[root].env.is_empty() {
            self.default_env.clone()
        } else {
            trace[root].env.clone()
        };
        for span in &trace {
            if let Err(err) = self.concentrator.handle_new_span(span, &env) {
                debug!(%err, "span rejected by concentrator");
            }
        }

        if self.sampler.sample(&mut trace, root) && sampled.send(trace).await.is_err() {
            debug!("sampled-trace receiver gone, dropping trace");
        }
    }
}

/// Periodically injects the in-band flush marker. Holds only a weak sender
/// so it never keeps the input channel open on its own.
struct FlushTicker {
    interval: std::time::Duration,
    traces: mpsc::WeakSender<Trace>,
    shutdown: CancellationToken,
}

impl FlushTicker {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval is immediate; skip it so the
        // first flush happens one full interval in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(traces) = self.traces.upgrade() else {
                        debug!("input channel closed, flush ticker exiting");
                        return;
                    };
                    if traces.send(flush_marker_trace()).await.is_err() {
                        return;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("flush ticker cancelled");
                    return;
                }
            }
        }
    }
}
