// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal telemetry counters and histograms.
//!
//! Subsystems receive a [`TelemetryEmitter`] at construction instead of
//! reaching for a process-wide client; the no-op implementation keeps tests
//! free of any setup. The dogstatsd implementation flushes metrics to a
//! local agent over UDP and never lets a send failure reach the caller.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use anyhow::anyhow;
use cadence::prelude::*;
use cadence::{QueuingMetricSink, StatsdClient, UdpMetricSink};
use tracing::error;

/// Counter incremented each time the concentrator rejects a late span.
pub const METRIC_LATE_SPAN: &str = "trace_agent.concentrator.late_span";
/// Histogram sampling the length of each flushed latency sketch.
pub const METRIC_DISTRIBUTION_LEN: &str = "trace_agent.distribution.len";

// Queue with a maximum capacity of 32K elements
const QUEUE_SIZE: usize = 32 * 1024;

/// Sink for the pipeline's internal metrics.
pub trait TelemetryEmitter: Send + Sync {
    fn count(&self, metric: &'static str, value: i64);
    fn histogram(&self, metric: &'static str, value: f64);
}

/// Emitter that drops everything. Default when no statsd endpoint is
/// configured.
#[derive(Debug, Default)]
pub struct NoopEmitter;

impl TelemetryEmitter for NoopEmitter {
    fn count(&self, _metric: &'static str, _value: i64) {}

    fn histogram(&self, _metric: &'static str, _value: f64) {}
}

/// Emitter flushing to a dogstatsd endpoint through a queuing UDP sink.
pub struct DogstatsdEmitter {
    client: StatsdClient,
}

impl DogstatsdEmitter {
    pub fn new(host: &str, port: u16) -> anyhow::Result<Self> {
        let server_address = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(anyhow!("invalid statsd address"))?;
        let socket = if server_address.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0")?
        } else {
            UdpSocket::bind("[::]:0")?
        };
        socket.set_nonblocking(true)?;
        let sink = QueuingMetricSink::with_capacity(
            UdpMetricSink::from(server_address, socket)?,
            QUEUE_SIZE,
        );
        Ok(DogstatsdEmitter {
            client: StatsdClient::from_sink("", sink),
        })
    }
}

impl TelemetryEmitter for DogstatsdEmitter {
    fn count(&self, metric: &'static str, value: i64) {
        if let Err(err) = self.client.count(metric, value) {
            error!("Error while sending metric: {}", err);
        }
    }

    fn histogram(&self, metric: &'static str, value: f64) {
        if let Err(err) = self.client.histogram(metric, value) {
            error!("Error while sending metric: {}", err);
        }
    }
}

/// Shared handle passed to the subsystems.
pub type SharedEmitter = Arc<dyn TelemetryEmitter>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Emitter recording every emission, for assertions in tests.
    #[derive(Default)]
    pub struct RecordingEmitter {
        pub counts: Mutex<Vec<(&'static str, i64)>>,
        pub histograms: Mutex<Vec<(&'static str, f64)>>,
    }

    impl TelemetryEmitter for RecordingEmitter {
        fn count(&self, metric: &'static str, value: i64) {
            self.counts.lock().unwrap().push((metric, value));
        }

        fn histogram(&self, metric: &'static str, value: f64) {
            self.histograms.lock().unwrap().push((metric, value));
        }
    }
}
