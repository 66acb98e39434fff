// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static configuration for the pipeline and its subsystems.

use std::time::Duration;

/// Error returned when the configuration is invalid. Configuration errors
/// are fatal: nothing is constructed from a config that fails validation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("bucket_interval must be a positive duration")]
    InvalidBucketInterval,
    #[error("oldest_span_cutoff must be a positive duration")]
    InvalidOldestSpanCutoff,
    #[error("decay_period must be a positive duration")]
    InvalidDecayPeriod,
    #[error("default_env must not be empty")]
    EmptyDefaultEnv,
    #[error("target_traces_per_second must be positive, got {0}")]
    InvalidTargetRate(f64),
    #[error("channel_capacity must be positive")]
    InvalidChannelCapacity,
}

/// Configuration of the trace pipeline.
///
/// `validate` must be called before handing the config to any subsystem;
/// [`crate::pipeline::TracePipeline::new`] does so and refuses to start on
/// an invalid config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Width of each stats bucket.
    pub bucket_interval: Duration,
    /// Maximum span lateness tolerated by the concentrator, measured
    /// against the span end timestamp.
    pub oldest_span_cutoff: Duration,
    /// Env assigned to traces that carry none.
    pub default_env: String,
    /// Extra aggregation dimensions, as span meta keys. Sorted and deduped
    /// during validation so aggregation keys are formed deterministically.
    pub extra_aggregators: Vec<String>,
    /// Interval between two decays of the sampler scores.
    pub decay_period: Duration,
    /// Trace admission target for the score sampler, in traces per second.
    pub target_traces_per_second: f64,
    /// Destination of internal dogstatsd telemetry. Telemetry is disabled
    /// when no host is set.
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    /// Capacity of the bounded channels between pipeline stages.
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bucket_interval: Duration::from_secs(10),
            oldest_span_cutoff: Duration::from_secs(60),
            default_env: "none".to_string(),
            extra_aggregators: Vec::new(),
            decay_period: Duration::from_secs(1),
            target_traces_per_second: 10.0,
            statsd_host: None,
            statsd_port: 8125,
            channel_capacity: 1000,
        }
    }
}

impl Config {
    /// Check the config for fatal errors and normalize it.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.bucket_interval.is_zero() {
            return Err(ConfigError::InvalidBucketInterval);
        }
        if self.oldest_span_cutoff.is_zero() {
            return Err(ConfigError::InvalidOldestSpanCutoff);
        }
        if self.decay_period.is_zero() {
            return Err(ConfigError::InvalidDecayPeriod);
        }
        if self.default_env.is_empty() {
            return Err(ConfigError::EmptyDefaultEnv);
        }
        if !(self.target_traces_per_second > 0.0) {
            return Err(ConfigError::InvalidTargetRate(self.target_traces_per_second));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }
        self.extra_aggregators.sort();
        self.extra_aggregators.dedup();
        Ok(())
    }

    pub fn bucket_interval_ns(&self) -> i64 {
        self.bucket_interval.as_nanos() as i64
    }

    pub fn oldest_span_cutoff_ns(&self) -> i64 {
        self.oldest_span_cutoff.as_nanos() as i64
    }
}
