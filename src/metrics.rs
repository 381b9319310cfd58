//! Publisher telemetry.
//!
//! The engine reports through the [`PublisherMetrics`] capability instead of
//! process-wide statics. [`RecorderMetrics`] forwards to whatever recorder is
//! installed for the [`metrics`] facade (the binary installs the Prometheus
//! exporter); [`NoopMetrics`] discards everything.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use std::time::Duration;

pub const LAST_PUBLISHED_VERSION: &str = "last_published_version";
pub const PROVISIONED_VERSIONS: &str = "provisioned_versions";
pub const TICKS: &str = "ticks";
pub const TICK_LATENCY: &str = "tick_latency";
pub const PUBLISH_ERRORS: &str = "publish_errors";
pub const CHECKPOINT_ERRORS: &str = "checkpoint_errors";

/// Histogram buckets for [`TICK_LATENCY`], in milliseconds.
pub const TICK_LATENCY_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0];

/// Counters and gauges updated by the publisher engine.
///
/// Implementations must tolerate being read concurrently by an exporter.
pub trait PublisherMetrics: Send + Sync {
    fn set_last_published(&self, watermark: i64);
    fn row_published(&self);
    fn publish_error(&self);
    fn checkpoint_error(&self);
    fn tick_completed(&self, latency: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl PublisherMetrics for NoopMetrics {
    fn set_last_published(&self, _watermark: i64) {}
    fn row_published(&self) {}
    fn publish_error(&self) {}
    fn checkpoint_error(&self) {}
    fn tick_completed(&self, _latency: Duration) {}
}

/// Records into the global `metrics` recorder.
pub struct RecorderMetrics {
    last_published: Gauge,
    provisioned: Counter,
    ticks: Counter,
    tick_latency: Histogram,
    publish_errors: Counter,
    checkpoint_errors: Counter,
}

impl RecorderMetrics {
    pub fn new() -> Self {
        Self {
            last_published: gauge!(LAST_PUBLISHED_VERSION),
            provisioned: counter!(PROVISIONED_VERSIONS),
            ticks: counter!(TICKS),
            tick_latency: histogram!(TICK_LATENCY),
            publish_errors: counter!(PUBLISH_ERRORS),
            checkpoint_errors: counter!(CHECKPOINT_ERRORS),
        }
    }
}

impl Default for RecorderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherMetrics for RecorderMetrics {
    fn set_last_published(&self, watermark: i64) {
        self.last_published.set(watermark as f64);
    }

    fn row_published(&self) {
        self.provisioned.increment(1);
    }

    fn publish_error(&self) {
        self.publish_errors.increment(1);
    }

    fn checkpoint_error(&self) {
        self.checkpoint_errors.increment(1);
    }

    fn tick_completed(&self, latency: Duration) {
        self.tick_latency.record(latency.as_secs_f64() * 1000.0);
        self.ticks.increment(1);
    }
}
