//! Pluggable "push metrics" capability (spec §6, §9 design notes).
//!
//! The original core touches a process-wide `StatLogger`/`StatWriter`/
//! `IntervalStatLogger`/`ResourceMonitor` singleton family. Per the
//! redesign flags these become explicit context objects the runtime is
//! handed at construction and only ever pushes into; `MetricsSink` is
//! that capability's whole surface. Whoever assembles a phase picks the
//! concrete sink (a real metrics backend, or [`NoopMetricsSink`] in
//! tests).

use std::sync::{Arc, Mutex};

/// A collaborator that receives periodic metric snapshots. The core never
/// queries it back (spec §6).
pub trait MetricsSink: Send + Sync {
    /// Record a named, numeric metric sample.
    fn record(&self, name: &str, value: f64);
}

/// Discards every sample. The default for tests and for phases that
/// don't wire up a real metrics backend.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _name: &str, _value: f64) {}
}

/// Forwards every sample to `tracing` as a structured event. Useful as a
/// drop-in sink when a phase doesn't have a dedicated metrics backend but
/// still wants the samples visible in logs.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value, "metric sample");
    }
}

/// Retains the last sample recorded under each name. Used by tests that
/// need to assert on what was pushed.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    samples: Mutex<Vec<(String, f64)>>,
}

impl RecordingMetricsSink {
    /// An empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All samples recorded so far, in arrival order.
    pub fn samples(&self) -> Vec<(String, f64)> {
        self.samples.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, name: &str, value: f64) {
        self.samples.lock().unwrap().push((name.to_string(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_retains_samples_in_order() {
        let sink = RecordingMetricsSink::new();
        sink.record("a.runtime_seconds", 1.5);
        sink.record("b.runtime_seconds", 2.5);
        assert_eq!(
            sink.samples(),
            vec![
                ("a.runtime_seconds".to_string(), 1.5),
                ("b.runtime_seconds".to_string(), 2.5),
            ]
        );
    }
}
