//! Per-function call metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Receives one observation per hop per call, whatever the outcome.
pub trait MetricsSink: Send + Sync {
    fn observe(&self, endpoint: &str, failed: bool, duration: Duration);
}

/// Discards observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn observe(&self, _endpoint: &str, _failed: bool, _duration: Duration) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FunctionStats {
    pub calls: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub max_ms: f64,
    pub last_call: Option<DateTime<Utc>>,
}

impl FunctionStats {
    fn record(&mut self, failed: bool, duration: Duration) {
        let ms = duration.as_micros() as f64 / 1000.0;
        self.calls += 1;
        self.last_call = Some(Utc::now());
        if failed {
            self.failures += 1;
        }
        self.total_ms += ms;
        if ms > self.max_ms {
            self.max_ms = ms;
        }
    }
}

/// In-memory aggregate keyed by function endpoint.
#[derive(Debug, Default)]
pub struct FunctionMetrics {
    functions: DashMap<String, FunctionStats>,
}

impl FunctionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &str) -> Option<FunctionStats> {
        self.functions.get(endpoint).map(|s| *s)
    }

    /// JSON object of every function's stats, keys sorted.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut entries: Vec<(String, FunctionStats)> = self
            .functions
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut map = serde_json::Map::new();
        for (endpoint, stats) in entries {
            let mean_ms = if stats.calls == 0 {
                0.0
            } else {
                stats.total_ms / stats.calls as f64
            };
            map.insert(
                endpoint,
                serde_json::json!({
                    "calls": stats.calls,
                    "failures": stats.failures,
                    "mean_ms": mean_ms,
                    "max_ms": stats.max_ms,
                    "last_call": stats.last_call.map(|t| t.to_rfc3339()),
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}

impl MetricsSink for FunctionMetrics {
    fn observe(&self, endpoint: &str, failed: bool, duration: Duration) {
        tracing::debug!(endpoint, failed, duration_ms = duration.as_millis() as u64, "Hop observed");
        self.functions
            .entry(endpoint.to_string())
            .or_default()
            .record(failed, duration);
    }
}
