//! Prometheus metrics.
//!
//! Counters are recorded with the `metrics` macros where things happen; this
//! module installs the exporter and describes them:
//!
//! | metric | labels |
//! |---|---|
//! | `wmsnotes_events_appended_total` | `log` |
//! | `wmsnotes_commands_total` | `command`, `outcome` |
//! | `wmsnotes_snapshot_cache_total` | `result` |
//! | `wmsnotes_sync_passes_total` | |
//! | `wmsnotes_sync_pass_duration_seconds` | |
//! | `wmsnotes_sync_aggregates_total` | `outcome` |
//! | `wmsnotes_errors_total` | `code`, `category` |

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address of the Prometheus scrape endpoint; no HTTP listener without one
    #[serde(default)]
    pub listen_address: Option<SocketAddr>,

    /// Histogram buckets for durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_address: None,
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Access to the installed recorder.
pub struct MetricsHandle {
    prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHandle")
            .field("prometheus", &self.prometheus.is_some())
            .finish()
    }
}

impl MetricsHandle {
    pub fn disabled() -> Self {
        Self { prometheus: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus.is_some()
    }

    /// All metrics in Prometheus text format; empty when disabled.
    pub fn render(&self) -> String {
        self.prometheus
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// With a `listen_address` the exporter serves `/metrics` itself, which needs
/// a running tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsHandle> {
    if !config.enabled {
        return Ok(MetricsHandle::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match config.listen_address {
        Some(address) => {
            let (recorder, exporter) = builder.with_http_listener(address).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Metrics exporter stopped");
                }
            });
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();
    tracing::info!(listen_address = ?config.listen_address, "Metrics initialized");

    Ok(MetricsHandle {
        prometheus: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("wmsnotes_events_appended_total", "Events appended to an event log");
    describe_counter!("wmsnotes_commands_total", "Commands processed, by command and outcome");
    describe_counter!(
        "wmsnotes_snapshot_cache_total",
        "Snapshot cache lookups, by result (hit, miss, error)"
    );
    describe_counter!("wmsnotes_sync_passes_total", "Completed synchronization passes");
    describe_histogram!(
        "wmsnotes_sync_pass_duration_seconds",
        "Duration of a synchronization pass in seconds"
    );
    describe_counter!(
        "wmsnotes_sync_aggregates_total",
        "Aggregates visited by synchronization, by outcome"
    );
    describe_counter!("wmsnotes_errors_total", "Errors constructed, by code and category");
}
