//! Telemetry: structured logging and Prometheus metrics.
//!
//! ```rust,no_run
//! use wmsnotes_core::telemetry::{init_telemetry, LoggingConfig, MetricsConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let metrics = init_telemetry(&LoggingConfig::default(), &MetricsConfig::default())?;
//! println!("{}", metrics.render());
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsHandle};

/// Initialize logging, then metrics. Call once at startup.
pub fn init_telemetry(logging: &LoggingConfig, metrics: &MetricsConfig) -> anyhow::Result<MetricsHandle> {
    init_logging(logging)?;
    init_metrics(metrics)
}
