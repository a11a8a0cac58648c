mod metrics;

pub use metrics::{names, HubMetrics, MetricsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "sluice_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Filter directives built from the configured levels.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle to the process-wide telemetry state.
pub struct TelemetryGuard {
    metrics: Arc<HubMetrics>,
}

impl TelemetryGuard {
    /// Shared counters/gauges for the hub and server.
    pub fn metrics(&self) -> Arc<HubMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize the telemetry subsystem. Call once at startup; a second call
/// leaves the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(fmt_layer).try_init() {
        eprintln!("sluice-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(HubMetrics::new()),
    }
}
