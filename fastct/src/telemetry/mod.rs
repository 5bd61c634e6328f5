//! # Telemetry and Observability
//!
//! Structured logging through `tracing`, plus event-driven metrics exported
//! over OTLP.
//!
//! ## Architecture
//!
//! 1. **Hot path (ingress workers)**: one fire-and-forget event per batch
//! 2. **Metrics task**: a tokio task aggregates events into OpenTelemetry
//!    instruments; table-wide gauges are read at export time
//! 3. **Logging**: lifecycle and errors only, never per packet
//!
//! ## Usage
//!
//! ```ignore
//! use fastct::telemetry::{init_logging, init_telemetry, record_metric, MetricsEvent};
//!
//! init_logging(&config.global.logging, "fastct")?;
//! let metrics = init_telemetry(&config.global, runtime.handle(), table).await?;
//! record_metric(MetricsEvent::ReceiveError);
//! ```

pub mod config;
pub mod metrics;

pub use config::TelemetryConfig;
pub use metrics::{record_metric, start_metrics_task, MetricsEvent, MetricsHandle};

use crate::config::{GlobalConfig, LoggingConfig};
use anyhow::Result;
use fastct_core::ConnTable;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Start metrics export when enabled.
///
/// Logging is installed separately by [`init_logging`], before anything
/// else starts. Returns the metrics task handle for graceful shutdown.
pub async fn init_telemetry(
    config: &GlobalConfig,
    runtime_handle: &tokio::runtime::Handle,
    table: Arc<ConnTable>,
) -> Result<MetricsHandle> {
    let telemetry = &config.telemetry;
    let metrics_handle = if telemetry.enable_metrics {
        tracing::info!(
            service = %telemetry.service_name,
            endpoint = %telemetry.otlp_endpoint,
            interval_secs = telemetry.export_interval_secs,
            "Starting event-driven metrics system"
        );
        start_metrics_task(telemetry, runtime_handle, table).await?
    } else {
        tracing::warn!("Metrics collection is disabled");
        MetricsHandle::disabled()
    };

    tracing::info!("Telemetry system initialized");
    Ok(metrics_handle)
}

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig, service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_string()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_ansi(config.enable_colors)
        .with_line_number(config.include_file_line)
        .with_file(config.include_file_line);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(service = %service_name, level = %config.level, "Logging initialized");
    Ok(())
}
