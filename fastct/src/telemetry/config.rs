use serde::{Deserialize, Serialize};

/// Telemetry configuration.
///
/// Metrics are exported to an OTLP collector over gRPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint (e.g., "http://localhost:4317").
    pub otlp_endpoint: String,

    /// Service name reported with every metric.
    pub service_name: String,

    /// Enable metrics export.
    ///
    /// Exported metrics include:
    /// - Tracked, new, established, related and invalid packet counts
    /// - Live connection count and admission limit
    /// - Expirations and limit refusals
    /// - Ingress worker and receive error counts
    pub enable_metrics: bool,

    /// Metrics export interval in seconds.
    pub export_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "fastct".to_string(),
            enable_metrics: false,
            export_interval_secs: 60,
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.enable_metrics {
            return Ok(());
        }

        if !(self.otlp_endpoint.starts_with("http://") || self.otlp_endpoint.starts_with("https://"))
        {
            errors.push(format!(
                "telemetry.otlp_endpoint must be an http(s) URL, got '{}'",
                self.otlp_endpoint
            ));
        }

        if self.service_name.is_empty() {
            errors.push("telemetry.service_name must not be empty".to_string());
        }

        if self.export_interval_secs == 0 {
            errors.push("telemetry.export_interval_secs must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
