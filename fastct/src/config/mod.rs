//! Daemon configuration module.
//!
//! Global process settings, the connection tracker parameters, and a set of
//! named tracking pipelines.
//!
//! # Example
//!
//! ```toml
//! [global.network]
//! host = "127.0.0.1"
//!
//! [global.logging]
//! level = "info"
//!
//! [conntrack]
//! buckets = 256
//! max_connections = 3000000
//!
//! [conntrack.timeouts]
//! tcp_established = 86400
//!
//! [pipelines.lan]
//! port = 9100
//! zone = 1
//! commit = true
//! ```

pub mod global;
pub mod loader;
pub mod pipeline;
pub mod validation;

pub use fastct_core::ConntrackConfig;
pub use global::{ControlConfig, GlobalConfig, LogLevel, LoggingConfig, RuntimeConfig};
pub use loader::{load_config, CliArgs};
pub use pipeline::PipelineConfig;
pub use validation::ConfigValidator;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Global process configuration
    pub global: GlobalConfig,

    /// Connection tracker parameters shared by every pipeline
    pub conntrack: ConntrackConfig,

    /// Tracking pipelines indexed by unique name
    pub pipelines: HashMap<String, PipelineConfig>,
}

impl DaemonConfig {
    /// Validate the entire configuration.
    ///
    /// Errors from every section are collected, so one run reports all of
    /// them.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.global.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.conntrack.validate() {
            errors.extend(e.into_iter().map(|err| format!("conntrack: {}", err)));
        }

        for (name, pipeline) in &self.pipelines {
            if let Err(e) = pipeline.validate() {
                for err in e {
                    errors.push(format!("Pipeline '{}' (port {}): {}", name, pipeline.port, err));
                }
            }
        }

        // Enabled pipelines each need their own port.
        let mut seen_ports = HashMap::new();
        for (name, pipeline) in self.enabled_pipelines() {
            if pipeline.port == 0 {
                continue;
            }
            if let Some(other) = seen_ports.insert(pipeline.port, name) {
                errors.push(format!(
                    "Duplicate port {} in pipelines '{}' and '{}'",
                    pipeline.port, other, name
                ));
            }
        }

        if self.enabled_pipelines().next().is_none() {
            errors.push(
                "No enabled pipelines configured. At least one pipeline must be defined and enabled."
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Enabled pipelines, sorted by name for stable startup order.
    pub fn enabled_pipelines(&self) -> impl Iterator<Item = (&String, &PipelineConfig)> {
        let mut enabled: Vec<_> = self.pipelines.iter().filter(|(_, p)| p.enabled).collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));
        enabled.into_iter()
    }
}
