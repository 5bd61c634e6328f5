//! Global daemon configuration.
//!
//! Settings that apply to the whole process rather than to one pipeline:
//! ingress binding, the tokio runtime, logging, the control socket and
//! telemetry.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Ingress binding configuration
    pub network: NetworkConfig,

    /// Runtime (async executor) configuration
    pub runtime: RuntimeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Frame ingress worker configuration
    pub netio: crate::netio::NetIoConfig,

    /// Control socket configuration
    pub control: ControlConfig,

    /// Telemetry configuration
    pub telemetry: crate::telemetry::TelemetryConfig,
}

impl GlobalConfig {
    /// Validate global configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.network.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.runtime.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.netio.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.control.validate() {
            errors.extend(e);
        }

        if let Err(e) = self.telemetry.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Ingress binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host address the pipeline sockets bind to.
    ///
    /// Each pipeline binds its own port on this address.
    ///
    /// **Default:** `"127.0.0.1"`
    pub host: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        if self.host.parse::<std::net::IpAddr>().is_err() {
            return Err(vec![format!("Invalid host address: {}", self.host)]);
        }
        Ok(())
    }
}

/// Runtime configuration for the async executor.
///
/// The runtime hosts the control server and the metrics task. Frame
/// ingress runs on its own native threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads for the Tokio runtime.
    ///
    /// **Default:** 2
    pub worker_threads: usize,

    /// Maximum number of blocking threads in the pool.
    ///
    /// **Default:** 64
    pub max_blocking_threads: usize,

    /// Thread name prefix for runtime threads.
    ///
    /// **Default:** `"fastct-rt"`
    pub thread_name: String,

    /// Stack size for each thread in bytes.
    ///
    /// **Default:** 2 MB
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 64,
            thread_name: "fastct-rt".to_string(),
            thread_stack_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker_threads == 0 {
            errors.push("worker_threads must be > 0".to_string());
        }

        if self.worker_threads > 1024 {
            errors.push("worker_threads is unreasonably high (> 1024)".to_string());
        }

        if self.max_blocking_threads == 0 {
            errors.push("max_blocking_threads must be > 0".to_string());
        }

        if self.thread_stack_size < 128 * 1024 {
            errors.push("thread_stack_size too small (< 128 KB)".to_string());
        }

        if self.thread_stack_size > 64 * 1024 * 1024 {
            errors.push("thread_stack_size too large (> 64 MB)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level for the entire application. `RUST_LOG` takes precedence.
    ///
    /// **Default:** `Info`
    pub level: LogLevel,

    /// Enable ANSI color codes in logs.
    ///
    /// **Default:** `true`
    pub enable_colors: bool,

    /// Include source file and line number in logs.
    ///
    /// **Default:** `true`
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_colors: true,
            include_file_line: true,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// Control socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serve the control protocol.
    ///
    /// **Default:** `true`
    pub enabled: bool,

    /// Path of the Unix domain socket. A stale socket file is replaced.
    ///
    /// **Default:** `"/tmp/fastct.sock"`
    pub socket_path: PathBuf,

    /// Maximum concurrently served control clients.
    ///
    /// **Default:** 16
    pub max_clients: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from("/tmp/fastct.sock"),
            max_clients: 16,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.enabled {
            return Ok(());
        }

        if self.socket_path.as_os_str().is_empty() {
            errors.push("control.socket_path must not be empty".to_string());
        }

        if self.max_clients == 0 {
            errors.push("control.max_clients must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
