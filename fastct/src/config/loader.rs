//! Configuration loading and parsing.
//!
//! Loads configuration from a TOML file, environment variables and
//! command-line arguments, in that order of increasing precedence.

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use config::Config as ConfigLoader;
use std::path::{Path, PathBuf};

use super::DaemonConfig;

/// Command-line interface for the daemon.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Userspace connection tracking daemon", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "fastct.toml")]
    pub config: String,

    /// Host address pipelines bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Connection limit (overrides config file)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Control socket path (overrides config file)
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Load and parse daemon configuration.
///
/// Precedence, lowest first:
/// 1. Default values
/// 2. Configuration file
/// 3. Environment variables (`FASTCT_` prefix)
/// 4. Command-line arguments
///
/// `--print-default-config` and `--validate` exit the process.
pub fn load_config() -> Result<DaemonConfig> {
    let matches = CliArgs::command().get_matches();
    let cli =
        CliArgs::from_arg_matches(&matches).context("Failed to parse command-line arguments")?;

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = resolve_config(&cli)?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Build and validate the configuration described by `cli`.
pub fn resolve_config(cli: &CliArgs) -> Result<DaemonConfig> {
    let mut config = load_config_file(&cli.config)?;

    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

/// Load configuration from a TOML file.
///
/// A missing file yields the defaults.
pub fn load_config_file(path: &str) -> Result<DaemonConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(DaemonConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Environment variables are prefixed with `FASTCT_` and use `__` as a
/// separator.
///
/// Examples:
/// - `FASTCT_GLOBAL__LOGGING__LEVEL=debug`
/// - `FASTCT_CONNTRACK__MAX_CONNECTIONS=100000`
fn apply_env_overrides(config: &mut DaemonConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(
            config::Environment::with_prefix("FASTCT")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(host) = env_config.get_string("global.network.host") {
        config.global.network.host = host;
    }
    if let Ok(level) = env_config.get_string("global.logging.level") {
        if let Ok(parsed_level) = level.parse() {
            config.global.logging.level = parsed_level;
        }
    }
    if let Ok(path) = env_config.get_string("global.control.socket_path") {
        config.global.control.socket_path = PathBuf::from(path);
    }
    if let Ok(endpoint) = env_config.get_string("global.telemetry.otlp_endpoint") {
        config.global.telemetry.otlp_endpoint = endpoint;
    }
    if let Ok(max) = env_config.get_int("conntrack.max_connections") {
        match u32::try_from(max) {
            Ok(max) => config.conntrack.max_connections = max,
            Err(_) => tracing::warn!(value = max, "Ignoring out of range max_connections"),
        }
    }
    if let Ok(buckets) = env_config.get_int("conntrack.buckets") {
        match usize::try_from(buckets) {
            Ok(buckets) => config.conntrack.buckets = buckets,
            Err(_) => tracing::warn!(value = buckets, "Ignoring out of range buckets"),
        }
    }

    Ok(())
}

/// Apply command-line argument overrides.
fn apply_cli_overrides(config: &mut DaemonConfig, cli: &CliArgs) {
    if let Some(ref host) = cli.host {
        config.global.network.host = host.clone();
    }

    if let Some(ref level_str) = cli.log_level {
        if let Ok(level) = level_str.parse() {
            config.global.logging.level = level;
        } else {
            tracing::warn!(level = %level_str, "Invalid log level specified, ignoring");
        }
    }

    if let Some(max) = cli.max_connections {
        config.conntrack.max_connections = max;
    }

    if let Some(ref path) = cli.control_socket {
        config.global.control.socket_path = path.clone();
    }
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    println!("{}", default_config_toml()?);
    Ok(())
}

/// Defaults plus one sample pipeline, rendered as TOML.
pub fn default_config_toml() -> Result<String> {
    let mut default_config = DaemonConfig::default();
    default_config.pipelines.insert(
        "default".to_string(),
        super::PipelineConfig {
            port: 9100,
            ..super::PipelineConfig::default()
        },
    );
    toml::to_string_pretty(&default_config).context("Failed to serialize default config")
}
