//! Tracking pipeline configuration.
//!
//! A pipeline is one ingress port whose frames are tracked with a fixed set
//! of options: zone, address family, commit/force, and the mark, labels and
//! helper written to committed connections.
//!
//! ```toml
//! [pipelines.lan]
//! port = 9100
//! zone = 1
//! l3 = "ipv4"
//! commit = true
//! mark = "0x10/0xf0"
//! ```

use fastct_core::{ExecuteOptions, L3Type, Masked};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration of one tracking pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// UDP port the pipeline receives frames on.
    pub port: u16,

    /// Conntrack zone the pipeline tracks in.
    ///
    /// **Default:** 0
    pub zone: u16,

    /// Address family of the tracked traffic: `"ipv4"` or `"ipv6"`.
    ///
    /// **Default:** `"ipv4"`
    pub l3: String,

    /// Store new connections and apply state changes.
    ///
    /// **Default:** `true`
    pub commit: bool,

    /// Replace connections the traffic contradicts.
    ///
    /// **Default:** `false`
    pub force: bool,

    /// Mark to set on commit, as `value` or `value/mask`.
    pub mark: Option<String>,

    /// Labels to set on commit, as `value` or `value/mask`.
    pub labels: Option<String>,

    /// Application-layer helper name. Recorded on connections only.
    pub helper: Option<String>,

    /// Send each frame's verdict back to the sender.
    ///
    /// **Default:** `false`
    pub echo_verdicts: bool,

    /// Enable this pipeline.
    ///
    /// **Default:** `true`
    pub enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            port: 0,
            zone: 0,
            l3: "ipv4".to_string(),
            commit: true,
            force: false,
            mark: None,
            labels: None,
            helper: None,
            echo_verdicts: false,
            enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port must be set".to_string());
        }

        if let Err(e) = self.l3.parse::<L3Type>() {
            errors.push(e);
        }

        if let Some(mark) = &self.mark {
            if let Err(e) = parse_masked_u32(mark) {
                errors.push(format!("mark: {}", e));
            }
        }

        if let Some(labels) = &self.labels {
            if let Err(e) = parse_masked_u128(labels) {
                errors.push(format!("labels: {}", e));
            }
        }

        if let Some(helper) = &self.helper {
            if helper.is_empty() {
                errors.push("helper must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Address family of the pipeline.
    pub fn l3_type(&self) -> Result<L3Type, String> {
        self.l3.parse()
    }

    /// Tracking options every batch of this pipeline runs with.
    pub fn execute_options(&self) -> Result<ExecuteOptions, String> {
        let mut opts = if self.commit {
            ExecuteOptions::commit(self.zone)
        } else {
            ExecuteOptions::lookup(self.zone)
        };
        opts.force = self.force;

        if let Some(mark) = &self.mark {
            let (value, mask) = parse_masked_u32(mark)?;
            opts.mark = Some(Masked::<u32>::new(value, mask));
        }

        if let Some(labels) = &self.labels {
            let (value, mask) = parse_masked_u128(labels)?;
            opts.labels = Some(Masked::<u128>::new(value, mask));
        }

        opts.helper = self.helper.as_deref().map(Arc::from);
        Ok(opts)
    }
}

/// Parse `value` or `value/mask`, each decimal or `0x` hex. A missing mask
/// means every bit.
pub fn parse_masked_u32(s: &str) -> Result<(u32, u32), String> {
    let (value, mask) = split_masked(s);
    let value = parse_u32(value).ok_or_else(|| format!("invalid value '{}'", s))?;
    let mask = match mask {
        Some(m) => parse_u32(m).ok_or_else(|| format!("invalid mask '{}'", s))?,
        None => u32::MAX,
    };
    Ok((value, mask))
}

/// 128-bit variant of [`parse_masked_u32`].
pub fn parse_masked_u128(s: &str) -> Result<(u128, u128), String> {
    let (value, mask) = split_masked(s);
    let value = parse_u128(value).ok_or_else(|| format!("invalid value '{}'", s))?;
    let mask = match mask {
        Some(m) => parse_u128(m).ok_or_else(|| format!("invalid mask '{}'", s))?,
        None => u128::MAX,
    };
    Ok((value, mask))
}

fn split_masked(s: &str) -> (&str, Option<&str>) {
    match s.trim().split_once('/') {
        Some((v, m)) => (v.trim(), Some(m.trim())),
        None => (s.trim(), None),
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_u128(s: &str) -> Option<u128> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
