//! Tracker construction parameters.

use crate::timeout::TimeoutPolicy;
use serde::{Deserialize, Serialize};

/// Default shard count.
pub const DEFAULT_BUCKETS: usize = 256;

/// Default admission limit.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 3_000_000;

/// Connection tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    /// Number of independently locked buckets. Must be a power of two.
    ///
    /// **Default:** 256
    pub buckets: usize,

    /// Live connection limit; admissions beyond it are refused.
    ///
    /// Adjustable at runtime through `set_limit`.
    ///
    /// **Default:** 3,000,000
    pub max_connections: u32,

    /// Per-class timeouts in seconds.
    pub timeouts: TimeoutPolicy,

    /// Only a SYN may open a TCP connection (no mid-stream pickup).
    ///
    /// **Default:** `false`
    pub tcp_strict: bool,

    /// Drop IPv4 packets with a bad header checksum as untrackable.
    ///
    /// **Default:** `true`
    pub verify_checksums: bool,

    /// Shortest the cleanup thread sleeps between rounds, in milliseconds.
    /// Rounds that leave work behind use `clean_retry_ms` instead.
    ///
    /// **Default:** 5000
    pub clean_interval_ms: u64,

    /// Retry delay after a round left work behind, in milliseconds.
    ///
    /// **Default:** 200
    pub clean_retry_ms: u64,

    /// Fixed hash salt. Random when unset.
    pub hash_seed: Option<u64>,
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeouts: TimeoutPolicy::default(),
            tcp_strict: false,
            verify_checksums: true,
            clean_interval_ms: 5_000,
            clean_retry_ms: 200,
            hash_seed: None,
        }
    }
}

impl ConntrackConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.buckets == 0 || !self.buckets.is_power_of_two() {
            errors.push(format!(
                "buckets must be a non-zero power of two, got {}",
                self.buckets
            ));
        }

        if self.buckets > 1 << 20 {
            errors.push("buckets is unreasonably high (> 1048576)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("max_connections must be > 0".to_string());
        }

        if let Err(e) = self.timeouts.validate() {
            errors.extend(e);
        }

        if self.clean_retry_ms == 0 {
            errors.push("clean_retry_ms must be > 0".to_string());
        }

        if self.clean_interval_ms < self.clean_retry_ms {
            errors.push(format!(
                "clean_interval_ms ({}) must not be below clean_retry_ms ({})",
                self.clean_interval_ms, self.clean_retry_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
