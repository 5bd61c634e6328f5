//! Cross-section configuration checks.

use super::DaemonConfig;

/// Configuration validator trait.
pub trait ConfigValidator {
    /// Returns `Ok(())` if valid, or a list of error messages if invalid.
    fn validate(&self) -> Result<(), Vec<String>>;
}

impl ConfigValidator for DaemonConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        DaemonConfig::validate(self)
    }
}

impl ConfigValidator for super::PipelineConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        super::PipelineConfig::validate(self)
    }
}

/// Check that sizing choices make sense together.
///
/// Findings are logged as warnings and returned; they never fail startup.
pub fn validate_resource_limits(config: &DaemonConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let pipelines = config.enabled_pipelines().count();
    let threads = pipelines * config.global.netio.workers;
    let cpus = num_cpus::get();
    if threads > cpus * 2 {
        warnings.push(format!(
            "{} ingress threads ({} pipelines x {} workers) on {} CPUs will contend for cores",
            threads, pipelines, config.global.netio.workers, cpus
        ));
    }

    let ct = &config.conntrack;
    let per_bucket = ct.max_connections as usize / ct.buckets.max(1);
    if per_bucket > 1 << 16 {
        warnings.push(format!(
            "max_connections ({}) over {} buckets allows {} connections per bucket; \
             consider more buckets",
            ct.max_connections, ct.buckets, per_bucket
        ));
    }

    if config.global.netio.pin_to_cpu && threads > cpus {
        warnings.push(format!(
            "pin_to_cpu with {} ingress threads on {} CPUs leaves some threads unpinned",
            threads, cpus
        ));
    }

    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    warnings
}
