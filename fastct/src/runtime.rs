use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use tokio::runtime::Runtime;

/// Build the multi-threaded runtime hosting the control server and the
/// metrics task.
pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_name(config.thread_name.clone())
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .build()
        .context("building tokio runtime")
}
