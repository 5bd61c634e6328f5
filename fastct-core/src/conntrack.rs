//! Tracker lifecycle: a table plus its cleanup thread.

use crate::cleanup::CleanupThread;
use crate::clock::{Clock, MonotonicClock};
use crate::config::ConntrackConfig;
use crate::error::Result;
use crate::table::ConnTable;
use std::ops::Deref;
use std::sync::Arc;
use tracing::info;

/// A running connection tracker.
///
/// Dereferences to the [`ConnTable`]; clone [`Conntrack::table`] to share
/// it with packet workers. Shutting down (or dropping) the tracker stops
/// the sweeper and releases every connection.
pub struct Conntrack {
    table: Arc<ConnTable>,
    cleaner: Option<CleanupThread>,
}

impl Conntrack {
    pub fn new(config: &ConntrackConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: &ConntrackConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let table = Arc::new(ConnTable::new(config, clock)?);
        let cleaner = CleanupThread::spawn(
            Arc::clone(&table),
            config.clean_interval_ms,
            config.clean_retry_ms,
        )?;

        info!(
            buckets = config.buckets,
            limit = config.max_connections,
            "Connection tracker initialized"
        );

        Ok(Self {
            table,
            cleaner: Some(cleaner),
        })
    }

    pub fn table(&self) -> &Arc<ConnTable> {
        &self.table
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(mut cleaner) = self.cleaner.take() {
            cleaner.stop();
            let released = self.table.flush(None);
            info!(released, "Connection tracker shut down");
        }
    }
}

impl Deref for Conntrack {
    type Target = ConnTable;

    fn deref(&self) -> &ConnTable {
        &self.table
    }
}

impl Drop for Conntrack {
    fn drop(&mut self) {
        self.stop();
    }
}
