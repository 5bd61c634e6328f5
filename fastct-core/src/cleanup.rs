//! Background expiration sweeper.

use crate::error::{Error, Result};
use crate::table::ConnTable;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Handle to the thread that periodically calls [`ConnTable::clean`].
///
/// Dropping the handle stops and joins the thread.
pub struct CleanupThread {
    exit_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupThread {
    /// Start sweeping `table`.
    ///
    /// After each round the thread sleeps until the next bucket is due, but
    /// never less than `interval_ms`. If a round left expired entries
    /// behind it retries after `retry_ms` instead.
    pub fn spawn(table: Arc<ConnTable>, interval_ms: u64, retry_ms: u64) -> Result<Self> {
        let (exit_tx, exit_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("ct-clean".to_string())
            .spawn(move || {
                info!("Conntrack cleanup thread started");
                loop {
                    let now = table.clock().now_ms();
                    let report = table.clean(now);
                    if report.evicted > 0 {
                        debug!(
                            evicted = report.evicted,
                            remaining = table.n_conns(),
                            "Expired connections swept"
                        );
                    }

                    let wait_ms = sleep_ms(report.next_wakeup, now, interval_ms, retry_ms);
                    match exit_rx.recv_timeout(Duration::from_millis(wait_ms)) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Conntrack cleanup thread stopped");
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        Ok(Self {
            exit_tx: Some(exit_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        drop(self.exit_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Conntrack cleanup thread panicked");
            }
        }
    }
}

impl Drop for CleanupThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delay before the next round: `retry_ms` when a bucket is already due,
/// otherwise until `next_wakeup` but never less than `interval_ms`.
fn sleep_ms(next_wakeup: u64, now: u64, interval_ms: u64, retry_ms: u64) -> u64 {
    if next_wakeup <= now {
        retry_ms
    } else {
        (next_wakeup - now).max(interval_ms)
    }
}
