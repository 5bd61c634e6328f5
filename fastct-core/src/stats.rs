//! Tracker event counters.
//!
//! Plain relaxed atomics bumped from the hot path; readers take a
//! [`CtStatsSnapshot`] and accept that fields are not mutually consistent.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CtStats {
    pub(crate) created: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) flushed: AtomicU64,
    pub(crate) recreated: AtomicU64,
    pub(crate) limit_refused: AtomicU64,
    pub(crate) proto_refused: AtomicU64,
    pub(crate) invalid: AtomicU64,
    pub(crate) untrackable: AtomicU64,
    pub(crate) related: AtomicU64,
    pub(crate) long_sweeps: AtomicU64,
}

impl CtStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, connections: u32, limit: u32) -> CtStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CtStatsSnapshot {
            connections,
            limit,
            created: load(&self.created),
            expired: load(&self.expired),
            flushed: load(&self.flushed),
            recreated: load(&self.recreated),
            limit_refused: load(&self.limit_refused),
            proto_refused: load(&self.proto_refused),
            invalid: load(&self.invalid),
            untrackable: load(&self.untrackable),
            related: load(&self.related),
            long_sweeps: load(&self.long_sweeps),
        }
    }
}

/// Point-in-time copy of the counters plus table occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CtStatsSnapshot {
    pub connections: u32,
    pub limit: u32,
    pub created: u64,
    pub expired: u64,
    pub flushed: u64,
    /// Connections retired and reopened by their own packet (TCP reuse, forced commits).
    pub recreated: u64,
    /// Admissions refused because the table was full.
    pub limit_refused: u64,
    /// Admissions refused by the protocol's `valid_new`.
    pub proto_refused: u64,
    /// Packets that contradicted their connection's state.
    pub invalid: u64,
    /// Packets no tuple could be extracted from.
    pub untrackable: u64,
    pub related: u64,
    /// Bucket sweeps that hit their eviction limit.
    pub long_sweeps: u64,
}

impl std::fmt::Display for CtStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connections={} limit={} created={} expired={} flushed={} recreated={} \
             limit_refused={} proto_refused={} invalid={} untrackable={} related={} long_sweeps={}",
            self.connections,
            self.limit,
            self.created,
            self.expired,
            self.flushed,
            self.recreated,
            self.limit_refused,
            self.proto_refused,
            self.invalid,
            self.untrackable,
            self.related,
            self.long_sweeps
        )
    }
}
