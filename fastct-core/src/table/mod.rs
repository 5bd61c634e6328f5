//! The sharded connection table.
//!
//! Keys are spread over a fixed power-of-two array of [`Bucket`]s by a
//! salted symmetric hash. Every lookup, insert and state update for one
//! packet is a single critical section under its bucket's lock; nothing
//! ever holds two bucket locks at once.

use crate::bucket::{Bucket, BucketConns};
use crate::clock::Clock;
use crate::config::ConntrackConfig;
use crate::conn::{Conn, Direction};
use crate::error::{Error, Result};
use crate::execute::ExecuteOptions;
use crate::proto::{L4Proto, UpdateResult};
use crate::stats::{CtStats, CtStatsSnapshot};
use crate::timeout::TimeoutPolicy;
use crate::tuple::{ConnKey, HashBasis, PacketView};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Smallest per-bucket eviction budget for one sweep.
const MIN_SWEEP_BUDGET: usize = 16;

/// Why no connection was created for an unmatched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The protocol's `valid_new` rejected the packet.
    Protocol,
    /// The table is at its connection limit.
    Limit,
}

/// Result of [`ConnTable::lookup_or_create`].
///
/// Connections are returned as snapshots taken under the bucket lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The packet matched a live connection.
    Existing {
        conn: Conn,
        direction: Direction,
        /// False when the packet contradicts the connection's state; the
        /// connection was left untouched.
        conforming: bool,
    },
    /// No match; the packet opens a connection. When `committed` is false
    /// the connection was evaluated but not stored.
    Created { conn: Conn, committed: bool },
    Refused(Refusal),
}

impl Lookup {
    pub fn conn(&self) -> Option<&Conn> {
        match self {
            Lookup::Existing { conn, .. } | Lookup::Created { conn, .. } => Some(conn),
            Lookup::Refused(_) => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Lookup::Created { .. })
    }

    pub fn direction(&self) -> Direction {
        match self {
            Lookup::Existing { direction, .. } => *direction,
            _ => Direction::Original,
        }
    }
}

/// Result of one cleanup round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    /// Earliest time any bucket needs sweeping again.
    pub next_wakeup: u64,
    pub evicted: usize,
    /// Some bucket hit its eviction budget and is still due.
    pub pending: bool,
}

/// Connection table shared by packet workers, the cleanup thread and the
/// control plane.
pub struct ConnTable {
    buckets: Box<[Bucket]>,
    mask: usize,
    basis: HashBasis,
    n_conn: AtomicU32,
    n_conn_limit: AtomicU32,
    timeouts: TimeoutPolicy,
    min_timeout_ms: u64,
    tcp_strict: bool,
    verify_checksums: bool,
    clock: Arc<dyn Clock>,
    pub(crate) stats: CtStats,
    /// Last unsupported-helper warning, plus one; zero means never.
    pub(crate) helper_warned_at: AtomicU64,
}

impl ConnTable {
    pub fn new(config: &ConntrackConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::InvalidConfig(errors.join("; ")))?;

        let basis = match config.hash_seed {
            Some(seed) => HashBasis::from_seed(seed),
            None => HashBasis::random()?,
        };
        let buckets: Box<[Bucket]> = (0..config.buckets).map(|_| Bucket::new()).collect();

        Ok(Self {
            mask: config.buckets - 1,
            buckets,
            basis,
            n_conn: AtomicU32::new(0),
            n_conn_limit: AtomicU32::new(config.max_connections),
            timeouts: config.timeouts.clone(),
            min_timeout_ms: config.timeouts.min_millis(),
            tcp_strict: config.tcp_strict,
            verify_checksums: config.verify_checksums,
            clock,
            stats: CtStats::default(),
            helper_warned_at: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    #[inline]
    pub(crate) fn verify_checksums(&self) -> bool {
        self.verify_checksums
    }

    /// Live connections. Loosely consistent with concurrent updates.
    pub fn n_conns(&self) -> u32 {
        self.n_conn.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u32 {
        self.n_conn_limit.load(Ordering::Relaxed)
    }

    /// Change the admission limit. Existing connections above it are kept.
    pub fn set_limit(&self, limit: u32) {
        self.n_conn_limit.store(limit, Ordering::Relaxed);
        debug!(limit, "Connection limit updated");
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    pub fn stats(&self) -> CtStatsSnapshot {
        self.stats.snapshot(self.n_conns(), self.limit())
    }

    /// Bucket a key lives in.
    pub fn bucket_of(&self, key: &ConnKey) -> usize {
        self.basis.hash(key) as usize & self.mask
    }

    /// Find the connection for `key`, updating or creating it as `opts`
    /// dictate.
    ///
    /// - A live match runs the protocol update. On `Invalid` without
    ///   `opts.force` the connection is reported non-conforming and left
    ///   alone; with `force` (or on `New`) it is retired and the packet is
    ///   handled as unmatched.
    /// - An expired match is evicted on the spot when committing.
    /// - An unmatched packet creates a connection if the protocol accepts it
    ///   and the table is below its limit.
    /// - With `opts.commit` false nothing in the table changes.
    pub fn lookup_or_create(
        &self,
        key: &ConnKey,
        view: &PacketView,
        now: u64,
        opts: &ExecuteOptions,
    ) -> Lookup {
        let hash = self.basis.hash(key);
        let bucket = &self.buckets[hash as usize & self.mask];
        let mut conns = bucket.conns.lock();

        if let Some((idx, direction)) = conns.find(key) {
            if conns.conn(idx).is_expired(now) {
                if opts.commit {
                    conns.remove(idx);
                    self.n_conn.fetch_sub(1, Ordering::Relaxed);
                    CtStats::bump(&self.stats.expired);
                }
            } else if let Some(found) =
                self.update_existing(&mut conns, idx, direction, view, now, opts)
            {
                return found;
            }
        }

        self.create(&mut conns, key, hash, view, now, opts)
    }

    /// Read-only lookup of a live connection.
    pub fn lookup(&self, key: &ConnKey, now: u64) -> Option<(Conn, Direction)> {
        let bucket = &self.buckets[self.bucket_of(key)];
        let conns = bucket.conns.lock();
        let (idx, direction) = conns.find(key)?;
        let conn = conns.conn(idx);
        if conn.is_expired(now) {
            None
        } else {
            Some((conn.clone(), direction))
        }
    }

    /// Returns `None` when the connection was retired and the packet should
    /// be treated as unmatched.
    fn update_existing(
        &self,
        conns: &mut BucketConns,
        idx: usize,
        direction: Direction,
        view: &PacketView,
        now: u64,
        opts: &ExecuteOptions,
    ) -> Option<Lookup> {
        let reply = direction.is_reply();

        if !opts.commit {
            let mut scratch = conns.conn(idx).clone();
            return match scratch.proto.update(view, reply) {
                UpdateResult::Valid => Some(Lookup::Existing {
                    conn: scratch,
                    direction,
                    conforming: true,
                }),
                UpdateResult::Invalid if !opts.force => {
                    CtStats::bump(&self.stats.invalid);
                    Some(Lookup::Existing {
                        conn: scratch,
                        direction,
                        conforming: false,
                    })
                }
                _ => None,
            };
        }

        match conns.conn_mut(idx).proto.update(view, reply) {
            UpdateResult::Valid => {
                let class = conns.conn(idx).proto.timeout_class();
                conns.refresh(idx, class, now.saturating_add(self.timeouts.millis(class)));
                let conn = conns.conn_mut(idx);
                conn.account(direction, view.l3_len);
                apply_marks(conn, opts);
                Some(Lookup::Existing {
                    conn: conn.clone(),
                    direction,
                    conforming: true,
                })
            }
            UpdateResult::Invalid if !opts.force => {
                CtStats::bump(&self.stats.invalid);
                Some(Lookup::Existing {
                    conn: conns.conn(idx).clone(),
                    direction,
                    conforming: false,
                })
            }
            UpdateResult::Invalid | UpdateResult::New => {
                conns.remove(idx);
                self.n_conn.fetch_sub(1, Ordering::Relaxed);
                CtStats::bump(&self.stats.recreated);
                None
            }
        }
    }

    fn create(
        &self,
        conns: &mut BucketConns,
        key: &ConnKey,
        hash: u32,
        view: &PacketView,
        now: u64,
        opts: &ExecuteOptions,
    ) -> Lookup {
        let proto = L4Proto::from_ip_proto(key.tuple.proto);
        if !proto.valid_new(view, self.tcp_strict) {
            CtStats::bump(&self.stats.proto_refused);
            return Lookup::Refused(Refusal::Protocol);
        }

        let (state, class) = proto.new_conn(view);
        let mut conn = Conn::new(*key, state, hash, self.clock.wall_ms());
        conn.expiration = now.saturating_add(self.timeouts.millis(class));
        conn.account(Direction::Original, view.l3_len);

        if !opts.commit {
            return Lookup::Created {
                conn,
                committed: false,
            };
        }

        if self.n_conn.load(Ordering::Relaxed) >= self.n_conn_limit.load(Ordering::Relaxed) {
            CtStats::bump(&self.stats.limit_refused);
            return Lookup::Refused(Refusal::Limit);
        }

        apply_marks(&mut conn, opts);
        conn.helper = opts.helper.clone();
        conns.insert(conn.clone(), class);
        self.n_conn.fetch_add(1, Ordering::Relaxed);
        CtStats::bump(&self.stats.created);

        Lookup::Created {
            conn,
            committed: true,
        }
    }

    /// Sweep every bucket that is due at `now`.
    ///
    /// A bucket is due once its `next_cleanup` deadline has passed. Its
    /// expired connections are evicted up to a budget of
    /// `max(len / 10, limit / (buckets * 10), 16)`; the deadline then moves
    /// to the earliest remaining expiration, capped at `now` plus the
    /// smallest timeout. A bucket that exhausted its budget stays due.
    pub fn clean(&self, now: u64) -> CleanReport {
        let horizon = now.saturating_add(self.min_timeout_ms);
        let floor = self.limit() as usize / (self.buckets.len() * 10);
        let mut report = CleanReport {
            next_wakeup: horizon,
            evicted: 0,
            pending: false,
        };

        for bucket in self.buckets.iter() {
            let mut next_cleanup = bucket.next_cleanup.lock();
            if *next_cleanup > now {
                report.next_wakeup = report.next_wakeup.min(*next_cleanup);
                continue;
            }

            let (sweep, next_expiration) = {
                let mut conns = bucket.conns.lock();
                let budget = (conns.len() / 10).max(floor).max(MIN_SWEEP_BUDGET);
                let sweep = conns.sweep(now, budget);
                (sweep, conns.next_expiration())
            };

            if sweep.evicted > 0 {
                self.n_conn.fetch_sub(sweep.evicted as u32, Ordering::Relaxed);
                report.evicted += sweep.evicted;
            }

            *next_cleanup = if sweep.limited {
                CtStats::bump(&self.stats.long_sweeps);
                report.pending = true;
                now
            } else {
                next_expiration.map_or(horizon, |exp| exp.min(horizon))
            };
            report.next_wakeup = report.next_wakeup.min(*next_cleanup);
        }

        CtStats::add(&self.stats.expired, report.evicted as u64);
        report
    }

    /// Remove all connections, or only those in `zone`. Returns how many
    /// were removed.
    pub fn flush(&self, zone: Option<crate::tuple::Zone>) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let n = bucket.conns.lock().flush(zone);
            if n > 0 {
                self.n_conn.fetch_sub(n as u32, Ordering::Relaxed);
                removed += n;
            }
        }
        CtStats::add(&self.stats.flushed, removed as u64);
        debug!(zone = ?zone, removed, "Connection table flushed");
        removed
    }
}

fn apply_marks(conn: &mut Conn, opts: &ExecuteOptions) {
    if let Some(mark) = opts.mark {
        conn.mark = mark.apply(conn.mark);
    }
    if let Some(labels) = opts.labels {
        conn.labels = labels.apply(conn.labels);
    }
}

impl std::fmt::Debug for ConnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTable")
            .field("buckets", &self.buckets.len())
            .field("connections", &self.n_conns())
            .field("limit", &self.limit())
            .finish()
    }
}
