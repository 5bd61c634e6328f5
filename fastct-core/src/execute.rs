//! Batch entry point: classify packets and stamp tracking metadata.

use crate::conn::{Conn, Direction, Masked};
use crate::packet::{CtState, L3Type, Packet, PacketMetadata};
use crate::stats::CtStats;
use crate::table::{ConnTable, Lookup, Refusal};
use crate::tuple::{extract, Zone};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

/// Minimum gap between two "helper unsupported" warnings.
const HELPER_WARN_INTERVAL_MS: u64 = 5_000;

/// Per-call tracking options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub zone: Zone,
    /// Retire a connection the packet contradicts and start over.
    pub force: bool,
    /// Store new connections and apply state changes. Without it the table
    /// is only consulted.
    pub commit: bool,
    /// Written to the connection on commit.
    pub mark: Option<Masked<u32>>,
    /// Written to the connection on commit.
    pub labels: Option<Masked<u128>>,
    /// Application-layer helper name. Recorded, never run.
    pub helper: Option<Arc<str>>,
}

impl ExecuteOptions {
    /// Committing options for `zone`.
    pub fn commit(zone: Zone) -> Self {
        Self {
            zone,
            commit: true,
            ..Self::default()
        }
    }

    /// Look-up-only options for `zone`.
    pub fn lookup(zone: Zone) -> Self {
        Self {
            zone,
            ..Self::default()
        }
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_mark(mut self, mark: Masked<u32>) -> Self {
        self.mark = Some(mark);
        self
    }

    pub fn with_labels(mut self, labels: Masked<u128>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_helper(mut self, helper: impl Into<Arc<str>>) -> Self {
        self.helper = Some(helper.into());
        self
    }
}

/// Outcome tally of one [`ConnTable::execute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub packets: usize,
    pub established: usize,
    pub new: usize,
    pub related: usize,
    pub invalid: usize,
    pub untrackable: usize,
    /// New packets the table had no room for.
    pub limit_refused: usize,
    /// A helper was requested; this tracker does not run helpers.
    pub helper_unsupported: bool,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.packets += other.packets;
        self.established += other.established;
        self.new += other.new;
        self.related += other.related;
        self.invalid += other.invalid;
        self.untrackable += other.untrackable;
        self.limit_refused += other.limit_refused;
        self.helper_unsupported |= other.helper_unsupported;
    }
}

impl ConnTable {
    /// Track every packet in `batch` as `l3` traffic and fill in its
    /// metadata. The clock is read once for the whole batch.
    pub fn execute(&self, batch: &mut [Packet], l3: L3Type, opts: &ExecuteOptions) -> BatchReport {
        let now = self.clock().now_ms();
        let mut report = BatchReport {
            packets: batch.len(),
            ..BatchReport::default()
        };

        if let Some(helper) = &opts.helper {
            report.helper_unsupported = true;
            self.warn_helper(helper, now);
        }

        for pkt in batch.iter_mut() {
            pkt.md = self.process_packet(pkt, l3, opts, now, &mut report);
        }

        report
    }

    fn process_packet(
        &self,
        pkt: &Packet,
        l3: L3Type,
        opts: &ExecuteOptions,
        now: u64,
        report: &mut BatchReport,
    ) -> PacketMetadata {
        let extracted = match extract(pkt, l3, opts.zone, self.verify_checksums()) {
            Ok(extracted) => extracted,
            Err(e) => {
                trace!(error = %e, zone = opts.zone, "Untrackable packet");
                report.untrackable += 1;
                CtStats::bump(&self.stats.untrackable);
                return stamp(CtState::INVALID, opts.zone, None);
            }
        };

        if extracted.related {
            return match self.lookup(&extracted.key, now) {
                Some((conn, direction)) => {
                    report.related += 1;
                    CtStats::bump(&self.stats.related);
                    stamp(CtState::RELATED | reply_bit(direction), opts.zone, Some(&conn))
                }
                None => {
                    report.invalid += 1;
                    stamp(CtState::INVALID, opts.zone, None)
                }
            };
        }

        match self.lookup_or_create(&extracted.key, &extracted.view, now, opts) {
            Lookup::Existing {
                conn,
                direction,
                conforming: true,
            } => {
                report.established += 1;
                stamp(CtState::ESTABLISHED | reply_bit(direction), opts.zone, Some(&conn))
            }
            Lookup::Existing { conn, .. } => {
                report.invalid += 1;
                stamp(CtState::INVALID, opts.zone, Some(&conn))
            }
            Lookup::Created { conn, .. } => {
                report.new += 1;
                stamp(CtState::NEW, opts.zone, Some(&conn))
            }
            Lookup::Refused(Refusal::Protocol) => {
                report.invalid += 1;
                stamp(CtState::INVALID, opts.zone, None)
            }
            Lookup::Refused(Refusal::Limit) => {
                report.limit_refused += 1;
                stamp(CtState::NEW, opts.zone, None)
            }
        }
    }

    fn warn_helper(&self, helper: &str, now: u64) {
        // Stored as `now + 1` so zero can mean "never warned".
        let last = self.helper_warned_at.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last - 1) < HELPER_WARN_INTERVAL_MS {
            return;
        }
        if self
            .helper_warned_at
            .compare_exchange(last, now + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn!(helper, "Connection helpers are not supported, tracking without one");
        }
    }
}

#[inline]
fn reply_bit(direction: Direction) -> CtState {
    if direction.is_reply() {
        CtState::REPLY_DIR
    } else {
        CtState::empty()
    }
}

fn stamp(state: CtState, zone: Zone, conn: Option<&Conn>) -> PacketMetadata {
    PacketMetadata {
        ct_state: state | CtState::TRACKED,
        ct_zone: zone,
        ct_mark: conn.map_or(0, |c| c.mark),
        ct_labels: conn.map_or(0, |c| c.labels),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_merge() {
        let mut a = BatchReport {
            packets: 2,
            new: 1,
            established: 1,
            ..BatchReport::default()
        };
        let b = BatchReport {
            packets: 3,
            invalid: 2,
            untrackable: 1,
            helper_unsupported: true,
            ..BatchReport::default()
        };
        a.merge(&b);
        assert_eq!(a.packets, 5);
        assert_eq!(a.invalid, 2);
        assert_eq!(a.new, 1);
        assert!(a.helper_unsupported);
    }

    #[test]
    fn test_options_builders() {
        let opts = ExecuteOptions::commit(4)
            .with_force()
            .with_mark(Masked::<u32>::exact(9))
            .with_helper("ftp");
        assert!(opts.commit);
        assert!(opts.force);
        assert_eq!(opts.zone, 4);
        assert_eq!(opts.mark, Some(Masked::<u32>::exact(9)));
        assert_eq!(opts.helper.as_deref(), Some("ftp"));
        assert!(!ExecuteOptions::lookup(1).commit);
    }
}
