//! Incremental table dumps.
//!
//! A cursor walks buckets in order and each bucket in slot order. It holds a
//! bucket lock only while copying out a small batch, so a dump of a large
//! table never stalls packet processing for long. Entries inserted or
//! removed while a dump is running may or may not be reported.

use crate::entry::CtEntry;
use crate::table::ConnTable;
use crate::tuple::Zone;
use std::collections::VecDeque;

/// Slots examined per bucket lock acquisition.
const DUMP_BATCH: usize = 64;

/// Iterator over live connections, optionally restricted to one zone.
pub struct DumpCursor<'a> {
    table: &'a ConnTable,
    zone: Option<Zone>,
    bucket: usize,
    pos: usize,
    pending: VecDeque<CtEntry>,
}

impl ConnTable {
    pub fn dump_start(&self, zone: Option<Zone>) -> DumpCursor<'_> {
        DumpCursor {
            table: self,
            zone,
            bucket: 0,
            pos: 0,
            pending: VecDeque::with_capacity(DUMP_BATCH),
        }
    }
}

impl<'a> DumpCursor<'a> {
    /// Next live entry, or `None` once every bucket has been visited.
    pub fn dump_next(&mut self) -> Option<CtEntry> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(entry);
            }
            if self.bucket >= self.table.bucket_count() {
                return None;
            }
            self.fill();
        }
    }

    /// Release the cursor.
    pub fn dump_done(self) {}

    fn fill(&mut self) {
        let now = self.table.clock().now_ms();
        let conns = self.table.bucket(self.bucket).conns.lock();

        let mut last = None;
        for (slot, conn) in conns.iter_from(self.pos).take(DUMP_BATCH) {
            last = Some(slot);
            if conn.is_expired(now) || self.zone.map_or(false, |z| conn.zone() != z) {
                continue;
            }
            self.pending.push_back(CtEntry::from_conn(conn, now));
        }

        match last {
            Some(slot) => self.pos = slot + 1,
            None => {
                self.bucket += 1;
                self.pos = 0;
            }
        }
    }
}

impl<'a> Iterator for DumpCursor<'a> {
    type Item = CtEntry;

    fn next(&mut self) -> Option<CtEntry> {
        self.dump_next()
    }
}
