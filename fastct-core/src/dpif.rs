//! Provider-neutral conntrack control interface.
//!
//! Control-plane tools talk to a [`CtDpif`] rather than to a concrete table.
//! Every operation has a default body returning [`Error::NotSupported`], so
//! a datapath without conntrack only needs to supply its name.

use crate::dump::DumpCursor;
use crate::entry::{CtEntry, FormatOptions};
use crate::error::{Error, Result};
use crate::stats::CtStatsSnapshot;
use crate::table::ConnTable;
use crate::tuple::Zone;

/// An in-progress dump. Dropping it ends the dump.
pub trait CtDump {
    fn next_entry(&mut self) -> Result<Option<CtEntry>>;
}

/// Conntrack operations a datapath may offer.
pub trait CtDpif: Send + Sync {
    fn name(&self) -> &str;

    fn ct_dump_start(&self, _zone: Option<Zone>) -> Result<Box<dyn CtDump + '_>> {
        Err(Error::NotSupported("ct_dump_start"))
    }

    /// Returns the number of connections removed.
    fn ct_flush(&self, _zone: Option<Zone>) -> Result<usize> {
        Err(Error::NotSupported("ct_flush"))
    }

    fn ct_get_limit(&self) -> Result<u32> {
        Err(Error::NotSupported("ct_get_limit"))
    }

    fn ct_set_limit(&self, _limit: u32) -> Result<()> {
        Err(Error::NotSupported("ct_set_limit"))
    }

    fn ct_stats(&self) -> Result<CtStatsSnapshot> {
        Err(Error::NotSupported("ct_stats"))
    }
}

impl<'a> CtDump for DumpCursor<'a> {
    fn next_entry(&mut self) -> Result<Option<CtEntry>> {
        Ok(self.dump_next())
    }
}

impl CtDpif for ConnTable {
    fn name(&self) -> &str {
        "userspace"
    }

    fn ct_dump_start(&self, zone: Option<Zone>) -> Result<Box<dyn CtDump + '_>> {
        Ok(Box::new(self.dump_start(zone)))
    }

    fn ct_flush(&self, zone: Option<Zone>) -> Result<usize> {
        Ok(self.flush(zone))
    }

    fn ct_get_limit(&self) -> Result<u32> {
        Ok(self.limit())
    }

    fn ct_set_limit(&self, limit: u32) -> Result<()> {
        self.set_limit(limit);
        Ok(())
    }

    fn ct_stats(&self) -> Result<CtStatsSnapshot> {
        Ok(self.stats())
    }
}

/// Run a full dump through `dpif` and render each entry.
pub fn dump_lines(dpif: &dyn CtDpif, zone: Option<Zone>, opts: FormatOptions) -> Result<Vec<String>> {
    let mut dump = dpif.ct_dump_start(zone)?;
    let mut lines = Vec::new();
    while let Some(entry) = dump.next_entry()? {
        lines.push(entry.format(opts));
    }
    Ok(lines)
}
