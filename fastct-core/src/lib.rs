//! # fastct-core
//!
//! Userspace connection tracking.
//!
//! Packets are classified against a sharded table of bidirectional
//! connections. Each tracked packet leaves with a [`CtState`] verdict
//! (new, established, related, invalid, reply direction) plus the zone,
//! mark and labels of its connection. Connections expire through per-state
//! timeouts swept by a background thread, and can be listed, flushed and
//! capped from the control plane through [`CtDpif`].
//!
//! ```no_run
//! use fastct_core::{Conntrack, ConntrackConfig, ExecuteOptions, L3Type, Packet};
//!
//! # fn frames() -> Vec<bytes::Bytes> { Vec::new() }
//! let ct = Conntrack::new(&ConntrackConfig::default())?;
//! let mut batch: Vec<Packet> = frames().into_iter().map(Packet::from_ethernet).collect();
//! let report = ct.execute(&mut batch, L3Type::Ipv4, &ExecuteOptions::commit(0));
//! println!("{} new connections", report.new);
//! # Ok::<(), fastct_core::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod conn;
pub mod conntrack;
pub mod dpif;
pub mod dump;
pub mod entry;
pub mod error;
pub mod execute;
pub mod packet;
pub mod proto;
pub mod stats;
pub mod table;
pub mod timeout;
pub mod tuple;

mod bucket;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ConntrackConfig;
pub use conn::{Conn, Counters, Direction, Masked};
pub use conntrack::Conntrack;
pub use dpif::{dump_lines, CtDpif, CtDump};
pub use dump::DumpCursor;
pub use entry::{CtEntry, FormatOptions};
pub use error::{Error, Result};
pub use execute::{BatchReport, ExecuteOptions};
pub use packet::{CtState, L3Type, Packet, PacketMetadata, TcpFlags};
pub use stats::CtStatsSnapshot;
pub use table::{CleanReport, ConnTable, Lookup, Refusal};
pub use timeout::{TimeoutClass, TimeoutPolicy};
pub use tuple::{ConnKey, Tuple, Zone};
