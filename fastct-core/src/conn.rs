//! Connection records.

use crate::proto::ProtoState;
use crate::tuple::{ConnKey, Tuple, Zone};
use std::sync::Arc;

/// Which tuple of a connection a packet matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Original,
    Reply,
}

impl Direction {
    #[inline]
    pub fn is_reply(self) -> bool {
        self == Direction::Reply
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Direction::Original => 0,
            Direction::Reply => 1,
        }
    }
}

/// Packet and byte totals for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
}

/// Masked write applied to mark and label fields: `value | (old & !mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Masked<T> {
    pub value: T,
    pub mask: T,
}

macro_rules! impl_masked {
    ($($t:ty),*) => {$(
        impl Masked<$t> {
            pub fn new(value: $t, mask: $t) -> Self {
                Self { value: value & mask, mask }
            }

            /// Overwrite every bit.
            pub fn exact(value: $t) -> Self {
                Self { value, mask: <$t>::MAX }
            }

            #[inline]
            pub fn apply(&self, old: $t) -> $t {
                self.value | (old & !self.mask)
            }
        }
    )*};
}

impl_masked!(u32, u128);

/// A tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conn {
    pub key: ConnKey,
    /// Tuple of return traffic. Equal to the mirrored original tuple.
    pub reply: Tuple,
    pub proto: ProtoState,
    /// Monotonic milliseconds at which the connection expires.
    pub expiration: u64,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub created_wall_ms: u64,
    /// Stable identifier derived from the key hash.
    pub id: u32,
    pub mark: u32,
    pub labels: u128,
    pub helper: Option<Arc<str>>,
    counters: [Counters; 2],
}

impl Conn {
    pub(crate) fn new(key: ConnKey, proto: ProtoState, id: u32, created_wall_ms: u64) -> Self {
        Self {
            reply: key.tuple.mirror(),
            key,
            proto,
            expiration: 0,
            created_wall_ms,
            id,
            mark: 0,
            labels: 0,
            helper: None,
            counters: [Counters::default(); 2],
        }
    }

    #[inline]
    pub fn zone(&self) -> Zone {
        self.key.zone
    }

    #[inline]
    pub fn original(&self) -> &Tuple {
        &self.key.tuple
    }

    #[inline]
    pub fn reply_key(&self) -> ConnKey {
        ConnKey::new(self.reply, self.key.zone)
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration
    }

    pub fn counters(&self, dir: Direction) -> Counters {
        self.counters[dir.index()]
    }

    pub(crate) fn account(&mut self, dir: Direction, bytes: u32) {
        let c = &mut self.counters[dir.index()];
        c.packets += 1;
        c.bytes += u64::from(bytes);
    }
}
