//! Fixed-size verdict records echoed back to frame senders.
//!
//! Layout, all big-endian:
//!
//! ```text
//! 0      1        3        7                  23
//! +------+--------+--------+------------------+
//! | state| zone   | mark   | labels           |
//! +------+--------+--------+------------------+
//! ```

use bytes::{Buf, BufMut};
use fastct_core::{CtState, PacketMetadata};

/// Encoded length of one verdict.
pub const VERDICT_LEN: usize = 23;

pub fn encode(md: &PacketMetadata) -> [u8; VERDICT_LEN] {
    let mut out = [0u8; VERDICT_LEN];
    let mut buf = &mut out[..];
    buf.put_u8(md.ct_state.bits());
    buf.put_u16(md.ct_zone);
    buf.put_u32(md.ct_mark);
    buf.put_u128(md.ct_labels);
    out
}

/// Decode a verdict. Unknown state bits are dropped.
pub fn decode(mut buf: &[u8]) -> Option<PacketMetadata> {
    if buf.len() != VERDICT_LEN {
        return None;
    }
    Some(PacketMetadata {
        ct_state: CtState::from_bits_truncate(buf.get_u8()),
        ct_zone: buf.get_u16(),
        ct_mark: buf.get_u32(),
        ct_labels: buf.get_u128(),
    })
}
