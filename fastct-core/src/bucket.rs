//! One shard of the connection table.
//!
//! Connections live in a slab. The index maps both the original and the
//! reply key of every connection to its slot, and each slot is threaded on
//! exactly one intrusive expiration list, the one for its current timeout
//! class. Lists are appended at the tail with `now + timeout`, so each stays
//! ordered by expiration and sweeping only ever looks at list heads.

use crate::conn::{Conn, Direction};
use crate::timeout::TimeoutClass;
use crate::tuple::{ConnKey, Zone};
use ahash::AHashMap;
use parking_lot::Mutex;
use slab::Slab;

/// A bucket and its two locks.
///
/// Lock order is `next_cleanup` then `conns`. Packet processing only takes
/// `conns`; the sweeper takes both.
pub(crate) struct Bucket {
    pub(crate) conns: Mutex<BucketConns>,
    /// Earliest time this bucket needs sweeping.
    pub(crate) next_cleanup: Mutex<u64>,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            conns: Mutex::new(BucketConns::new()),
            next_cleanup: Mutex::new(0),
        }
    }
}

struct Node {
    conn: Conn,
    class: TimeoutClass,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExpList {
    head: Option<usize>,
    tail: Option<usize>,
}

/// Outcome of one sweep over a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub(crate) evicted: usize,
    /// Stopped at the eviction limit with expired entries left behind.
    pub(crate) limited: bool,
}

pub(crate) struct BucketConns {
    index: AHashMap<ConnKey, (usize, Direction)>,
    nodes: Slab<Node>,
    lists: [ExpList; TimeoutClass::COUNT],
}

impl BucketConns {
    fn new() -> Self {
        Self {
            index: AHashMap::new(),
            nodes: Slab::new(),
            lists: [ExpList::default(); TimeoutClass::COUNT],
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub(crate) fn find(&self, key: &ConnKey) -> Option<(usize, Direction)> {
        self.index.get(key).copied()
    }

    #[inline]
    pub(crate) fn conn(&self, idx: usize) -> &Conn {
        &self.nodes[idx].conn
    }

    #[inline]
    pub(crate) fn conn_mut(&mut self, idx: usize) -> &mut Conn {
        &mut self.nodes[idx].conn
    }

    /// Index a new connection under both keys and queue it on `class`.
    pub(crate) fn insert(&mut self, conn: Conn, class: TimeoutClass) -> usize {
        let orig = conn.key;
        let reply = conn.reply_key();
        let idx = self.nodes.insert(Node {
            conn,
            class,
            prev: None,
            next: None,
        });
        self.index.insert(orig, (idx, Direction::Original));
        if reply != orig {
            self.index.insert(reply, (idx, Direction::Reply));
        }
        self.push_back(idx);
        idx
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Conn {
        self.unlink(idx);
        let node = self.nodes.remove(idx);
        self.index.remove(&node.conn.key);
        self.index.remove(&node.conn.reply_key());
        node.conn
    }

    /// Move a connection to the tail of `class` with a new expiration.
    pub(crate) fn refresh(&mut self, idx: usize, class: TimeoutClass, expiration: u64) {
        self.unlink(idx);
        let node = &mut self.nodes[idx];
        node.class = class;
        node.conn.expiration = expiration;
        self.push_back(idx);
    }

    /// Evict expired connections from the list heads, at most `limit`.
    pub(crate) fn sweep(&mut self, now: u64, limit: usize) -> Sweep {
        let mut evicted = 0;
        for class in 0..TimeoutClass::COUNT {
            while let Some(head) = self.lists[class].head {
                if !self.nodes[head].conn.is_expired(now) {
                    break;
                }
                if evicted == limit {
                    return Sweep {
                        evicted,
                        limited: true,
                    };
                }
                self.remove(head);
                evicted += 1;
            }
        }
        Sweep {
            evicted,
            limited: false,
        }
    }

    /// Earliest expiration over all lists.
    pub(crate) fn next_expiration(&self) -> Option<u64> {
        self.lists
            .iter()
            .filter_map(|list| list.head)
            .map(|idx| self.nodes[idx].conn.expiration)
            .min()
    }

    /// Connections in slot order, starting at slot `pos`.
    pub(crate) fn iter_from(&self, pos: usize) -> impl Iterator<Item = (usize, &Conn)> + '_ {
        (pos..self.nodes.capacity())
            .filter_map(move |slot| self.nodes.get(slot).map(|node| (slot, &node.conn)))
    }

    /// Remove every connection, or only those in `zone`.
    pub(crate) fn flush(&mut self, zone: Option<Zone>) -> usize {
        let victims: Vec<usize> = self
            .nodes
            .iter()
            .filter(|(_, node)| zone.map_or(true, |z| node.conn.zone() == z))
            .map(|(slot, _)| slot)
            .collect();
        for &slot in &victims {
            self.remove(slot);
        }
        victims.len()
    }

    fn push_back(&mut self, idx: usize) {
        let class = self.nodes[idx].class.index();
        let tail = self.lists[class].tail;
        {
            let node = &mut self.nodes[idx];
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(t) => self.nodes[t].next = Some(idx),
            None => self.lists[class].head = Some(idx),
        }
        self.lists[class].tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (class, prev, next) = {
            let node = &self.nodes[idx];
            (node.class.index(), node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.lists[class].head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.lists[class].tail = prev,
        }
        let node = &mut self.nodes[idx];
        node.prev = None;
        node.next = None;
    }

    /// Members of one expiration list, head first.
    #[cfg(test)]
    pub(crate) fn list(&self, class: TimeoutClass) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.lists[class.index()].head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.nodes[idx].next;
        }
        out
    }

    /// Panics if the index, the slab and the lists disagree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut seen = std::collections::HashSet::new();
        for class in TimeoutClass::ALL {
            let members = self.list(class);
            let mut last = 0;
            for idx in members {
                assert!(seen.insert(idx), "slot {} on more than one list", idx);
                assert_eq!(self.nodes[idx].class, class);
                let exp = self.nodes[idx].conn.expiration;
                assert!(exp >= last, "list {} out of order", class);
                last = exp;
            }
        }
        assert_eq!(seen.len(), self.nodes.len());
        for (slot, node) in self.nodes.iter() {
            assert_eq!(self.find(&node.conn.key), Some((slot, Direction::Original)));
        }
    }
}
