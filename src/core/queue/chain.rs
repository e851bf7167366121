//! Append-only, tombstone-tolerant list of a queue's entries.
//!
//! Entries are reference-counted nodes linked through a `next` slot, so
//! readers walk the chain without locks while the tail holder appends.
//! Deleted entries stay linked until compaction bypasses them; a cursor
//! parked on one can always advance because a bypassed node keeps its own
//! forward link. A bypassed run is reclaimed once no cursor still holds a
//! node in it. The tail is never bypassed, since appends link through it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::core::message::Message;
use crate::core::queue::entry::QueueEntry;
use crate::core::queue::Queue;

#[derive(Debug)]
pub struct EntryChain {
    /// Always a deleted node: the sentinel or the last tombstone of a compacted prefix.
    head: RwLock<Arc<QueueEntry>>,
    tail: Mutex<Arc<QueueEntry>>,
    len: AtomicU64,
}

impl EntryChain {
    pub fn new() -> Self {
        let sentinel = Arc::new(QueueEntry::sentinel());
        Self {
            head: RwLock::new(sentinel.clone()),
            tail: Mutex::new(sentinel),
            len: AtomicU64::new(0),
        }
    }

    /// Appends a new entry at the tail and returns it.
    pub fn append(&self, message: Arc<Message>, expire_at: u64, queue: Weak<Queue>) -> Arc<QueueEntry> {
        let mut tail = self.tail.lock();
        let node = Arc::new(QueueEntry::new(
            tail.position() + 1,
            message,
            expire_at,
            queue,
        ));
        tail.link_next(node.clone());
        *tail = node.clone();
        self.len.fetch_add(1, Ordering::Relaxed);
        node
    }

    /// The current head anchor. Never a live entry.
    pub fn head(&self) -> Arc<QueueEntry> {
        self.head.read().clone()
    }

    pub fn first_valid(&self) -> Option<Arc<QueueEntry>> {
        self.head().get_next_valid_entry()
    }

    pub fn tail_position(&self) -> u64 {
        self.tail.lock().position()
    }

    /// Number of entries ever appended.
    pub fn appended(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// Non-deleted entries in chain order, observed lazily.
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            cursor: self.head(),
        }
    }

    /// Non-deleted entries strictly after `entry`.
    pub fn iter_from(&self, entry: Arc<QueueEntry>) -> EntryIter {
        EntryIter { cursor: entry }
    }

    /// Moves the head anchor past the leading run of tombstones, then
    /// links every live entry directly to its next live successor. Returns
    /// how many nodes were unlinked.
    pub fn compact(&self) -> usize {
        let mut head = self.head.write();
        let mut anchor = head.clone();
        let mut unlinked = 0;
        while let Some(next) = anchor.get_next_node() {
            if !next.is_deleted() {
                break;
            }
            anchor = next;
            unlinked += 1;
        }
        if unlinked > 0 {
            *head = anchor.clone();
        }

        let mut current = anchor;
        while let Some(next) = current.get_next_node() {
            if !next.is_deleted() {
                current = next;
                continue;
            }
            let mut target = next;
            let mut run = 1;
            while target.is_deleted() {
                match target.get_next_node() {
                    Some(after) => {
                        target = after;
                        run += 1;
                    }
                    None => break,
                }
            }
            // `target` is either live or the tail, which must stay linked.
            run -= 1;
            if run > 0 {
                current.splice_next(target.clone());
                unlinked += run;
            }
            current = target;
        }
        unlinked
    }

    /// Nodes currently reachable from the head anchor, tombstones included.
    pub fn linked_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head().get_next_node();
        while let Some(node) = cursor {
            count += 1;
            cursor = node.get_next_node();
        }
        count
    }
}

impl Default for EntryChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free cursor over the valid entries of a chain.
#[derive(Debug, Clone)]
pub struct EntryIter {
    cursor: Arc<QueueEntry>,
}

impl Iterator for EntryIter {
    type Item = Arc<QueueEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.cursor.get_next_valid_entry()?;
        self.cursor = next.clone();
        Some(next)
    }
}
