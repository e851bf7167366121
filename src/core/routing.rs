//! Routing collaborator: alternate destinations for rejected or purged
//! entries and the transaction context routing runs under.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::queue::entry::QueueEntry;
use crate::core::queue::Queue;

/// Transaction context handed to routing; enlisted work runs on commit.
pub trait ServerTransaction: Send + Sync {
    fn is_transactional(&self) -> bool;

    /// Schedules `action` to run when the transaction commits.
    fn add_post_commit_action(&self, action: Box<dyn FnOnce() + Send>);
}

/// Non-transactional context: actions run immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoCommit;

impl ServerTransaction for AutoCommit {
    fn is_transactional(&self) -> bool {
        false
    }

    fn add_post_commit_action(&self, action: Box<dyn FnOnce() + Send>) {
        action();
    }
}

/// Buffers actions until [`commit`](Self::commit); [`rollback`](Self::rollback) discards them.
#[derive(Default)]
pub struct LocalTransaction {
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl LocalTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self) -> usize {
        let actions = std::mem::take(&mut *self.pending.lock());
        let count = actions.len();
        for action in actions {
            action();
        }
        count
    }

    pub fn rollback(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }
}

impl ServerTransaction for LocalTransaction {
    fn is_transactional(&self) -> bool {
        true
    }

    fn add_post_commit_action(&self, action: Box<dyn FnOnce() + Send>) {
        self.pending.lock().push(action);
    }
}

/// Copies an entry's message to a configured alternate destination.
pub trait AlternateRouter: Send + Sync + Debug {
    /// Returns how many destinations accepted the message; 0 means none is
    /// configured or reachable.
    fn route_to_alternate(&self, entry: &QueueEntry, txn: &dyn ServerTransaction) -> usize;
}

/// No alternate destination configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAlternate;

impl AlternateRouter for NoAlternate {
    fn route_to_alternate(&self, _entry: &QueueEntry, _txn: &dyn ServerTransaction) -> usize {
        0
    }
}

/// Dead-letters into another queue.
#[derive(Debug, Clone)]
pub struct AlternateQueue {
    target: Weak<Queue>,
}

impl AlternateQueue {
    pub fn new(target: &Arc<Queue>) -> Self {
        Self {
            target: Arc::downgrade(target),
        }
    }
}

impl AlternateRouter for AlternateQueue {
    fn route_to_alternate(&self, entry: &QueueEntry, txn: &dyn ServerTransaction) -> usize {
        let (Some(target), Some(message)) = (self.target.upgrade(), entry.message()) else {
            return 0;
        };
        if !target.is_accepting() {
            return 0;
        }
        debug!(
            target: "blipmq::routing",
            queue = %target.name(),
            position = entry.position(),
            transactional = txn.is_transactional(),
            "routing entry to alternate queue"
        );
        txn.add_post_commit_action(Box::new(move || {
            if let Err(e) = target.enqueue(message) {
                warn!(target: "blipmq::routing", error = %e, "alternate enqueue failed");
            }
        }));
        1
    }
}

/// Rejection handling knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RejectPolicy {
    /// Reject events after which the entry is routed to the alternate.
    pub max_rejections: u32,
    /// Subscriptions lose interest in entries they already rejected.
    pub exclude_rejecting_subscriptions: bool,
    /// With no alternate reachable: delete (`true`) or keep the entry (`false`).
    pub drop_unroutable: bool,
}

impl Default for RejectPolicy {
    fn default() -> Self {
        Self {
            max_rejections: 3,
            exclude_rejecting_subscriptions: true,
            drop_unroutable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Returned to `Available` for redelivery.
    Released,
    /// Copied to this many alternate destinations, then deleted.
    Routed(usize),
    /// Deleted with no alternate destination.
    Dropped,
}
