//! Subscription identities.
//!
//! Ids come from an injected [`IdSource`]; consumers may rely on uniqueness
//! within a source, never on ordering.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Largest raw value; the values above it are reserved for entry states.
    pub const MAX: u64 = u64::MAX - 2;

    /// Returns `None` for 0 and for the reserved range.
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0 && raw <= Self::MAX).then_some(SubscriptionId(raw))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        SubscriptionId(raw)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait IdSource: Send + Sync {
    fn next_id(&self) -> SubscriptionId;
}

/// Counter-backed ids starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> SubscriptionId {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = SubscriptionId::new(raw) {
                return id;
            }
            // Wrapped past the reserved range; restart the sequence.
            let _ = self
                .next
                .compare_exchange(raw.wrapping_add(1), 1, Ordering::Relaxed, Ordering::Relaxed);
        }
    }
}

/// Ids drawn from random v4 UUIDs, for ids shared across brokers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> SubscriptionId {
        loop {
            let (hi, lo) = Uuid::new_v4().as_u64_pair();
            if let Some(id) = SubscriptionId::new(hi ^ lo) {
                return id;
            }
        }
    }
}
