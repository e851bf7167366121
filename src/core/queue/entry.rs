//! A single message's occupancy record within one queue.
//!
//! Ownership lives in one `AtomicU64` and only moves through compare-and-set:
//!
//! ```text
//! Available ──acquire──▶ Acquired(owner) ──release──▶ Available
//!     │                        │
//!     └──────delete────────────┴──delete/ack/reject──▶ Deleted (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::core::error::{DeliveryError, Result};
use crate::core::listener::{ListenerId, ListenerSet, StateChangeListener};
use crate::core::message::Message;
use crate::core::queue::Queue;
use crate::core::routing::{AlternateRouter, RejectOutcome, RejectPolicy, ServerTransaction};
use crate::core::subscriber::SubscriptionId;

const AVAILABLE: u64 = 0;
const BROKER: u64 = u64::MAX - 1;
const DELETED: u64 = u64::MAX;

/// Who holds an acquired entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Broker-internal work: purge, move, expiry, queue deletion.
    Broker,
    Subscription(SubscriptionId),
}

impl From<SubscriptionId> for Owner {
    fn from(id: SubscriptionId) -> Self {
        Owner::Subscription(id)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Broker => f.write_str("broker"),
            Owner::Subscription(id) => write!(f, "subscription {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Available,
    Acquired(Owner),
    Deleted,
}

impl EntryState {
    fn encode(self) -> u64 {
        match self {
            EntryState::Available => AVAILABLE,
            EntryState::Acquired(Owner::Broker) => BROKER,
            EntryState::Acquired(Owner::Subscription(id)) => id.value(),
            EntryState::Deleted => DELETED,
        }
    }

    fn decode(raw: u64) -> Self {
        match raw {
            AVAILABLE => EntryState::Available,
            BROKER => EntryState::Acquired(Owner::Broker),
            DELETED => EntryState::Deleted,
            id => EntryState::Acquired(Owner::Subscription(SubscriptionId::from_raw(id))),
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::Available => f.write_str("available"),
            EntryState::Acquired(owner) => write!(f, "acquired by {owner}"),
            EntryState::Deleted => f.write_str("deleted"),
        }
    }
}

/// One message instance at one position of one queue.
pub struct QueueEntry {
    position: u64,
    size: u64,
    expire_at: u64,
    message: Mutex<Option<Arc<Message>>>,
    state: AtomicU64,
    delivery_count: AtomicU32,
    redelivered: AtomicBool,
    reject_count: AtomicU32,
    rejected_by: Mutex<Vec<SubscriptionId>>,
    next: RwLock<Option<Arc<QueueEntry>>>,
    queue: Weak<Queue>,
    listeners: ListenerSet<QueueEntry, EntryState>,
}

impl QueueEntry {
    pub(crate) fn new(
        position: u64,
        message: Arc<Message>,
        expire_at: u64,
        queue: Weak<Queue>,
    ) -> Self {
        Self {
            position,
            size: message.size(),
            expire_at,
            message: Mutex::new(Some(message)),
            state: AtomicU64::new(AVAILABLE),
            delivery_count: AtomicU32::new(0),
            redelivered: AtomicBool::new(false),
            reject_count: AtomicU32::new(0),
            rejected_by: Mutex::new(Vec::new()),
            next: RwLock::new(None),
            queue,
            listeners: ListenerSet::new(),
        }
    }

    /// Permanently deleted anchor placed at the head of every chain.
    pub(crate) fn sentinel() -> Self {
        Self {
            position: 0,
            size: 0,
            expire_at: 0,
            message: Mutex::new(None),
            state: AtomicU64::new(DELETED),
            delivery_count: AtomicU32::new(0),
            redelivered: AtomicBool::new(false),
            reject_count: AtomicU32::new(0),
            rejected_by: Mutex::new(Vec::new()),
            next: RwLock::new(None),
            queue: Weak::new(),
            listeners: ListenerSet::new(),
        }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The message, or `None` once the entry has been deleted.
    pub fn message(&self) -> Option<Arc<Message>> {
        self.message.lock().clone()
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    pub fn state(&self) -> EntryState {
        EntryState::decode(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.state.load(Ordering::Acquire) == AVAILABLE
    }

    #[inline]
    pub fn is_acquired(&self) -> bool {
        matches!(self.state(), EntryState::Acquired(_))
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELETED
    }

    pub fn is_acquired_by(&self, owner: impl Into<Owner>) -> bool {
        self.state() == EntryState::Acquired(owner.into())
    }

    pub fn expires_at(&self) -> u64 {
        self.expire_at
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        self.expire_at != 0 && now_ms >= self.expire_at
    }

    fn transition(&self, from: EntryState, to: EntryState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.listeners.notify(self, from, to);
        }
        swapped
    }

    /// Broker-internal acquisition; same exclusivity as [`acquire_by`](Self::acquire_by).
    pub fn acquire(&self) -> bool {
        self.transition(EntryState::Available, EntryState::Acquired(Owner::Broker))
    }

    /// Claims the entry for `subscription`. Exactly one concurrent caller wins.
    pub fn acquire_by(&self, subscription: SubscriptionId) -> bool {
        let acquired = self.transition(
            EntryState::Available,
            EntryState::Acquired(Owner::Subscription(subscription)),
        );
        if acquired {
            debug!(
                target: "blipmq::entry",
                position = self.position,
                subscription = %subscription,
                "entry acquired"
            );
        }
        acquired
    }

    pub fn acquire_as(&self, owner: impl Into<Owner>) -> bool {
        match owner.into() {
            Owner::Broker => self.acquire(),
            Owner::Subscription(id) => self.acquire_by(id),
        }
    }

    pub(crate) fn ownership_error(&self, caller: Owner) -> DeliveryError {
        match self.state() {
            EntryState::Deleted => DeliveryError::EntryDeleted {
                position: self.position,
            },
            other => DeliveryError::NotOwner {
                position: self.position,
                caller,
                actual: other.to_string(),
            },
        }
    }

    /// Returns the entry to `Available` at its original chain position.
    pub fn release(&self, owner: impl Into<Owner>) -> Result<()> {
        let owner = owner.into();
        if !self.transition(EntryState::Acquired(owner), EntryState::Available) {
            return Err(self.ownership_error(owner));
        }
        debug!(target: "blipmq::entry", position = self.position, %owner, "entry released");
        if let Some(queue) = self.queue.upgrade() {
            queue.on_entry_released(self);
        }
        Ok(())
    }

    /// Release that does not count as a delivery attempt (broker repositioning).
    pub fn release_uncounted(&self, owner: impl Into<Owner>) -> Result<()> {
        self.release(owner)?;
        self.decrement_delivery_count();
        Ok(())
    }

    /// Deletes an entry the caller owns (acknowledgement path).
    pub fn delete_acquired(&self, owner: impl Into<Owner>) -> Result<()> {
        let owner = owner.into();
        if !self.transition(EntryState::Acquired(owner), EntryState::Deleted) {
            return Err(self.ownership_error(owner));
        }
        self.on_deleted();
        Ok(())
    }

    /// Unconditionally deletes the entry. Returns `true` only for the caller
    /// that performed the transition; listeners fire once.
    pub fn delete(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == DELETED {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                DELETED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.listeners
                        .notify(self, EntryState::decode(current), EntryState::Deleted);
                    self.on_deleted();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn on_deleted(&self) {
        self.message.lock().take();
        if let Some(queue) = self.queue.upgrade() {
            queue.on_entry_deleted(self);
        }
    }

    /// Records the rejection, then either releases the entry or routes it to
    /// the alternate destination and deletes it, per `policy`.
    pub fn reject(
        &self,
        subscription: SubscriptionId,
        policy: &RejectPolicy,
        router: &dyn AlternateRouter,
        txn: &dyn ServerTransaction,
    ) -> Result<RejectOutcome> {
        let owner = Owner::Subscription(subscription);
        if !self.is_acquired_by(owner) {
            return Err(self.ownership_error(owner));
        }
        {
            let mut rejected_by = self.rejected_by.lock();
            if !rejected_by.contains(&subscription) {
                rejected_by.push(subscription);
            }
        }
        let rejections = self.reject_count.fetch_add(1, Ordering::AcqRel) + 1;

        if rejections < policy.max_rejections {
            self.release(owner)?;
            return Ok(RejectOutcome::Released);
        }

        let routed = router.route_to_alternate(self, txn);
        if routed == 0 && !policy.drop_unroutable {
            warn!(
                target: "blipmq::entry",
                position = self.position,
                "no alternate destination; keeping rejected entry"
            );
            self.release(owner)?;
            return Ok(RejectOutcome::Released);
        }

        // A concurrent purge may have deleted it already; the routing stands.
        if !self.transition(EntryState::Acquired(owner), EntryState::Deleted) {
            self.delete();
        } else {
            self.on_deleted();
        }

        if routed == 0 {
            warn!(
                target: "blipmq::entry",
                position = self.position,
                rejections,
                "rejected entry dropped: no alternate destination"
            );
            Ok(RejectOutcome::Dropped)
        } else {
            debug!(
                target: "blipmq::entry",
                position = self.position,
                routed,
                "rejected entry routed to alternate"
            );
            Ok(RejectOutcome::Routed(routed))
        }
    }

    pub fn is_rejected_by(&self, subscription: SubscriptionId) -> bool {
        self.rejected_by.lock().contains(&subscription)
    }

    pub fn rejection_count(&self) -> u32 {
        self.reject_count.load(Ordering::Acquire)
    }

    /// Increments the delivery counter and returns its previous value.
    pub fn increment_delivery_count(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements by one, floored at zero.
    pub fn decrement_delivery_count(&self) {
        let _ = self
            .delivery_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::Acquire)
    }

    pub fn set_redelivered(&self) {
        self.redelivered.store(true, Ordering::Release);
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::Acquire)
    }

    pub fn add_state_change_listener(
        &self,
        listener: Arc<dyn StateChangeListener<QueueEntry, EntryState>>,
    ) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_state_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Immediate successor regardless of its state.
    #[inline]
    pub fn get_next_node(&self) -> Option<Arc<QueueEntry>> {
        self.next.read().clone()
    }

    /// First successor that is not deleted.
    pub fn get_next_valid_entry(&self) -> Option<Arc<QueueEntry>> {
        let mut next = self.get_next_node()?;
        while next.is_deleted() {
            next = next.get_next_node()?;
        }
        Some(next)
    }

    /// Links `node` after this one. Only the chain's tail holder calls this.
    pub(crate) fn link_next(&self, node: Arc<QueueEntry>) {
        let mut next = self.next.write();
        if next.is_some() {
            error!(
                target: "blipmq::entry",
                position = self.position,
                "entry already has a successor; chain append raced"
            );
            debug_assert!(false, "entry {} linked twice", self.position);
            return;
        }
        *next = Some(node);
    }

    /// Points this entry past an unlinked run of tombstones. Only compaction
    /// calls this, and only on entries that already have a successor. The
    /// bypassed nodes keep their own links, so a cursor parked in the run
    /// still reaches `node`.
    pub(crate) fn splice_next(&self, node: Arc<QueueEntry>) -> Option<Arc<QueueEntry>> {
        let mut next = self.next.write();
        if next.is_none() {
            return None;
        }
        next.replace(node)
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("position", &self.position)
            .field("state", &self.state())
            .field("delivery_count", &self.delivery_count())
            .field("redelivered", &self.is_redelivered())
            .finish()
    }
}

// Unlinks iteratively so dropping a long run of tombstones cannot overflow the stack.
impl Drop for QueueEntry {
    fn drop(&mut self) {
        let mut next = self.next.get_mut().take();
        while let Some(node) = next {
            next = match Arc::into_inner(node) {
                Some(mut inner) => inner.next.get_mut().take(),
                None => None,
            };
        }
    }
}
