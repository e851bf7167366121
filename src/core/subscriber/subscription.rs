use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::core::error::{DeliveryError, Result, TransportError};
use crate::core::listener::{ListenerId, ListenerSet, StateChangeListener};
use crate::core::queue::entry::QueueEntry;
use crate::core::queue::Queue;
use crate::core::routing::RejectOutcome;
use crate::core::subscriber::credit::CreditManager;
use crate::core::subscriber::filter::MessageFilter;
use crate::core::subscriber::identity::SubscriptionId;
use crate::core::transport::{Delivery, Transport};

const ACTIVE: u8 = 0;
const SUSPENDED: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Suspended,
    /// Terminal.
    Closed,
}

impl SubscriptionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACTIVE => SubscriptionState::Active,
            SUSPENDED => SubscriptionState::Suspended,
            _ => SubscriptionState::Closed,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Active => f.write_str("active"),
            SubscriptionState::Suspended => f.write_str("suspended"),
            SubscriptionState::Closed => f.write_str("closed"),
        }
    }
}

/// Proof that the holder owns a subscription's send lock. Dropping it
/// releases the lock and runs any dispatch pass deferred while it was held.
pub struct SendGuard<'a> {
    owner: &'a Subscription,
    lock: Option<MutexGuard<'a, ()>>,
}

impl SendGuard<'_> {
    pub fn release(self) {}

    fn belongs_to(&self, subscription: &Subscription) -> bool {
        std::ptr::eq(self.owner, subscription)
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        if self.owner.dispatch_deferred.swap(false, Ordering::SeqCst) {
            if let Some(queue) = self.owner.queue() {
                queue.trigger();
            }
        }
    }
}

/// An entry this subscription owns. `credited` is set once a send has
/// consumed credit for it.
struct Held {
    entry: Arc<QueueEntry>,
    credited: bool,
}

/// A consumer's delivery context bound to one queue.
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    acquires: bool,
    state: AtomicU8,
    credit_blocked: AtomicBool,
    dispatch_deferred: AtomicBool,
    queue: RwLock<Option<Weak<Queue>>>,
    exclude_rejected: AtomicBool,
    filter: Option<Arc<dyn MessageFilter>>,
    transport: Arc<dyn Transport>,
    credit: CreditManager,
    send_lock: Mutex<()>,
    outstanding: Mutex<BTreeMap<u64, Held>>,
    next_tag: AtomicU64,
    browse_position: AtomicU64,
    last_error: Mutex<Option<TransportError>>,
    messages_out: AtomicU64,
    bytes_out: AtomicU64,
    listeners: ListenerSet<Subscription, SubscriptionState>,
}

pub struct SubscriptionBuilder {
    id: SubscriptionId,
    transport: Arc<dyn Transport>,
    name: Option<String>,
    acquires: bool,
    filter: Option<Arc<dyn MessageFilter>>,
    credit: CreditManager,
}

impl SubscriptionBuilder {
    /// Consumer tag; defaults to `sub-<id>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Message and byte credit window; `None` leaves a dimension unlimited.
    pub fn credit(mut self, messages: Option<u64>, bytes: Option<u64>) -> Self {
        self.credit = CreditManager::new(messages, bytes);
        self
    }

    /// Non-acquiring subscription: sees every entry once, owns none.
    pub fn browser(mut self) -> Self {
        self.acquires = false;
        self
    }

    pub fn build(self) -> Arc<Subscription> {
        Arc::new(Subscription {
            name: self.name.unwrap_or_else(|| format!("sub-{}", self.id)),
            id: self.id,
            acquires: self.acquires,
            state: AtomicU8::new(ACTIVE),
            credit_blocked: AtomicBool::new(false),
            dispatch_deferred: AtomicBool::new(false),
            queue: RwLock::new(None),
            exclude_rejected: AtomicBool::new(false),
            filter: self.filter,
            transport: self.transport,
            credit: self.credit,
            send_lock: Mutex::new(()),
            outstanding: Mutex::new(BTreeMap::new()),
            next_tag: AtomicU64::new(1),
            browse_position: AtomicU64::new(0),
            last_error: Mutex::new(None),
            messages_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            listeners: ListenerSet::new(),
        })
    }
}

impl Subscription {
    pub fn builder(id: SubscriptionId, transport: Arc<dyn Transport>) -> SubscriptionBuilder {
        SubscriptionBuilder {
            id,
            transport,
            name: None,
            acquires: true,
            filter: None,
            credit: CreditManager::unlimited(),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` for browsers.
    pub fn acquires(&self) -> bool {
        self.acquires
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    pub fn is_suspended(&self) -> bool {
        self.state.load(Ordering::Acquire) == SUSPENDED
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind(&self, queue: Weak<Queue>, exclude_rejected: bool) {
        *self.queue.write() = Some(queue);
        self.exclude_rejected.store(exclude_rejected, Ordering::Release);
    }

    fn unbind(&self) -> Option<Arc<Queue>> {
        self.queue.write().take().and_then(|q| q.upgrade())
    }

    /// Whether this consumer would accept `entry` at all, ignoring capacity.
    pub fn has_interest(&self, entry: &QueueEntry) -> bool {
        if self.exclude_rejected.load(Ordering::Acquire) && entry.is_rejected_by(self.id) {
            return false;
        }
        self.filter.as_ref().map_or(true, |f| f.matches(entry))
    }

    /// `true` when the credit window cannot take `entry`.
    pub fn would_suspend(&self, entry: &QueueEntry) -> bool {
        !self.credit.has_credit(entry.size())
    }

    /// Non-blocking form used by dispatch loops.
    pub fn try_send_lock(&self) -> Option<SendGuard<'_>> {
        self.send_lock.try_lock().map(|lock| SendGuard {
            owner: self,
            lock: Some(lock),
        })
    }

    /// Blocks until no delivery to this subscription is in flight.
    pub fn send_lock(&self) -> SendGuard<'_> {
        SendGuard {
            owner: self,
            lock: Some(self.send_lock.lock()),
        }
    }

    /// Asks for a dispatch pass once the current send-lock holder lets go.
    /// Returns `true` when the lock was already free again, in which case
    /// the caller retries itself.
    pub(crate) fn defer_dispatch(&self) -> bool {
        self.dispatch_deferred.store(true, Ordering::SeqCst);
        if self.send_lock.is_locked() {
            return false;
        }
        self.dispatch_deferred.swap(false, Ordering::SeqCst)
    }

    /// Races for `entry`. Fails once the subscription is no longer active.
    pub fn acquire(&self, guard: &SendGuard<'_>, entry: &Arc<QueueEntry>) -> bool {
        debug_assert!(guard.belongs_to(self), "send guard of another subscription");
        if !self.acquires || !self.is_active() {
            return false;
        }
        let mut outstanding = self.outstanding.lock();
        if !entry.acquire_by(self.id) {
            return false;
        }
        outstanding.insert(
            entry.position(),
            Held {
                entry: entry.clone(),
                credited: false,
            },
        );
        true
    }

    /// Hands `entry` to the transport. The caller holds the send lock and,
    /// for acquiring subscriptions, the entry is acquired by this one.
    pub fn send(&self, guard: &SendGuard<'_>, entry: &Arc<QueueEntry>, batch: bool) -> Result<()> {
        debug_assert!(guard.belongs_to(self), "send guard of another subscription");
        if self.is_closed() {
            return Err(DeliveryError::SubscriptionClosed(self.id));
        }
        let redelivered = if self.acquires {
            let mut outstanding = self.outstanding.lock();
            if !entry.is_acquired_by(self.id) {
                return Err(entry.ownership_error(self.id.into()));
            }
            outstanding
                .entry(entry.position())
                .or_insert_with(|| Held {
                    entry: entry.clone(),
                    credited: false,
                })
                .credited = true;
            let previous = entry.increment_delivery_count();
            if previous > 0 {
                entry.set_redelivered();
            }
            previous > 0
        } else {
            entry.is_redelivered()
        };

        self.credit.use_credit(entry.size());
        let delivery = Delivery {
            subscription: self.id,
            delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            redelivered,
            entry: entry.clone(),
        };
        match self.transport.deliver(delivery, batch) {
            Ok(()) => {
                self.messages_out.fetch_add(1, Ordering::Relaxed);
                self.bytes_out.fetch_add(entry.size(), Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "blipmq::subscription",
                    subscription = %self.id,
                    position = entry.position(),
                    error = %e,
                    "delivery failed"
                );
                Err(e.into())
            }
        }
    }

    pub fn flush_batched(&self, guard: &SendGuard<'_>) -> Result<()> {
        debug_assert!(guard.belongs_to(self), "send guard of another subscription");
        self.transport.flush().map_err(Into::into)
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        let swapped = self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            let (old, new) = (SubscriptionState::from_raw(from), SubscriptionState::from_raw(to));
            debug!(target: "blipmq::subscription", subscription = %self.id, %old, %new, "state changed");
            self.listeners.notify(self, old, new);
        }
        swapped
    }

    /// Flow-control pause. Returns `false` unless the subscription was active.
    pub fn suspend(&self) -> bool {
        self.transition(ACTIVE, SUSPENDED)
    }

    /// Resumes delivery and asks the bound queue for another dispatch pass.
    pub fn resume(&self) -> bool {
        self.credit_blocked.store(false, Ordering::Release);
        let resumed = self.transition(SUSPENDED, ACTIVE);
        if resumed {
            if let Some(queue) = self.queue() {
                queue.trigger();
            }
        }
        resumed
    }

    /// Suspends because the credit window cannot take `entry`. A settlement
    /// that restored credit before the block was recorded would find nothing
    /// to resume, so the window is checked again afterwards.
    pub(crate) fn suspend_for_credit(&self, entry: &QueueEntry) -> bool {
        if !self.suspend() {
            return false;
        }
        self.credit_blocked.store(true, Ordering::SeqCst);
        if self.credit.has_credit(entry.size()) {
            self.resume();
        }
        true
    }

    fn settled(&self, held: Option<Held>) {
        if let Some(held) = held.filter(|h| h.credited) {
            self.credit.restore_credit(held.entry.size());
            self.resume_if_credit();
        }
    }

    /// Grants more credit to the consumer.
    pub fn add_credit(&self, messages: u64, bytes: u64) {
        self.credit.add_credit(messages, bytes);
        self.resume_if_credit();
    }

    fn resume_if_credit(&self) {
        if self.credit_blocked.load(Ordering::SeqCst) && self.credit.has_credit(0) {
            self.resume();
        }
    }

    /// Closes the subscription and releases every entry it still owns
    /// before returning. Idempotent; returns the number of released entries.
    pub fn close(&self) -> usize {
        let guard = self.send_lock();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == CLOSED {
                return 0;
            }
            match self
                .state
                .compare_exchange(current, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.listeners.notify(
            self,
            SubscriptionState::from_raw(current),
            SubscriptionState::Closed,
        );

        let owned = std::mem::take(&mut *self.outstanding.lock());
        let mut released = 0;
        for held in owned.into_values() {
            match held.entry.release(self.id) {
                Ok(()) => released += 1,
                Err(e) => debug!(
                    target: "blipmq::subscription",
                    subscription = %self.id,
                    error = %e,
                    "outstanding entry already settled"
                ),
            }
        }
        drop(guard);

        if let Some(queue) = self.unbind() {
            queue.remove_subscription(self.id);
        }
        info!(
            target: "blipmq::subscription",
            subscription = %self.id,
            name = %self.name,
            released,
            "subscription closed"
        );
        released
    }

    /// Called by the queue while it is being deleted.
    pub(crate) fn queue_deleted(&self) -> usize {
        self.close()
    }

    /// Settles an owned entry by deleting it.
    pub fn acknowledge(&self, entry: &QueueEntry) -> Result<()> {
        let held = {
            let mut outstanding = self.outstanding.lock();
            entry.delete_acquired(self.id)?;
            outstanding.remove(&entry.position())
        };
        self.settled(held);
        Ok(())
    }

    /// Gives an owned entry back for redelivery at its original position.
    pub fn release(&self, entry: &QueueEntry) -> Result<()> {
        let held = {
            let mut outstanding = self.outstanding.lock();
            entry.release(self.id)?;
            outstanding.remove(&entry.position())
        };
        self.settled(held);
        Ok(())
    }

    /// Rejects an owned entry under the bound queue's reject policy.
    pub fn reject(&self, entry: &QueueEntry) -> Result<RejectOutcome> {
        let queue = self.queue().ok_or(DeliveryError::Unbound(self.id))?;
        let (outcome, held) = {
            let mut outstanding = self.outstanding.lock();
            let outcome = queue.reject(entry, self.id)?;
            (outcome, outstanding.remove(&entry.position()))
        };
        self.settled(held);
        Ok(outcome)
    }

    pub fn outstanding(&self) -> Vec<Arc<QueueEntry>> {
        self.outstanding
            .lock()
            .values()
            .map(|h| h.entry.clone())
            .collect()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub(crate) fn record_failure(&self, error: DeliveryError) {
        if let DeliveryError::Transport(e) = error {
            *self.last_error.lock() = Some(e);
        }
    }

    /// Last transport failure seen while dispatching, for the closer to act on.
    pub fn take_error(&self) -> Option<TransportError> {
        self.last_error.lock().take()
    }

    pub(crate) fn browse_position(&self) -> u64 {
        self.browse_position.load(Ordering::Acquire)
    }

    pub(crate) fn advance_browse(&self, position: u64) {
        self.browse_position.fetch_max(position, Ordering::AcqRel);
    }

    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn add_state_change_listener(
        &self,
        listener: Arc<dyn StateChangeListener<Subscription, SubscriptionState>>,
    ) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_state_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("acquires", &self.acquires)
            .field("outstanding", &self.outstanding_count())
            .finish()
    }
}
