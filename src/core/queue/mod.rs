//! Queues: the ordered backlog of one destination plus the subscriptions
//! consuming from it.
//!
//! Every message routed to a queue becomes a [`QueueEntry`] appended to the
//! queue's [`EntryChain`]. Ownership of an entry only ever moves through the
//! entry's own compare-and-set operations; the queue merely offers available
//! entries to subscriptions (see [`dispatch`]) and performs broker-side
//! maintenance such as purge, move, expiry and deletion.

pub mod chain;
pub mod dispatch;
pub mod entry;

pub use chain::{EntryChain, EntryIter};
pub use dispatch::DispatchReport;
pub use entry::{EntryState, Owner, QueueEntry};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::error::{DeliveryError, Result};
use crate::core::message::{current_timestamp, Message};
use crate::core::routing::{
    AlternateRouter, AutoCommit, NoAlternate, RejectOutcome, RejectPolicy, ServerTransaction,
};
use crate::core::subscriber::{MessageFilter, Subscription, SubscriptionId};

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new message.
    #[default]
    DropNew,
    /// Delete the oldest available entry to make room.
    DropOldest,
}

/// Order in which subscriptions are offered an entry.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    /// Start each entry at the subscription after the last one served.
    #[default]
    RoundRobin,
    /// Always start at the earliest registered subscription.
    Registration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// 0 = unbounded.
    pub max_depth: usize,
    pub overflow_policy: OverflowPolicy,
    /// Applied to messages that carry no expiry of their own. 0 = never.
    pub default_ttl_ms: u64,
    pub dispatch_order: DispatchOrder,
    pub reject: RejectPolicy,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    expired: AtomicU64,
    routed: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time view of a queue, suitable for management output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub message_count: u64,
    pub available_count: u64,
    pub consumer_count: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub expired: u64,
    pub routed: u64,
    pub delivered: u64,
}

#[derive(Debug)]
struct SweepState {
    last_sweep: Instant,
    dequeued_at_last_sweep: u64,
}

pub struct Queue {
    id: Uuid,
    name: String,
    config: QueueConfig,
    chain: EntryChain,
    /// Entries appended and not yet deleted.
    depth: AtomicU64,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    exclusive: AtomicBool,
    rr_cursor: AtomicUsize,
    alternate: RwLock<Arc<dyn AlternateRouter>>,
    wakeup: Notify,
    stopped: AtomicBool,
    deleted: AtomicBool,
    counters: Counters,
    sweep: Mutex<SweepState>,
    self_ref: Weak<Queue>,
}

impl Queue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Arc<Self> {
        let name = name.into();
        debug!(target: "blipmq::queue", queue = %name, "creating queue");
        Arc::new_cyclic(|self_ref| Self {
            id: Uuid::new_v4(),
            name,
            config,
            chain: EntryChain::new(),
            depth: AtomicU64::new(0),
            subscriptions: RwLock::new(Vec::new()),
            exclusive: AtomicBool::new(false),
            rr_cursor: AtomicUsize::new(0),
            alternate: RwLock::new(Arc::new(NoAlternate)),
            wakeup: Notify::new(),
            stopped: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            counters: Counters::default(),
            sweep: Mutex::new(SweepState {
                last_sweep: Instant::now(),
                dequeued_at_last_sweep: 0,
            }),
            self_ref: self_ref.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn chain(&self) -> &EntryChain {
        &self.chain
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        !self.is_stopped() && !self.is_deleted()
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(DeliveryError::QueueDeleted(self.name.clone()));
        }
        if self.is_stopped() {
            return Err(DeliveryError::QueueStopped(self.name.clone()));
        }
        Ok(())
    }

    /// Appends `message` at the tail and wakes the dispatcher.
    pub fn enqueue(&self, message: Arc<Message>) -> Result<Arc<QueueEntry>> {
        self.ensure_accepting()?;

        let max_depth = self.config.max_depth;
        while !self.reserve_slot() {
            let made_room = match self.config.overflow_policy {
                OverflowPolicy::DropNew => false,
                OverflowPolicy::DropOldest => self.drop_oldest(),
            };
            if !made_room {
                warn!(target: "blipmq::queue", queue = %self.name, max_depth, "queue full; message refused");
                return Err(DeliveryError::QueueFull {
                    name: self.name.clone(),
                    max_depth,
                });
            }
        }

        let expire_at = match (message.expire_at, self.config.default_ttl_ms) {
            (0, 0) => 0,
            (0, ttl) => current_timestamp().saturating_add(ttl),
            (at, _) => at,
        };

        let entry = self.chain.append(message, expire_at, self.self_ref.clone());
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "blipmq::queue",
            queue = %self.name,
            position = entry.position(),
            "message enqueued"
        );
        self.trigger();
        Ok(entry)
    }

    /// Counts a new entry against `max_depth`, or returns `false` when the
    /// queue is full.
    fn reserve_slot(&self) -> bool {
        let max_depth = self.config.max_depth as u64;
        self.depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (max_depth == 0 || depth < max_depth).then_some(depth + 1)
            })
            .is_ok()
    }

    fn drop_oldest(&self) -> bool {
        for entry in self.chain.iter() {
            if entry.acquire() && entry.delete_acquired(Owner::Broker).is_ok() {
                debug!(
                    target: "blipmq::queue",
                    queue = %self.name,
                    position = entry.position(),
                    "dropped oldest entry on overflow"
                );
                return true;
            }
        }
        false
    }

    /// Binds `subscription` to this queue. Exclusive access is granted only
    /// to the first consumer and, once granted, admits no other.
    pub fn add_subscription(&self, subscription: &Arc<Subscription>, exclusive: bool) -> Result<()> {
        self.ensure_accepting()?;
        if subscription.is_closed() {
            return Err(DeliveryError::SubscriptionClosed(subscription.id()));
        }
        {
            let mut subscriptions = self.subscriptions.write();
            if subscriptions.iter().any(|s| s.id() == subscription.id()) {
                return Ok(());
            }
            if self.exclusive.load(Ordering::Acquire) && !subscriptions.is_empty() {
                return Err(DeliveryError::ExclusiveConsumer(self.name.clone()));
            }
            if exclusive && !subscriptions.is_empty() {
                return Err(DeliveryError::ExclusiveDenied(self.name.clone()));
            }
            subscription.bind(
                self.self_ref.clone(),
                self.config.reject.exclude_rejecting_subscriptions,
            );
            subscriptions.push(subscription.clone());
            self.exclusive.store(exclusive, Ordering::Release);
        }
        info!(
            target: "blipmq::queue",
            queue = %self.name,
            subscription = %subscription.id(),
            name = %subscription.name(),
            exclusive,
            browser = !subscription.acquires(),
            "subscription bound"
        );
        self.trigger();
        Ok(())
    }

    /// Detaches a subscription without closing it. Closing a subscription
    /// calls this itself.
    pub(crate) fn remove_subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let index = subscriptions.iter().position(|s| s.id() == id)?;
            let removed = subscriptions.remove(index);
            if subscriptions.is_empty() {
                self.exclusive.store(false, Ordering::Release);
            }
            removed
        };
        debug!(target: "blipmq::queue", queue = %self.name, subscription = %id, "subscription removed");
        self.trigger();
        Some(removed)
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().clone()
    }

    pub fn consumer_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn has_exclusive_consumer(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    /// Entries that are not deleted, acquired ones included.
    pub fn message_count(&self) -> u64 {
        self.depth.load(Ordering::Acquire)
    }

    pub fn available_count(&self) -> u64 {
        self.chain.iter().filter(|e| e.is_available()).count() as u64
    }

    pub fn set_alternate(&self, router: Arc<dyn AlternateRouter>) {
        *self.alternate.write() = router;
    }

    pub fn alternate(&self) -> Arc<dyn AlternateRouter> {
        self.alternate.read().clone()
    }

    /// Applies this queue's reject policy to an entry owned by `subscription`.
    pub fn reject(&self, entry: &QueueEntry, subscription: SubscriptionId) -> Result<RejectOutcome> {
        let router = self.alternate();
        let outcome = entry.reject(subscription, &self.config.reject, router.as_ref(), &AutoCommit)?;
        if let RejectOutcome::Routed(count) = outcome {
            self.counters.routed.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Deletes up to `limit` (0 = all) available entries accepted by
    /// `filter`, routing each through `alternate` first when given.
    pub fn purge(
        &self,
        limit: usize,
        filter: Option<&dyn MessageFilter>,
        alternate: Option<&dyn AlternateRouter>,
    ) -> usize {
        let mut purged = 0;
        for entry in self.chain.iter() {
            if limit > 0 && purged >= limit {
                break;
            }
            if !entry.is_available() || filter.is_some_and(|f| !f.matches(&entry)) {
                continue;
            }
            if !entry.acquire() {
                continue;
            }
            if let Some(router) = alternate {
                let routed = router.route_to_alternate(&entry, &AutoCommit);
                self.counters.routed.fetch_add(routed as u64, Ordering::Relaxed);
            }
            if entry.delete_acquired(Owner::Broker).is_ok() {
                purged += 1;
            }
        }
        self.chain.compact();
        info!(target: "blipmq::queue", queue = %self.name, purged, "queue purged");
        purged
    }

    /// Moves up to `limit` (0 = all) available entries accepted by `filter`
    /// to `destination`, preserving their order.
    pub fn move_to(
        &self,
        destination: &Queue,
        limit: usize,
        filter: Option<&dyn MessageFilter>,
    ) -> Result<usize> {
        destination.ensure_accepting()?;
        if std::ptr::eq(self, destination) {
            return Ok(0);
        }
        let mut moved = 0;
        for entry in self.chain.iter() {
            if limit > 0 && moved >= limit {
                break;
            }
            if !entry.is_available() || filter.is_some_and(|f| !f.matches(&entry)) {
                continue;
            }
            if !entry.acquire() {
                continue;
            }
            let Some(message) = entry.message() else {
                continue;
            };
            if let Err(e) = destination.enqueue(message) {
                warn!(
                    target: "blipmq::queue",
                    queue = %self.name,
                    destination = %destination.name(),
                    error = %e,
                    "move stopped early"
                );
                entry.release(Owner::Broker)?;
                break;
            }
            if entry.delete_acquired(Owner::Broker).is_ok() {
                moved += 1;
            }
        }
        self.chain.compact();
        info!(
            target: "blipmq::queue",
            queue = %self.name,
            destination = %destination.name(),
            moved,
            "entries moved"
        );
        Ok(moved)
    }

    /// Pull-mode consumption: acquires the oldest available, unexpired entry
    /// for `owner`. Expired entries met on the way are reaped.
    pub fn get(&self, owner: impl Into<Owner>) -> Option<Arc<QueueEntry>> {
        let owner = owner.into();
        if !self.is_accepting() {
            return None;
        }
        let now = current_timestamp();
        for entry in self.chain.iter() {
            if entry.expired(now) {
                if self.expire(&entry) {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            if entry.acquire_as(owner) {
                debug!(
                    target: "blipmq::queue",
                    queue = %self.name,
                    position = entry.position(),
                    %owner,
                    "entry fetched"
                );
                return Some(entry);
            }
        }
        None
    }

    /// The non-deleted entry at `position`, if any.
    pub fn find(&self, position: u64) -> Option<Arc<QueueEntry>> {
        self.chain
            .iter()
            .take_while(|e| e.position() <= position)
            .find(|e| e.position() == position)
    }

    /// Acquires the entry at `position` for `owner`. `None` when nothing
    /// live sits there or someone else holds it.
    pub fn acquire_at(&self, position: u64, owner: impl Into<Owner>) -> Option<Arc<QueueEntry>> {
        let owner = owner.into();
        let Some(entry) = self.find(position) else {
            debug!(target: "blipmq::queue", queue = %self.name, position, "no entry at position");
            return None;
        };
        if !entry.acquire_as(owner) {
            debug!(target: "blipmq::queue", queue = %self.name, position, %owner, "entry at position not available");
            return None;
        }
        Some(entry)
    }

    /// Snapshot of the available entries in chain order. Nothing is acquired.
    pub fn browse(&self) -> Vec<Arc<QueueEntry>> {
        self.chain.iter().filter(|e| e.is_available()).collect()
    }

    /// Wakes the dispatcher for another pass.
    pub fn trigger(&self) {
        self.wakeup.notify_one();
    }

    /// Stops dispatching and refuses new messages. Idempotent; returns
    /// `true` only for the call that stopped the queue.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(target: "blipmq::queue", queue = %self.name, "queue stopped");
        self.wakeup.notify_one();
        true
    }

    /// Stops the queue, closes every bound subscription (releasing what they
    /// hold), then routes each remaining entry to the alternate and deletes
    /// it. Returns the number of alternate deliveries.
    pub fn delete(&self, txn: &dyn ServerTransaction) -> usize {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.stop();

        let subscriptions = std::mem::take(&mut *self.subscriptions.write());
        self.exclusive.store(false, Ordering::Release);
        for subscription in subscriptions {
            subscription.queue_deleted();
        }

        let router = self.alternate();
        let mut routed = 0;
        for entry in self.chain.iter() {
            if !entry.acquire() {
                continue;
            }
            routed += router.route_to_alternate(&entry, txn);
            if let Err(e) = entry.delete_acquired(Owner::Broker) {
                debug!(target: "blipmq::queue", queue = %self.name, error = %e, "entry settled during delete");
            }
        }
        self.counters.routed.fetch_add(routed as u64, Ordering::Relaxed);
        self.chain.compact();
        info!(target: "blipmq::queue", queue = %self.name, routed, "queue deleted");
        routed
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            message_count: self.message_count(),
            available_count: self.available_count(),
            consumer_count: self.consumer_count(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            routed: self.counters.routed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn on_entry_released(&self, _entry: &QueueEntry) {
        self.trigger();
    }

    pub(crate) fn on_entry_deleted(&self, _entry: &QueueEntry) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.message_count())
            .field("consumers", &self.consumer_count())
            .field("stopped", &self.is_stopped())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::new_message;
    use crate::core::routing::AlternateQueue;
    use crate::core::subscriber::{HeaderFilter, IdSource, SequentialIds};
    use crate::core::transport::ChannelTransport;
    use std::collections::HashSet;
    use std::thread;

    fn msg(body: &str) -> Arc<Message> {
        Arc::new(new_message(body.to_string()))
    }

    fn filled(name: &str, n: usize) -> Arc<Queue> {
        let queue = Queue::new(name, QueueConfig::default());
        for i in 0..n {
            queue.enqueue(msg(&format!("m{i}"))).unwrap();
        }
        queue
    }

    fn consumer(ids: &SequentialIds) -> Arc<Subscription> {
        let (transport, _rx) = ChannelTransport::new();
        Subscription::builder(ids.next_id(), transport).build()
    }

    #[test]
    fn enqueue_counts_and_positions() {
        let queue = filled("q", 3);
        assert_eq!(queue.message_count(), 3);
        assert_eq!(queue.available_count(), 3);
        let positions: Vec<u64> = queue.browse().iter().map(|e| e.position()).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(queue.stats().enqueued, 3);
    }

    #[test]
    fn stopped_queue_refuses_messages() {
        let queue = filled("q", 0);
        assert!(queue.stop());
        assert!(!queue.stop());
        assert!(matches!(
            queue.enqueue(msg("late")),
            Err(DeliveryError::QueueStopped(_))
        ));
    }

    #[test]
    fn drop_new_overflow_refuses() {
        let queue = Queue::new(
            "bounded",
            QueueConfig {
                max_depth: 2,
                ..QueueConfig::default()
            },
        );
        queue.enqueue(msg("a")).unwrap();
        queue.enqueue(msg("b")).unwrap();
        assert!(matches!(
            queue.enqueue(msg("c")),
            Err(DeliveryError::QueueFull { max_depth: 2, .. })
        ));
        assert_eq!(queue.message_count(), 2);
    }

    #[test]
    fn drop_oldest_overflow_makes_room() {
        let queue = Queue::new(
            "bounded",
            QueueConfig {
                max_depth: 2,
                overflow_policy: OverflowPolicy::DropOldest,
                ..QueueConfig::default()
            },
        );
        let first = queue.enqueue(msg("a")).unwrap();
        queue.enqueue(msg("b")).unwrap();
        queue.enqueue(msg("c")).unwrap();
        assert!(first.is_deleted());
        assert_eq!(queue.message_count(), 2);
        let bodies: Vec<_> = queue
            .browse()
            .iter()
            .filter_map(|e| e.message())
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(bodies, vec!["b", "c"]);
    }

    #[test]
    fn default_ttl_applies_to_messages_without_expiry() {
        let queue = Queue::new(
            "ttl",
            QueueConfig {
                default_ttl_ms: 60_000,
                ..QueueConfig::default()
            },
        );
        let entry = queue.enqueue(msg("a")).unwrap();
        assert!(entry.expires_at() > current_timestamp());
    }

    #[test]
    fn exclusive_consumer_rules() {
        let ids = SequentialIds::new();
        let queue = filled("q", 0);
        let first = consumer(&ids);
        queue.add_subscription(&first, true).unwrap();
        assert!(matches!(
            queue.add_subscription(&consumer(&ids), false),
            Err(DeliveryError::ExclusiveConsumer(_))
        ));
        first.close();
        assert!(!queue.has_exclusive_consumer());

        let shared = consumer(&ids);
        queue.add_subscription(&shared, false).unwrap();
        assert!(matches!(
            queue.add_subscription(&consumer(&ids), true),
            Err(DeliveryError::ExclusiveDenied(_))
        ));
    }

    #[test]
    fn purge_respects_limit_filter_and_ownership() {
        let queue = Queue::new("q", QueueConfig::default());
        for i in 0..6 {
            let colour = if i % 2 == 0 { "red" } else { "blue" };
            queue
                .enqueue(Arc::new(Message::builder(format!("m{i}")).header("colour", colour).build()))
                .unwrap();
        }
        let held = queue.chain().first_valid().unwrap();
        assert!(held.acquire_by(SubscriptionId::new(7).unwrap()));

        let red = HeaderFilter::new("colour", "red");
        assert_eq!(queue.purge(1, Some(&red), None), 1);
        assert_eq!(queue.purge(0, Some(&red), None), 1);
        assert!(held.is_acquired());
        assert_eq!(queue.purge(0, None, None), 3);
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn purge_can_route_to_alternate() {
        let queue = filled("q", 3);
        let dlq = filled("dlq", 0);
        let router = AlternateQueue::new(&dlq);
        assert_eq!(queue.purge(0, None, Some(&router)), 3);
        assert_eq!(dlq.message_count(), 3);
        assert_eq!(queue.stats().routed, 3);
    }

    #[test]
    fn move_preserves_order() {
        let source = filled("src", 4);
        let destination = filled("dst", 0);
        assert_eq!(source.move_to(&destination, 3, None).unwrap(), 3);
        assert_eq!(source.message_count(), 1);
        let bodies: Vec<_> = destination
            .browse()
            .iter()
            .filter_map(|e| e.message())
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn move_to_stopped_queue_fails() {
        let source = filled("src", 1);
        let destination = filled("dst", 0);
        destination.stop();
        assert!(source.move_to(&destination, 0, None).is_err());
        assert_eq!(source.available_count(), 1);
    }

    #[test]
    fn delete_closes_consumers_and_routes_backlog() {
        let ids = SequentialIds::new();
        let queue = filled("q", 3);
        let dlq = filled("dlq", 0);
        queue.set_alternate(Arc::new(AlternateQueue::new(&dlq)));

        let sub = consumer(&ids);
        queue.add_subscription(&sub, false).unwrap();
        let first = queue.chain().first_valid().unwrap();
        {
            let guard = sub.send_lock();
            assert!(sub.acquire(&guard, &first));
        }

        assert_eq!(queue.delete(&AutoCommit), 3);
        assert_eq!(queue.delete(&AutoCommit), 0);
        assert!(sub.is_closed());
        assert!(first.is_deleted());
        assert_eq!(queue.message_count(), 0);
        assert_eq!(dlq.message_count(), 3);
        assert!(matches!(
            queue.enqueue(msg("late")),
            Err(DeliveryError::QueueDeleted(_))
        ));
    }

    #[test]
    fn concurrent_enqueues_never_exceed_max_depth() {
        let queue = Queue::new(
            "bounded",
            QueueConfig {
                max_depth: 50,
                ..QueueConfig::default()
            },
        );
        let accepted: usize = (0..8)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    (0..100)
                        .filter(|i| queue.enqueue(msg(&format!("{t}-{i}"))).is_ok())
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(accepted, 50);
        assert_eq!(queue.message_count(), 50);
        assert_eq!(queue.available_count(), 50);
    }

    #[test]
    fn get_takes_oldest_available_and_skips_expired() {
        let queue = Queue::new("pull", QueueConfig::default());
        queue
            .enqueue(Arc::new(Message {
                expire_at: 1,
                ..Message::builder("old").build()
            }))
            .unwrap();
        queue.enqueue(msg("a")).unwrap();
        queue.enqueue(msg("b")).unwrap();
        let caller = SubscriptionId::new(9).unwrap();

        let first = queue.get(caller).unwrap();
        assert_eq!(first.position(), 2);
        assert!(first.is_acquired_by(caller));
        assert_eq!(queue.stats().expired, 1);

        let second = queue.get(Owner::Broker).unwrap();
        assert_eq!(second.position(), 3);
        assert!(queue.get(caller).is_none());

        first.release(caller).unwrap();
        assert_eq!(queue.get(caller).map(|e| e.position()), Some(2));
    }

    #[test]
    fn acquire_at_targets_one_position() {
        let queue = filled("q", 3);
        let owner = SubscriptionId::new(4).unwrap();
        let entry = queue.acquire_at(2, owner).unwrap();
        assert_eq!(entry.position(), 2);
        assert!(entry.is_acquired_by(owner));
        assert!(queue.acquire_at(2, Owner::Broker).is_none());
        assert!(queue.acquire_at(7, owner).is_none());

        entry.delete_acquired(owner).unwrap();
        assert!(queue.find(2).is_none());
        assert_eq!(queue.find(3).map(|e| e.position()), Some(3));
    }

    #[test]
    fn pull_and_push_consumers_never_share_an_entry() {
        let ids = SequentialIds::new();
        let queue = filled("shared", 2_000);
        let (transport, mut rx) = ChannelTransport::new();
        let pushed = Subscription::builder(ids.next_id(), transport).build();
        queue.add_subscription(&pushed, false).unwrap();

        let dispatcher = {
            let queue = queue.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    queue.process_queue();
                }
            })
        };
        let pullers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(entry) = queue.get(Owner::Broker) {
                        got.push(entry.position());
                    }
                    got
                })
            })
            .collect();
        let position_pullers: Vec<_> = (1..=2)
            .map(|offset| {
                let queue = queue.clone();
                let owner = SubscriptionId::new(1_000 + offset).unwrap();
                thread::spawn(move || {
                    (offset..=2_000)
                        .step_by(7)
                        .filter_map(|p| queue.acquire_at(p, owner))
                        .map(|e| e.position())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        dispatcher.join().unwrap();
        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in pullers.into_iter().chain(position_pullers) {
            for position in handle.join().unwrap() {
                assert!(seen.insert(position), "entry {position} taken twice");
                total += 1;
            }
        }
        queue.process_queue();
        while let Ok(delivery) = rx.try_recv() {
            assert!(seen.insert(delivery.entry.position()));
            total += 1;
        }
        assert_eq!(total, 2_000);
        assert_eq!(queue.available_count(), 0);
    }
}
