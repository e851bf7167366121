//! Dispatch: offering available entries to subscriptions.
//!
//! A pass walks the chain oldest-first. Each available entry is offered to
//! the acquiring subscriptions in the queue's [`DispatchOrder`] until one
//! acquires and sends it; entries nobody takes stay where they are for the
//! next pass. Browsers are fed separately from a per-browser cursor and
//! never acquire. Passes are triggered by enqueue, release, subscription
//! changes and credit restoration, all funnelled through [`Queue::trigger`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::core::message::current_timestamp;
use crate::core::queue::{DispatchOrder, Owner, Queue, QueueEntry};
use crate::core::subscriber::Subscription;

/// Work done by one dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub browsed: usize,
    pub expired: usize,
}

enum Attempt {
    Delivered,
    /// Another path holds the send lock.
    Busy,
    /// Someone else took the entry first.
    Lost,
    Skipped,
}

impl Queue {
    /// Runs one dispatch pass synchronously.
    pub fn process_queue(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        if !self.is_accepting() {
            return report;
        }
        self.chain.compact();

        let subscriptions = self.subscriptions();
        if subscriptions.is_empty() {
            return report;
        }
        let (consumers, browsers): (Vec<_>, Vec<_>) =
            subscriptions.into_iter().partition(|s| s.acquires());

        let now = current_timestamp();
        let mut retry = false;

        for browser in &browsers {
            match self.feed_browser(browser, now) {
                Some(sent) => report.browsed += sent,
                None => retry |= browser.defer_dispatch(),
            }
        }

        let n = consumers.len();
        let mut served = vec![false; n];
        let mut start = match self.config.dispatch_order {
            DispatchOrder::RoundRobin => self.rr_cursor.load(Ordering::Relaxed) % n.max(1),
            DispatchOrder::Registration => 0,
        };

        for entry in self.chain.iter() {
            if n == 0 || !consumers.iter().any(|s| s.is_active()) {
                break;
            }
            if entry.expired(now) {
                if self.expire(&entry) {
                    report.expired += 1;
                }
                continue;
            }
            if !entry.is_available() {
                continue;
            }

            for k in 0..n {
                let index = (start + k) % n;
                match attempt_delivery(&consumers[index], &entry) {
                    Attempt::Delivered => {
                        report.delivered += 1;
                        served[index] = true;
                        if self.config.dispatch_order == DispatchOrder::RoundRobin {
                            start = (index + 1) % n;
                        }
                        break;
                    }
                    Attempt::Busy => retry |= consumers[index].defer_dispatch(),
                    Attempt::Lost => break,
                    Attempt::Skipped => {}
                }
            }
        }
        self.rr_cursor.store(start, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        for (subscription, _) in consumers.iter().zip(served).filter(|(_, s)| *s) {
            let guard = subscription.send_lock();
            if let Err(e) = subscription.flush_batched(&guard) {
                warn!(
                    target: "blipmq::dispatch",
                    queue = %self.name,
                    subscription = %subscription.id(),
                    error = %e,
                    "flush failed"
                );
                subscription.record_failure(e);
            }
        }

        if report.expired > 0 {
            self.counters
                .expired
                .fetch_add(report.expired as u64, Ordering::Relaxed);
        }
        if retry {
            self.trigger();
        }
        trace!(
            target: "blipmq::dispatch",
            queue = %self.name,
            delivered = report.delivered,
            browsed = report.browsed,
            expired = report.expired,
            "dispatch pass complete"
        );
        report
    }

    /// Sends a browser everything past its cursor. `None` when its send
    /// lock was busy.
    fn feed_browser(&self, browser: &Subscription, now: u64) -> Option<usize> {
        if !browser.is_active() {
            return Some(0);
        }
        let guard = browser.try_send_lock()?;
        let from = browser.browse_position();
        let mut sent = 0;
        for entry in self.chain.iter() {
            if entry.position() <= from || entry.expired(now) {
                continue;
            }
            if !browser.has_interest(&entry) {
                browser.advance_browse(entry.position());
                continue;
            }
            if browser.would_suspend(&entry) {
                browser.suspend_for_credit(&entry);
                break;
            }
            if let Err(e) = browser.send(&guard, &entry, true) {
                browser.record_failure(e);
                browser.suspend();
                break;
            }
            browser.advance_browse(entry.position());
            sent += 1;
        }
        if sent > 0 {
            if let Err(e) = browser.flush_batched(&guard) {
                browser.record_failure(e);
            }
        }
        Some(sent)
    }

    pub(super) fn expire(&self, entry: &QueueEntry) -> bool {
        if entry.acquire() && entry.delete_acquired(Owner::Broker).is_ok() {
            debug!(
                target: "blipmq::dispatch",
                queue = %self.name,
                position = entry.position(),
                "entry expired"
            );
            return true;
        }
        false
    }

    /// Deletes every available entry whose expiry is at or before `now_ms`.
    pub fn remove_expired(&self, now_ms: u64) -> usize {
        let expired = self
            .chain
            .iter()
            .filter(|e| e.expired(now_ms))
            .filter(|e| self.expire(e))
            .count();
        if expired > 0 {
            self.counters
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            self.chain.compact();
        }
        expired
    }

    /// Background expiry pass. Skipped while consumers have been dequeuing
    /// at least one entry per whole second since the previous sweep, since
    /// dispatch reaps expired entries it walks over. A sweep less than a
    /// second after the last one always runs.
    pub fn purge_expired(&self) -> usize {
        let dequeued = self.counters.dequeued.load(Ordering::Relaxed);
        {
            let mut sweep = self.sweep.lock();
            let seconds = sweep.last_sweep.elapsed().as_secs();
            let since = dequeued.saturating_sub(sweep.dequeued_at_last_sweep);
            sweep.last_sweep = Instant::now();
            sweep.dequeued_at_last_sweep = dequeued;
            if seconds > 0 && since / seconds >= 1 {
                trace!(target: "blipmq::dispatch", queue = %self.name, since, "expiry sweep skipped");
                return 0;
            }
        }
        let expired = self.remove_expired(current_timestamp());
        if expired > 0 {
            debug!(target: "blipmq::dispatch", queue = %self.name, expired, "expiry sweep");
        }
        expired
    }

    /// Runs dispatch passes on every trigger until the queue stops or is dropped.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        let name = self.name.clone();
        tokio::spawn(async move {
            debug!(target: "blipmq::dispatch", queue = %name, "dispatcher started");
            loop {
                let Some(queue) = queue.upgrade() else { break };
                if queue.is_stopped() {
                    break;
                }
                queue.process_queue();
                queue.wakeup.notified().await;
            }
            debug!(target: "blipmq::dispatch", queue = %name, "dispatcher exited");
        })
    }

    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else { break };
                if queue.is_stopped() {
                    break;
                }
                queue.purge_expired();
            }
        })
    }
}

fn attempt_delivery(subscription: &Subscription, entry: &Arc<QueueEntry>) -> Attempt {
    if !subscription.is_active() || !subscription.has_interest(entry) {
        return Attempt::Skipped;
    }
    if subscription.would_suspend(entry) {
        subscription.suspend_for_credit(entry);
        return Attempt::Skipped;
    }
    let Some(guard) = subscription.try_send_lock() else {
        return Attempt::Busy;
    };
    if !subscription.acquire(&guard, entry) {
        // A close that won the race leaves the entry available for others.
        return if entry.is_available() {
            Attempt::Skipped
        } else {
            Attempt::Lost
        };
    }
    match subscription.send(&guard, entry, true) {
        Ok(()) => Attempt::Delivered,
        Err(e) => {
            // The entry stays owned; whoever closes the subscription releases it.
            subscription.record_failure(e);
            subscription.suspend();
            Attempt::Skipped
        }
    }
}
