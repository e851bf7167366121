mod common;

use std::sync::Arc;

use blipmq_delivery::core::queue::{DispatchOrder, QueueEntry};
use blipmq_delivery::core::routing::{AlternateQueue, RejectOutcome};
use blipmq_delivery::core::subscriber::SequentialIds;
use blipmq_delivery::{DeliveryError, Queue, QueueConfig, Subscription};

fn take(sub: &Subscription, entry: &Arc<QueueEntry>) {
    let guard = sub.send_lock();
    assert!(sub.acquire(&guard, entry));
}

fn with_dead_letter(n: usize) -> (Arc<Queue>, Arc<Queue>) {
    let queue = common::queue_with("work", QueueConfig::default(), n);
    let dlq = Queue::new("work.dlq", QueueConfig::default());
    queue.set_alternate(Arc::new(AlternateQueue::new(&dlq)));
    (queue, dlq)
}

#[test]
fn third_rejection_routes_once_and_deletes() {
    common::init_logging();
    let ids = SequentialIds::new();
    let (queue, dlq) = with_dead_letter(1);
    let entry = queue.chain().first_valid().unwrap();

    let subs: Vec<_> = (0..3).map(|_| common::consumer(&ids, None)).collect();
    for (sub, _) in &subs {
        queue.add_subscription(sub, false).unwrap();
    }

    let mut outcomes = Vec::new();
    for (sub, _) in &subs {
        take(sub, &entry);
        outcomes.push(sub.reject(&entry).unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            RejectOutcome::Released,
            RejectOutcome::Released,
            RejectOutcome::Routed(1)
        ]
    );
    assert!(entry.is_deleted());
    assert_eq!(dlq.message_count(), 1);
    assert_eq!(queue.message_count(), 0);
    assert_eq!(queue.stats().routed, 1);
    for (sub, _) in &subs {
        assert!(entry.is_rejected_by(sub.id()));
        assert_eq!(sub.outstanding_count(), 0);
    }
}

#[test]
fn two_rejections_leave_entry_available() {
    common::init_logging();
    let ids = SequentialIds::new();
    let (queue, dlq) = with_dead_letter(1);
    let entry = queue.chain().first_valid().unwrap();

    for _ in 0..2 {
        let (sub, _rx) = common::consumer(&ids, None);
        queue.add_subscription(&sub, false).unwrap();
        take(&sub, &entry);
        assert_eq!(sub.reject(&entry).unwrap(), RejectOutcome::Released);
    }
    assert!(entry.is_available());
    assert_eq!(entry.rejection_count(), 2);
    assert_eq!(dlq.message_count(), 0);
}

#[test]
fn rejecting_consumer_is_skipped_on_redelivery() {
    common::init_logging();
    let ids = SequentialIds::new();
    let queue = common::queue_with(
        "exclusion",
        QueueConfig {
            dispatch_order: DispatchOrder::Registration,
            ..QueueConfig::default()
        },
        1,
    );
    let (picky, mut picky_rx) = common::consumer(&ids, None);
    let (other, mut other_rx) = common::consumer(&ids, None);
    queue.add_subscription(&picky, false).unwrap();
    queue.add_subscription(&other, false).unwrap();

    queue.process_queue();
    let first = common::drain(&mut picky_rx);
    assert_eq!(first.len(), 1);
    picky.reject(&first[0].entry).unwrap();

    queue.process_queue();
    assert!(common::drain(&mut picky_rx).is_empty());
    let second = common::drain(&mut other_rx);
    assert_eq!(second.len(), 1);
    assert!(second[0].redelivered);
}

#[test]
fn rejecting_an_entry_you_do_not_own_is_an_error() {
    common::init_logging();
    let ids = SequentialIds::new();
    let (queue, _dlq) = with_dead_letter(1);
    let entry = queue.chain().first_valid().unwrap();
    let (owner, _r1) = common::consumer(&ids, None);
    let (intruder, _r2) = common::consumer(&ids, None);
    queue.add_subscription(&owner, false).unwrap();
    queue.add_subscription(&intruder, false).unwrap();
    take(&owner, &entry);

    assert!(matches!(
        intruder.reject(&entry),
        Err(DeliveryError::NotOwner { .. })
    ));
    assert!(matches!(
        intruder.release(&entry),
        Err(DeliveryError::NotOwner { .. })
    ));
    assert!(entry.is_acquired_by(owner.id()));
    assert_eq!(entry.rejection_count(), 0);
}

#[test]
fn unbound_subscription_cannot_reject() {
    common::init_logging();
    let ids = SequentialIds::new();
    let queue = common::queue_with("unbound", QueueConfig::default(), 1);
    let entry = queue.chain().first_valid().unwrap();
    let (loose, _rx) = common::consumer(&ids, None);
    take(&loose, &entry);
    assert!(matches!(
        loose.reject(&entry),
        Err(DeliveryError::Unbound(_))
    ));
}
