//! Transport collaborator consumed by [`Subscription::send`](crate::core::subscriber::Subscription::send).

use std::fmt::Debug;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::error::TransportError;
use crate::core::queue::entry::QueueEntry;
use crate::core::subscriber::SubscriptionId;

/// One hand-off of an acquired (or browsed) entry to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub entry: Arc<QueueEntry>,
}

pub trait Transport: Send + Sync + Debug {
    /// Hands a delivery to the consumer. With `batch`, the transport may hold
    /// it until [`flush`](Self::flush).
    fn deliver(&self, delivery: Delivery, batch: bool) -> Result<(), TransportError>;

    fn flush(&self) -> Result<(), TransportError>;
}

/// Delivers onto a tokio channel read by the session layer.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: UnboundedSender<Delivery>,
    batched: SegQueue<Delivery>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sender: tx,
            batched: SegQueue::new(),
        });
        (transport, rx)
    }

    pub fn pending(&self) -> usize {
        self.batched.len()
    }
}

impl Transport for ChannelTransport {
    fn deliver(&self, delivery: Delivery, batch: bool) -> Result<(), TransportError> {
        if batch {
            self.batched.push(delivery);
            return Ok(());
        }
        // Anything parked earlier must go out first to keep order.
        self.flush()?;
        self.sender
            .send(delivery)
            .map_err(|_| TransportError::Disconnected)
    }

    fn flush(&self) -> Result<(), TransportError> {
        while let Some(delivery) = self.batched.pop() {
            self.sender
                .send(delivery)
                .map_err(|_| TransportError::Disconnected)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::new_message;
    use std::sync::Weak;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            subscription: SubscriptionId::new(1).unwrap(),
            delivery_tag: tag,
            redelivered: false,
            entry: Arc::new(QueueEntry::new(tag, Arc::new(new_message("m")), 0, Weak::new())),
        }
    }

    #[test]
    fn batched_deliveries_wait_for_flush_in_order() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.deliver(delivery(1), true).unwrap();
        transport.deliver(delivery(2), true).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.pending(), 2);

        transport.deliver(delivery(3), false).unwrap();
        let tags: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| d.delivery_tag)
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn closed_receiver_reports_disconnect() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert!(matches!(
            transport.deliver(delivery(1), false),
            Err(TransportError::Disconnected)
        ));
    }
}
