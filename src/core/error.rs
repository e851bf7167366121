use thiserror::Error;

use crate::core::queue::entry::Owner;
use crate::core::subscriber::SubscriptionId;

/// Failure reported by a [`Transport`](crate::core::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("consumer channel is closed")]
    Disconnected,
    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Errors surfaced by the delivery core.
///
/// Contract violations (`NotOwner`, `EntryDeleted`) mean a
/// caller broke the ownership protocol upstream and must never be ignored.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("entry {position} is not owned by {caller} (current state: {actual})")]
    NotOwner {
        position: u64,
        caller: Owner,
        actual: String,
    },
    #[error("entry {position} has been deleted")]
    EntryDeleted { position: u64 },
    #[error("subscription {0} is closed")]
    SubscriptionClosed(SubscriptionId),
    #[error("subscription {0} is not bound to a queue")]
    Unbound(SubscriptionId),
    #[error("queue '{0}' is stopped")]
    QueueStopped(String),
    #[error("queue '{0}' has been deleted")]
    QueueDeleted(String),
    #[error("queue '{name}' is full (max depth {max_depth})")]
    QueueFull { name: String, max_depth: usize },
    #[error("queue '{0}' has an exclusive consumer")]
    ExclusiveConsumer(String),
    #[error("queue '{0}' already has consumers; exclusive access denied")]
    ExclusiveDenied(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;
