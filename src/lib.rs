//! BlipMQ delivery core – queue-entry ownership and competing-consumer
//! delivery for an AMQP-style broker.
//!
//! This crate exports
//!  * `core`    – entries, entry chains, queues, subscriptions, registry
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! Session and connection layers drive the core through [`Queue`] and
//! [`Subscription`]; the `blipmq-delivery` binary runs a standalone set of
//! queues with their dispatchers.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use crate::core::error::{DeliveryError, TransportError};
pub use crate::core::message::Message;
pub use crate::core::queue::{Queue, QueueConfig, QueueEntry};
pub use crate::core::registry::QueueRegistry;
pub use crate::core::subscriber::{Subscription, SubscriptionId};
