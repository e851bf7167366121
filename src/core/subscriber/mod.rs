//! Subscriber side of delivery.
//!
//! A [`Subscription`] is one consumer's context on one queue: its identity,
//! interest filter, credit window and the send lock that serializes
//! acquire-then-send.

pub mod credit;
pub mod filter;
pub mod identity;
pub mod subscription;

pub use credit::CreditManager;
pub use filter::{HeaderFilter, MessageFilter, PositionFilter};
pub use identity::{IdSource, RandomIds, SequentialIds, SubscriptionId};
pub use subscription::{SendGuard, Subscription, SubscriptionBuilder, SubscriptionState};
