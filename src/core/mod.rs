pub mod error;
pub mod listener;
pub mod message;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod security;
pub mod subscriber;
pub mod transport;
