//! Message references handed to queues by the routing layer.
//!
//! A [`Message`] is immutable once built and shared between every queue it
//! was routed to through an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub timestamp: u64,
    /// Absolute expiry in milliseconds since epoch (0 = never expire).
    pub expire_at: u64,
    pub persistent: bool,
}

impl Message {
    /// Starts a builder for a message with a fresh id.
    pub fn builder(payload: impl Into<Bytes>) -> MessageBuilder {
        MessageBuilder {
            id: None,
            payload: payload.into(),
            headers: HashMap::new(),
            timestamp: None,
            ttl_ms: 0,
            persistent: false,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_at != 0 && now_ms >= self.expire_at
    }
}

#[derive(Debug)]
pub struct MessageBuilder {
    id: Option<u64>,
    payload: Bytes,
    headers: HashMap<String, String>,
    timestamp: Option<u64>,
    ttl_ms: u64,
    persistent: bool,
}

impl MessageBuilder {
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Time-to-live relative to the message timestamp; 0 disables expiry.
    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn build(self) -> Message {
        let timestamp = self.timestamp.unwrap_or_else(current_timestamp);
        let expire_at = if self.ttl_ms == 0 {
            0
        } else {
            timestamp.saturating_add(self.ttl_ms)
        };
        Message {
            id: self.id.unwrap_or_else(generate_id),
            payload: self.payload,
            headers: self.headers,
            timestamp,
            expire_at,
            persistent: self.persistent,
        }
    }
}

pub fn new_message(payload: impl Into<Bytes>) -> Message {
    Message::builder(payload).build()
}

pub fn new_message_with_ttl(payload: impl Into<Bytes>, ttl_ms: u64) -> Message {
    Message::builder(payload).ttl_ms(ttl_ms).build()
}

/// Milliseconds since the Unix epoch; 0 if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates a monotonically increasing u64 ID (fast, lock-free).
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
fn generate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
