//! Per-subscription flow control.
//!
//! Credit is a window: sending consumes it, settling (ack/release/reject)
//! gives it back, and the session layer may grant more explicitly.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Window {
    /// `None` = unlimited.
    messages: Option<u64>,
    bytes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct CreditManager {
    window: Mutex<Window>,
}

impl CreditManager {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn new(messages: Option<u64>, bytes: Option<u64>) -> Self {
        Self {
            window: Mutex::new(Window { messages, bytes }),
        }
    }

    pub fn has_credit(&self, size: u64) -> bool {
        let window = self.window.lock();
        window.messages.map_or(true, |m| m > 0) && window.bytes.map_or(true, |b| b >= size)
    }

    pub fn use_credit(&self, size: u64) {
        let mut window = self.window.lock();
        if let Some(m) = window.messages.as_mut() {
            *m = m.saturating_sub(1);
        }
        if let Some(b) = window.bytes.as_mut() {
            *b = b.saturating_sub(size);
        }
    }

    pub fn restore_credit(&self, size: u64) {
        self.add_credit(1, size);
    }

    /// Grants additional credit; unlimited dimensions stay unlimited.
    pub fn add_credit(&self, messages: u64, bytes: u64) {
        let mut window = self.window.lock();
        if let Some(m) = window.messages.as_mut() {
            *m = m.saturating_add(messages);
        }
        if let Some(b) = window.bytes.as_mut() {
            *b = b.saturating_add(bytes);
        }
    }

    pub fn message_credit(&self) -> Option<u64> {
        self.window.lock().messages
    }

    pub fn byte_credit(&self) -> Option<u64> {
        self.window.lock().bytes
    }
}
