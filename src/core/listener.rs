//! Synchronous state-change observers for entries and subscriptions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Callback invoked synchronously on every actual state transition of `T`.
///
/// Listeners run on the thread performing the transition and must not
/// register or remove listeners on the same object from inside the callback.
pub trait StateChangeListener<T: ?Sized, S>: Send + Sync {
    fn state_changed(&self, object: &T, old: S, new: S);
}

impl<T: ?Sized, S, F> StateChangeListener<T, S> for F
where
    F: Fn(&T, S, S) + Send + Sync,
{
    fn state_changed(&self, object: &T, old: S, new: S) {
        self(object, old, new)
    }
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered list of listeners; invocation order is registration order.
pub struct ListenerSet<T: ?Sized, S> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn StateChangeListener<T, S>>)>>,
}

impl<T: ?Sized, S: Copy> ListenerSet<T, S> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn StateChangeListener<T, S>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Once this returns the listener is never called again.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // The read guard is held across callbacks so `remove` acts as a barrier.
    pub(crate) fn notify(&self, object: &T, old: S, new: S) {
        let listeners = self.listeners.read();
        for (_, listener) in listeners.iter() {
            listener.state_changed(object, old, new);
        }
    }
}

impl<T: ?Sized, S: Copy> Default for ListenerSet<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized, S> fmt::Debug for ListenerSet<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
