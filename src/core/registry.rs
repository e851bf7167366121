use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::queue::{Queue, QueueConfig};
use crate::core::routing::ServerTransaction;

/// [`QueueRegistry`] is a thread-safe name → queue map for a virtual host.
///
/// Uses DashMap internally so lookups from many connections never contend
/// on a single lock.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: DashMap<String, Arc<Queue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Registers `queue` under its name, replacing and returning any queue
    /// previously registered under that name.
    pub fn register(&self, queue: Arc<Queue>) -> Option<Arc<Queue>> {
        let name = queue.name().to_string();
        let replaced = self.queues.insert(name.clone(), queue);
        if replaced.is_some() {
            debug!(target: "blipmq::registry", queue = %name, "queue replaced");
        } else {
            debug!(target: "blipmq::registry", queue = %name, "queue registered");
        }
        replaced
    }

    /// Returns the queue named `name`, creating and registering it with
    /// `config` if absent. The flag is `true` when the queue was created.
    pub fn declare(&self, name: &str, config: QueueConfig) -> (Arc<Queue>, bool) {
        let mut created = false;
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                created = true;
                Queue::new(name, config)
            })
            .clone();
        if created {
            info!(target: "blipmq::registry", queue = %name, id = %queue.id(), "queue declared");
        }
        (queue, created)
    }

    /// Removes and returns the queue named `name`. No-op if absent.
    pub fn unregister(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.remove(name).map(|(_, queue)| queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    /// Linear scan; ids are only used by management paths.
    pub fn get_by_id(&self, id: &Uuid) -> Option<Arc<Queue>> {
        self.queues
            .iter()
            .find(|entry| entry.value().id() == *id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Unregisters then deletes the queue; returns its alternate-routed count.
    pub fn delete(&self, name: &str, txn: &dyn ServerTransaction) -> Option<usize> {
        let queue = self.unregister(name)?;
        Some(queue.delete(txn))
    }

    /// Stops every queue's dispatching and empties the registry.
    pub fn close(&self) {
        let queues = self.queues();
        for queue in &queues {
            queue.stop();
        }
        self.queues.clear();
        info!(target: "blipmq::registry", stopped = queues.len(), "queue registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::new_message;
    use crate::core::routing::AutoCommit;

    #[test]
    fn register_replaces_same_name() {
        let registry = QueueRegistry::new();
        let first = Queue::new("orders", QueueConfig::default());
        let second = Queue::new("orders", QueueConfig::default());
        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.get("orders").unwrap(), &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_then_get_is_absent() {
        let registry = QueueRegistry::new();
        registry.register(Queue::new("orders", QueueConfig::default()));
        assert!(registry.unregister("orders").is_some());
        assert!(registry.unregister("orders").is_none());
        assert!(registry.get("orders").is_none());
    }

    #[test]
    fn declare_returns_existing() {
        let registry = QueueRegistry::new();
        let (a, created) = registry.declare("q", QueueConfig::default());
        assert!(created);
        let (b, created) = registry.declare("q", QueueConfig::default());
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lookup_by_id() {
        let registry = QueueRegistry::new();
        let (queue, _) = registry.declare("q", QueueConfig::default());
        registry.declare("other", QueueConfig::default());
        let found = registry.get_by_id(&queue.id()).unwrap();
        assert_eq!(found.name(), "q");
        assert!(registry.get_by_id(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn close_stops_everything_and_tolerates_stopped_queues() {
        let registry = QueueRegistry::new();
        let (a, _) = registry.declare("a", QueueConfig::default());
        let (b, _) = registry.declare("b", QueueConfig::default());
        b.stop();
        registry.close();
        assert!(registry.is_empty());
        assert!(a.is_stopped() && b.is_stopped());
        registry.close();
    }

    #[test]
    fn delete_unregisters_and_drains() {
        let registry = QueueRegistry::new();
        let (queue, _) = registry.declare("q", QueueConfig::default());
        queue.enqueue(Arc::new(new_message("m"))).unwrap();
        assert_eq!(registry.delete("q", &AutoCommit), Some(0));
        assert!(registry.get("q").is_none());
        assert!(queue.is_deleted());
        assert_eq!(queue.message_count(), 0);
        assert_eq!(registry.delete("q", &AutoCommit), None);
    }
}
