//! Interest filters (selectors) evaluated against a queue entry's message.

use std::fmt::Debug;

use crate::core::queue::entry::QueueEntry;

pub trait MessageFilter: Send + Sync + Debug {
    fn matches(&self, entry: &QueueEntry) -> bool;
}

/// Matches messages whose header `key` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFilter {
    key: String,
    value: String,
}

impl HeaderFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl MessageFilter for HeaderFilter {
    fn matches(&self, entry: &QueueEntry) -> bool {
        entry
            .message()
            .is_some_and(|m| m.header(&self.key) == Some(self.value.as_str()))
    }
}

/// Matches an explicit set of queue positions.
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    positions: Vec<u64>,
}

impl PositionFilter {
    pub fn new(positions: impl IntoIterator<Item = u64>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
        }
    }
}

impl MessageFilter for PositionFilter {
    fn matches(&self, entry: &QueueEntry) -> bool {
        self.positions.contains(&entry.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use std::sync::{Arc, Weak};

    fn entry_with(header: Option<(&str, &str)>) -> QueueEntry {
        let mut builder = Message::builder("body");
        if let Some((k, v)) = header {
            builder = builder.header(k, v);
        }
        QueueEntry::new(1, Arc::new(builder.build()), 0, Weak::new())
    }

    #[test]
    fn header_filter_matches_exact_value() {
        let filter = HeaderFilter::new("region", "eu");
        assert!(filter.matches(&entry_with(Some(("region", "eu")))));
        assert!(!filter.matches(&entry_with(Some(("region", "us")))));
        assert!(!filter.matches(&entry_with(None)));
    }

    #[test]
    fn deleted_entry_matches_nothing() {
        let entry = entry_with(Some(("region", "eu")));
        entry.delete();
        assert!(!HeaderFilter::new("region", "eu").matches(&entry));
    }
}
