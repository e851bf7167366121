#![allow(dead_code)]

use std::sync::{Arc, Once};

use blipmq_delivery::config::LoggingConfig;
use blipmq_delivery::core::message::new_message;
use blipmq_delivery::core::subscriber::{IdSource, MessageFilter, SequentialIds};
use blipmq_delivery::core::transport::{ChannelTransport, Delivery};
use blipmq_delivery::{Queue, QueueConfig, Subscription};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let config = LoggingConfig {
            level: "warn".to_string(),
            ..LoggingConfig::default()
        };
        let _ = blipmq_delivery::logging::try_init_logging(&config);
    });
}

/// Queue named `name` holding messages `E1..=En`.
pub fn queue_with(name: &str, config: QueueConfig, n: usize) -> Arc<Queue> {
    let queue = Queue::new(name, config);
    for i in 1..=n {
        queue
            .enqueue(Arc::new(new_message(format!("E{i}"))))
            .unwrap();
    }
    queue
}

pub fn consumer(
    ids: &SequentialIds,
    filter: Option<Arc<dyn MessageFilter>>,
) -> (Arc<Subscription>, UnboundedReceiver<Delivery>) {
    let (transport, rx) = ChannelTransport::new();
    let mut builder = Subscription::builder(ids.next_id(), transport);
    if let Some(filter) = filter {
        builder = builder.filter(filter);
    }
    (builder.build(), rx)
}

pub fn drain(rx: &mut UnboundedReceiver<Delivery>) -> Vec<Delivery> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
