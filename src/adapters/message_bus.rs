//! Message Bus Adapters
//!
//! Implements the `MessageBus` port with various backends.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::ports::{BusMessage, MessageBus};
use crate::error::{Error, Result};

/// Partition a key onto `partitions` slots.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Logging-based message bus.
///
/// Publishes message summaries to the tracing/logging system.
/// Useful for development and dry runs.
#[derive(Debug, Clone, Default)]
pub struct LoggingMessageBus {
    /// Whether to log messages at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingMessageBus {
    /// Create a new logging bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a bus that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl MessageBus for LoggingMessageBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        if self.info_level {
            info!(topic = %topic, key = %key, bytes = payload.len(), "Bus message");
        } else {
            debug!(topic = %topic, key = %key, bytes = payload.len(), "Bus message");
        }
        Ok(())
    }
}

/// Partitioned in-process bus.
///
/// Each partition is an unbounded channel; a key always hashes to the same
/// partition so per-key order is preserved for a single consumer per
/// partition.
pub struct PartitionedBus {
    senders: Vec<mpsc::UnboundedSender<BusMessage>>,
    receivers: parking_lot::Mutex<Vec<Option<mpsc::UnboundedReceiver<BusMessage>>>>,
    published: AtomicU64,
}

impl PartitionedBus {
    /// Create a bus with `partitions` partitions.
    pub fn new(partitions: usize) -> Self {
        let (senders, receivers) = (0..partitions.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders,
            receivers: parking_lot::Mutex::new(receivers),
            published: AtomicU64::new(0),
        }
    }

    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Take the consumer side of a partition. Each can be taken once.
    pub fn take_receiver(&self, partition: usize) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.receivers.lock().get_mut(partition).and_then(Option::take)
    }

    /// Messages published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for PartitionedBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let partition = partition_for(key, self.senders.len());
        let message = BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            partition,
            payload,
        };
        self.senders[partition]
            .send(message)
            .map_err(|_| Error::Bus(format!("partition {} has no consumer", partition)))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory message collector for testing.
///
/// Collects messages in memory for later inspection during tests.
#[derive(Debug, Default)]
pub struct InMemoryMessageCollector {
    messages: parking_lot::RwLock<Vec<BusMessage>>,
}

impl InMemoryMessageCollector {
    /// Create a new collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected messages.
    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.read().clone()
    }

    /// Get the count of collected messages.
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// Check if there are no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Clear all collected messages.
    pub fn clear(&self) {
        self.messages.write().clear();
    }

    /// Messages published with a given key.
    pub fn messages_for_key(&self, key: &str) -> Vec<BusMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.key == key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageCollector {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        self.messages.write().push(BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            partition: 0,
            payload,
        });
        Ok(())
    }
}

/// Composite bus that publishes to multiple backends.
#[derive(Default)]
pub struct CompositeMessageBus {
    buses: Vec<Box<dyn MessageBus>>,
}

impl CompositeMessageBus {
    /// Create a new composite bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bus to the composite.
    pub fn with_bus<B: MessageBus + 'static>(mut self, bus: B) -> Self {
        self.buses.push(Box::new(bus));
        self
    }
}

impl std::fmt::Debug for CompositeMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeMessageBus")
            .field("bus_count", &self.buses.len())
            .finish()
    }
}

#[async_trait]
impl MessageBus for CompositeMessageBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        for bus in &self.buses {
            bus.publish(topic, key, payload.clone()).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for bus in &self.buses {
            bus.flush().await?;
        }
        Ok(())
    }
}
