//! In-process substrate backed by tokio primitives.
//!
//! Semantics match the Redis backend: queues are FIFO, the bus is broadcast
//! without replay, keys expire lazily on access. Time is `tokio::time::Instant`
//! so tests can pause and advance the clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::warn;

use super::{DurableQueue, KeyValueStore, MessageBus, RawSubscription, SubstrateResult};

/// Per-topic buffer. A subscriber that falls this far behind loses messages.
const TOPIC_CAPACITY: usize = 1024;

/// Named FIFO queues.
#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn push(&self, queue: &str, payload: String) -> SubstrateResult<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().push_back(payload);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> SubstrateResult<Option<String>> {
        let mut queues = self.queues.lock().await;
        Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn len(&self, queue: &str) -> SubstrateResult<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }
}

/// Broadcast topics, created on first subscribe.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> SubstrateResult<()> {
        let topics = self.topics.lock().await;
        if let Some(tx) = topics.get(topic) {
            // No receivers is not an error: the bus has no replay.
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SubstrateResult<RawSubscription> {
        let rx = {
            let mut topics = self.topics.lock().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };
        let topic = topic.to_string();

        let stream = futures_util::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, (rx, topic))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Fields(Vec<(String, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Expiring key-value map.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drop `key` if it has expired, then return the live entry, if any.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live()) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> SubstrateResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(Value::Text(value.into()), ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> SubstrateResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry::new(Value::Text(value.into()), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> SubstrateResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(match live(&mut entries, key) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        })
    }

    async fn exists(&self, key: &str) -> SubstrateResult<bool> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key).is_some())
    }

    async fn delete(&self, key: &str) -> SubstrateResult<bool> {
        let mut entries = self.entries.lock().await;
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> SubstrateResult<u64> {
        let mut entries = self.entries.lock().await;
        live(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Text("0".into()), ttl));
        let current = match &entry.value {
            Value::Text(v) => v.parse::<u64>().unwrap_or(0),
            Value::Fields(_) => 0,
        };
        entry.value = Value::Text((current + 1).to_string());
        Ok(current + 1)
    }

    async fn insert_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> SubstrateResult<Option<usize>> {
        let mut entries = self.entries.lock().await;
        live(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Fields(Vec::new()), ttl));

        let len = match entry.value {
            Value::Fields(ref mut fields) => {
                if fields.iter().any(|(f, _)| f == field) {
                    return Ok(None);
                }
                fields.push((field.to_string(), value.to_string()));
                fields.len()
            }
            Value::Text(_) => {
                entry.value = Value::Fields(vec![(field.to_string(), value.to_string())]);
                1
            }
        };
        entry.expires_at = Instant::now() + ttl;
        Ok(Some(len))
    }

    async fn fields(&self, key: &str) -> SubstrateResult<Vec<(String, String)>> {
        let mut entries = self.entries.lock().await;
        Ok(match live(&mut entries, key) {
            Some(Entry {
                value: Value::Fields(fields),
                ..
            }) => fields.clone(),
            _ => Vec::new(),
        })
    }
}
