//! Shared-state substrate: durable queue, publish/subscribe bus, expiring KV store.
//!
//! Components never share in-process memory. Everything they coordinate on
//! lives behind these three traits, injected as a [`Substrate`] bundle:
//! - [`DurableQueue`]: FIFO, at-least-once, survives consumer failure
//! - [`MessageBus`]: every live subscriber of a topic gets every message, no replay
//! - [`KeyValueStore`]: set-with-expiry, existence checks, per-key field maps
//!
//! Read-modify-write against shared state is always one atomic primitive
//! (`set_if_absent`, `insert_field_if_absent`), never a read followed by a write.

pub mod memory;
pub mod redis;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Errors from substrate operations.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Raw message stream for one topic subscription. Dropping it unsubscribes.
pub type RawSubscription = BoxStream<'static, String>;

/// Named FIFO queues of opaque payloads.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append to the tail.
    async fn push(&self, queue: &str, payload: String) -> SubstrateResult<()>;

    /// Remove from the head, if any.
    async fn pop(&self, queue: &str) -> SubstrateResult<Option<String>>;

    async fn len(&self, queue: &str) -> SubstrateResult<usize>;
}

/// Fire-and-forget broadcast topics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver to every current subscriber. Messages with no subscriber are lost.
    async fn publish(&self, topic: &str, payload: String) -> SubstrateResult<()>;

    async fn subscribe(&self, topic: &str) -> SubstrateResult<RawSubscription>;
}

/// Key-value store with expiry.
///
/// A key holds either a plain value or a field map; the two are never mixed
/// on the same key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` only if it does not exist. Returns true if this call set it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> SubstrateResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> SubstrateResult<()>;

    async fn get(&self, key: &str) -> SubstrateResult<Option<String>>;

    async fn exists(&self, key: &str) -> SubstrateResult<bool>;

    /// Returns true if something was deleted.
    async fn delete(&self, key: &str) -> SubstrateResult<bool>;

    /// Increment a counter, creating it with `ttl` on first use. Returns the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> SubstrateResult<u64>;

    /// Insert `field` into the map at `key` unless already present, refreshing
    /// the key's expiry on insert only. Returns the map's cardinality after the
    /// insert, or `None` if the field was already there.
    async fn insert_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> SubstrateResult<Option<usize>>;

    /// All `(field, value)` pairs of the map at `key`.
    async fn fields(&self, key: &str) -> SubstrateResult<Vec<(String, String)>>;
}

/// A message type bound to one bus topic.
pub trait Event: Serialize + DeserializeOwned + Send + 'static {
    const TOPIC: &'static str;
}

/// Typed view over a [`MessageBus`]: events are JSON on the wire.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<dyn MessageBus>,
}

impl EventBus {
    pub fn new(inner: Arc<dyn MessageBus>) -> Self {
        Self { inner }
    }

    pub async fn publish<E: Event>(&self, event: &E) -> SubstrateResult<()> {
        let payload = serde_json::to_string(event)?;
        self.inner.publish(E::TOPIC, payload).await
    }

    pub async fn subscribe<E: Event>(&self) -> SubstrateResult<Subscription<E>> {
        let inner = self.inner.subscribe(E::TOPIC).await?;
        Ok(Subscription {
            inner,
            _event: PhantomData,
        })
    }
}

/// Typed subscription. Undecodable messages are logged and skipped.
pub struct Subscription<E> {
    inner: RawSubscription,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> Subscription<E> {
    /// Next decodable event, or `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            let raw = self.inner.next().await?;
            match serde_json::from_str::<E>(&raw) {
                Ok(event) => return Some(event),
                Err(e) => warn!(topic = E::TOPIC, error = %e, "dropping malformed bus message"),
            }
        }
    }
}

/// Idempotency markers: a held marker turns a unit of work into a no-op.
#[derive(Clone)]
pub struct IdempotencyGuard {
    kv: Arc<dyn KeyValueStore>,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Atomically take the marker. False means someone already holds it.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> SubstrateResult<bool> {
        self.kv.set_if_absent(key, "1", ttl).await
    }

    /// Drop the marker so a later delivery can retry.
    pub async fn release(&self, key: &str) -> SubstrateResult<()> {
        self.kv.delete(key).await.map(|_| ())
    }

    pub async fn is_held(&self, key: &str) -> SubstrateResult<bool> {
        self.kv.exists(key).await
    }
}

/// The three shared-state handles every component is built from.
#[derive(Clone)]
pub struct Substrate {
    pub queue: Arc<dyn DurableQueue>,
    pub bus: EventBus,
    pub kv: Arc<dyn KeyValueStore>,
}

impl Substrate {
    /// Single-process substrate; every component must share this value.
    pub fn in_memory() -> Self {
        Self {
            queue: Arc::new(memory::MemoryQueue::new()),
            bus: EventBus::new(Arc::new(memory::MemoryBus::new())),
            kv: Arc::new(memory::MemoryStore::new()),
        }
    }

    /// Redis-backed substrate shared across processes.
    pub async fn connect_redis(url: &str) -> SubstrateResult<Self> {
        let backend = Arc::new(redis::RedisSubstrate::connect(url).await?);
        Ok(Self {
            queue: backend.clone(),
            bus: EventBus::new(backend.clone()),
            kv: backend,
        })
    }

    pub fn guard(&self) -> IdempotencyGuard {
        IdempotencyGuard::new(self.kv.clone())
    }
}
