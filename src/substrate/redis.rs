//! Redis substrate: lists for queues, PUB/SUB for the bus, strings and hashes for KV.

use std::collections::BTreeMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{DurableQueue, KeyValueStore, MessageBus, RawSubscription, SubstrateResult};

/// One client for pub/sub connections plus a shared multiplexed command connection.
pub struct RedisSubstrate {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisSubstrate {
    pub async fn connect(url: &str) -> SubstrateResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(url, "connected to redis");
        Ok(Self { client, conn })
    }
}

/// HSETNX, refreshing the expiry only on a real insert, plus the new HLEN.
const INSERT_FIELD_SCRIPT: &str = r#"
local added = redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2])
if added == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return {added, redis.call('HLEN', KEYS[1])}
"#;

/// Redis expiries are whole seconds; never round down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl DurableQueue for RedisSubstrate {
    async fn push(&self, queue: &str, payload: String) -> SubstrateResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(queue, payload).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> SubstrateResult<Option<String>> {
        let mut conn = self.conn.clone();
        let item: Option<String> = conn.lpop(queue, None).await?;
        Ok(item)
    }

    async fn len(&self, queue: &str) -> SubstrateResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }
}

#[async_trait]
impl MessageBus for RedisSubstrate {
    async fn publish(&self, topic: &str, payload: String) -> SubstrateResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> SubstrateResult<RawSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        let topic = topic.to_string();

        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let topic = topic.clone();
            async move {
                match payload {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "non-utf8 bus payload");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl KeyValueStore for RedisSubstrate {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> SubstrateResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> SubstrateResult<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> SubstrateResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> SubstrateResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> SubstrateResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> SubstrateResult<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = conn.incr(key, 1u64).await?;
        if value == 1 {
            let _: () = ::redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await?;
        }
        Ok(value)
    }

    async fn insert_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> SubstrateResult<Option<usize>> {
        let mut conn = self.conn.clone();
        let (inserted, len): (i64, usize) = ::redis::Script::new(INSERT_FIELD_SCRIPT)
            .key(key)
            .arg(field)
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok((inserted == 1).then_some(len))
    }

    async fn fields(&self, key: &str) -> SubstrateResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let map: BTreeMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }
}
