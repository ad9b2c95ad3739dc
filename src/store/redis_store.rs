//! Redis-backed durable store
//!
//! Writes use `SET key value EX ttl`; listing walks `SCAN MATCH`; watching
//! relies on keyspace notifications (`set`, `del`, `expired`). A dropped
//! pub/sub connection ends the watch with [`StoreError::WatchInvalidated`]
//! so the caller restarts it and performs a full sync.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{DurableStore, StoreError, StoreEvent, StoreResult, WatchStream};

const SCAN_BATCH: usize = 500;

/// Redis store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g., redis://localhost:6379/0)
    pub url: String,
    pub pool_size: usize,
    /// Logical database the URL selects; keyspace channels are per database
    pub db: i64,
    /// Enable keyspace notifications on connect
    pub configure_notifications: bool,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 8,
            db: 0,
            configure_notifications: true,
        }
    }
}

/// Durable store on top of Redis
pub struct RedisDurableStore {
    pool: Pool,
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisDurableStore {
    /// Connect and verify the server answers
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| StoreError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Pool(format!("Failed to create Redis connection pool: {e}")))?;
        let client = redis::Client::open(config.url.as_str())?;

        let store = Self { pool, client, config };
        let mut conn = store.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        if store.config.configure_notifications {
            let configured: redis::RedisResult<()> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("K$gx")
                .query_async(&mut *conn)
                .await;
            if let Err(e) = configured {
                warn!(error = %e, "Could not enable keyspace notifications, relying on full sync");
            }
        }

        info!(url = %store.config.url, "Connected to Redis");
        Ok(store)
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    fn keyspace_channel(&self, key: &str) -> String {
        format!("__keyspace@{}__:{key}", self.config.db)
    }
}

/// Escape glob metacharacters for `MATCH`/`PSUBSCRIBE` patterns
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Translate one keyspace notification into a store event
async fn resolve(pool: Pool, channel_prefix: usize, msg: redis::Msg) -> Option<StoreResult<StoreEvent>> {
    let key = msg.get_channel_name().get(channel_prefix..)?.to_string();
    let op: String = msg.get_payload().ok()?;

    match op.as_str() {
        "set" => {
            let mut conn = match pool.get().await {
                Ok(conn) => conn,
                Err(e) => return Some(Err(StoreError::Pool(e.to_string()))),
            };
            let value: redis::RedisResult<Option<Vec<u8>>> = conn.get(&key).await;
            Some(match value {
                Ok(Some(value)) => Ok(StoreEvent::Put { key, value }),
                // Gone again before we read it
                Ok(None) => Ok(StoreEvent::Delete { key }),
                Err(e) => Err(StoreError::Redis(e)),
            })
        }
        "del" | "expired" | "evicted" => Some(Ok(StoreEvent::Delete { key })),
        _ => None,
    }
}

#[async_trait]
impl DurableStore for RedisDurableStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(chunk).query_async(&mut *conn).await?;
            entries.extend(
                chunk
                    .iter()
                    .zip(values)
                    .filter_map(|(key, value)| value.map(|v| (key.clone(), v))),
            );
        }
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let pattern = format!("{}*", escape_glob(&self.keyspace_channel(prefix)));
        pubsub.psubscribe(&pattern).await?;

        let pool = self.pool.clone();
        let channel_prefix = self.keyspace_channel("").len();

        let events = pubsub
            .into_on_message()
            .then(move |msg| resolve(pool.clone(), channel_prefix, msg))
            .filter_map(futures::future::ready);
        // The message stream only ends when the connection drops
        let invalidated = futures::stream::once(async { Err(StoreError::WatchInvalidated) });

        Ok(events.chain(invalidated).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("jobs/z/TCP-1%3A2"), "jobs/z/TCP-1%3A2");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert!(config.configure_notifications);
    }

    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_roundtrip_and_watch() {
        let store = RedisDurableStore::connect(RedisStoreConfig::default()).await.unwrap();
        let prefix = format!("healthmesh-test/{}/", uuid::Uuid::new_v4());
        let mut watch = store.watch(&prefix).await.unwrap();

        let key = format!("{prefix}a");
        store.put(&key, b"v".to_vec(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.list(&prefix).await.unwrap(), vec![(key.clone(), b"v".to_vec())]);

        let event = tokio::time::timeout(Duration::from_secs(2), watch.next()).await.unwrap();
        assert!(matches!(event, Some(Ok(StoreEvent::Put { .. }))));

        store.delete(&key).await.unwrap();
        assert!(store.list(&prefix).await.unwrap().is_empty());
    }
}
