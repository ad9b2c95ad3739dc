//! Redis-backed coordination tree
//!
//! Lets several masters and the registering services share one tree. Each
//! node is a string key holding its data plus a set key naming its
//! children; `/` always exists. Watches ride on one pub/sub channel per
//! node: writers publish `children` on the parent's channel when a child
//! appears, disappears or changes data, and `deleted` on the channel of
//! every removed node. A watch resolves on the first message it sees and
//! reports [`WatchEvent::Disconnected`] when its connection drops.
//!
//! Writes are not transactional. A reader may briefly list a child whose
//! node key is already gone; the tree watcher treats that as a delete.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use futures::{FutureExt, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    base_name, join_path, parent_path, validate_path, CoordError, CoordResult, CoordinationStore, Watch,
    WatchEvent,
};

const CHILDREN_CHANGED: &str = "children";
const NODE_DELETED: &str = "deleted";

/// Redis coordination tree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCoordinationConfig {
    /// Redis URL (e.g., redis://localhost:6379/0)
    pub url: String,
    pub pool_size: usize,
    /// Prefix of every key and channel the tree owns
    pub key_prefix: String,
}

impl Default for RedisCoordinationConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 8,
            key_prefix: "healthmesh:tree:".to_string(),
        }
    }
}

fn redis_error(e: redis::RedisError) -> CoordError {
    CoordError::Connection(e.to_string())
}

/// Coordination store kept in Redis
pub struct RedisCoordinationStore {
    pool: Pool,
    client: redis::Client,
    config: RedisCoordinationConfig,
}

impl RedisCoordinationStore {
    /// Connect and verify the server answers
    pub async fn connect(config: RedisCoordinationConfig) -> CoordResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CoordError::Connection(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CoordError::Connection(format!("Failed to create Redis connection pool: {e}")))?;
        let client = redis::Client::open(config.url.as_str()).map_err(redis_error)?;

        let store = Self { pool, client, config };
        let mut conn = store.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await.map_err(redis_error)?;

        info!(url = %store.config.url, prefix = %store.config.key_prefix, "Connected to Redis coordination tree");
        Ok(store)
    }

    async fn conn(&self) -> CoordResult<Connection> {
        self.pool.get().await.map_err(|e| CoordError::Connection(e.to_string()))
    }

    fn node_key(&self, path: &str) -> String {
        format!("{}node:{path}", self.config.key_prefix)
    }

    fn children_key(&self, path: &str) -> String {
        format!("{}children:{path}", self.config.key_prefix)
    }

    fn channel(&self, path: &str) -> String {
        format!("{}watch:{path}", self.config.key_prefix)
    }

    async fn exists(&self, conn: &mut Connection, path: &str) -> CoordResult<bool> {
        if path == "/" {
            return Ok(true);
        }
        let found: bool = conn.exists(self.node_key(path)).await.map_err(redis_error)?;
        Ok(found)
    }

    async fn notify(&self, conn: &mut Connection, path: &str, event: &str) -> CoordResult<()> {
        let _: i64 = conn.publish(self.channel(path), event).await.map_err(redis_error)?;
        Ok(())
    }

    /// Every node at or below `path`, parents first
    async fn subtree(&self, conn: &mut Connection, path: &str) -> CoordResult<Vec<String>> {
        let mut nodes = vec![path.to_string()];
        let mut next = 0;
        while next < nodes.len() {
            let parent = nodes[next].clone();
            let children: Vec<String> = conn.smembers(self.children_key(&parent)).await.map_err(redis_error)?;
            nodes.extend(children.iter().map(|child| join_path(&parent, child)));
            next += 1;
        }
        Ok(nodes)
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn children_watch(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        validate_path(path)?;

        // Subscribe before listing so no change slips between the two
        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_error)?;
        pubsub.subscribe(self.channel(path)).await.map_err(redis_error)?;

        let mut conn = self.conn().await?;
        if !self.exists(&mut conn, path).await? {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let mut children: Vec<String> = conn.smembers(self.children_key(path)).await.map_err(redis_error)?;
        children.sort();

        let watched = path.to_string();
        let watch = async move {
            let mut messages = std::pin::pin!(pubsub.into_on_message());
            let event = match messages.next().await {
                Some(msg) => match msg.get_payload::<String>() {
                    Ok(payload) if payload == NODE_DELETED => WatchEvent::NodeDeleted,
                    _ => WatchEvent::ChildrenChanged,
                },
                None => WatchEvent::Disconnected,
            };
            debug!(path = %watched, event = ?event, "Redis watch fired");
            event
        }
        .boxed();

        Ok((children, watch))
    }

    async fn get(&self, path: &str) -> CoordResult<Vec<u8>> {
        validate_path(path)?;
        if path == "/" {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let data: Option<Vec<u8>> = conn.get(self.node_key(path)).await.map_err(redis_error)?;
        data.ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> CoordResult<()> {
        validate_path(path)?;
        let Some(parent) = parent_path(path) else {
            return Err(CoordError::InvalidPath(path.to_string()));
        };
        let mut conn = self.conn().await?;

        // Missing ancestors, top down; node keys go in before child links
        let mut ancestors = Vec::new();
        let mut cursor = Some(parent);
        while let Some(p) = cursor.filter(|p| *p != "/") {
            ancestors.push(p);
            cursor = parent_path(p);
        }
        for ancestor in ancestors.into_iter().rev() {
            let _: bool = conn
                .set_nx(self.node_key(ancestor), Vec::<u8>::new())
                .await
                .map_err(redis_error)?;
            if let Some(above) = parent_path(ancestor) {
                let added: i64 = conn
                    .sadd(self.children_key(above), base_name(ancestor))
                    .await
                    .map_err(redis_error)?;
                if added > 0 {
                    self.notify(&mut conn, above, CHILDREN_CHANGED).await?;
                }
            }
        }

        let old: Option<Vec<u8>> = conn.get(self.node_key(path)).await.map_err(redis_error)?;
        let _: () = conn.set(self.node_key(path), data.as_slice()).await.map_err(redis_error)?;
        let added: i64 = conn
            .sadd(self.children_key(parent), base_name(path))
            .await
            .map_err(redis_error)?;

        if added > 0 || old.as_deref() != Some(data.as_slice()) {
            self.notify(&mut conn, parent, CHILDREN_CHANGED).await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        validate_path(path)?;
        let mut conn = self.conn().await?;
        let Some(parent) = parent_path(path) else {
            return Err(CoordError::NoNode(path.to_string()));
        };
        if !self.exists(&mut conn, path).await? {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let doomed = self.subtree(&mut conn, path).await?;
        let keys: Vec<String> = doomed
            .iter()
            .flat_map(|node| [self.node_key(node), self.children_key(node)])
            .collect();
        let _: () = conn.del(keys.as_slice()).await.map_err(redis_error)?;
        let _: i64 = conn
            .srem(self.children_key(parent), base_name(path))
            .await
            .map_err(redis_error)?;

        for node in &doomed {
            self.notify(&mut conn, node, NODE_DELETED).await?;
        }
        self.notify(&mut conn, parent, CHILDREN_CHANGED).await?;
        debug!(path = %path, nodes = doomed.len(), "Coordination sub-tree deleted");
        Ok(())
    }
}
