//! # Redis Connections
//!
//! Redis implementations of the collaborator seams. All of them share one
//! multiplexed [`ConnectionManager`], which reconnects on its own after a
//! dropped connection; node probes open a short-lived connection per read
//! so a cancelled poll releases it immediately.
//!
//! ## Key Layout:
//!
//! - Cache entries: the key as given, written with `SET .. EX`.
//! - Task queue: one list per task kind, `{prefix}:{task kind}`, fed with
//!   `LPUSH` of the task as JSON.
//! - Broker partition: a list read from the right with `LMOVE` into
//!   `{list}:inflight`; acknowledged entries are removed with `LREM`.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use tracing::info;

use crate::backpressure::memory::{redact_node, MemoryUsage, NodeProbe};
use crate::collaborators::{CacheBackend, CallResult, TaskQueue};
use crate::core::consumer::{Delivery, MessageSource};
use crate::model::DownstreamTask;

/// Opens a managed connection to `url`.
pub async fn connect(url: &str) -> RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    ConnectionManager::new(client).await
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// [`CacheBackend`] on Redis strings.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Wraps a managed connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl CacheBackend for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CallResult<Option<Bytes>>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value.map(Bytes::from))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CallResult<()>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value.as_ref())
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, CallResult<bool>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let written: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value.as_ref())
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(written.is_some())
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, CallResult<()>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(());
            }
            let mut del = redis::cmd("DEL");
            for key in keys {
                del.arg(key);
            }
            let _: i64 = del.query_async(&mut conn).await?;
            Ok(())
        })
    }
}

/// [`TaskQueue`] pushing JSON tasks onto one Redis list per task kind.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisTaskQueue {
    /// Creates the queue; lists are named `{prefix}:{task kind}`.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }
}

impl TaskQueue for RedisTaskQueue {
    fn enqueue(&self, task: DownstreamTask) -> BoxFuture<'_, CallResult<()>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let list = format!("{}:{}", self.prefix, task.kind.as_str());
            let body = serde_json::to_vec(&task)?;
            let _: i64 = redis::cmd("LPUSH").arg(&list).arg(body).query_async(&mut conn).await?;
            Ok(())
        })
    }
}

/// One broker partition stored as a Redis list.
///
/// Producers `LPUSH`; this source moves the oldest entry into the in-flight
/// list on fetch and removes it from there on ack, so a crashed worker's
/// message survives until [`RedisListSource::recover`] puts it back.
pub struct RedisListSource {
    conn: ConnectionManager,
    list: String,
    inflight: String,
}

impl RedisListSource {
    /// Creates the source for `list`.
    pub fn new(conn: ConnectionManager, list: impl Into<String>) -> Self {
        let list = list.into();
        let inflight = format!("{}:inflight", list);
        Self { conn, list, inflight }
    }

    /// Moves entries left in flight by a previous run back to the head of the
    /// partition, oldest first. Returns how many were moved.
    pub async fn recover(&self) -> CallResult<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let entry: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.inflight)
                .arg(&self.list)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(list = %self.list, moved, "recovered in-flight messages");
        }
        Ok(moved)
    }
}

impl MessageSource for RedisListSource {
    fn name(&self) -> &str {
        &self.list
    }

    fn fetch(&self) -> BoxFuture<'_, CallResult<Option<Delivery>>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let entry: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.list)
                .arg(&self.inflight)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            Ok(entry.map(|payload| Delivery {
                payload: Bytes::from(payload),
            }))
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, CallResult<()>> {
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: i64 = redis::cmd("LREM")
                .arg(&self.inflight)
                .arg(1)
                .arg(delivery.payload.as_ref())
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }
}

/// [`NodeProbe`] reading `INFO memory` from Redis nodes given as URLs.
#[derive(Debug, Default, Clone)]
pub struct RedisNodeProbe;

impl NodeProbe for RedisNodeProbe {
    fn memory<'a>(&'a self, node: &'a str) -> BoxFuture<'a, CallResult<MemoryUsage>> {
        Box::pin(async move {
            let client = Client::open(node)?;
            let mut conn = client.get_multiplexed_async_connection().await?;
            let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
            MemoryUsage::from_redis_info(redact_node(node), &info)
        })
    }
}
