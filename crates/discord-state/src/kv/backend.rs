//! Key-value client over Redis (RedisJSON) or an in-process store.

use std::time::Duration;

use deadpool_redis::Pool;

use super::memory::MemoryStore;
use super::pipeline::{KvOp, KvReply, Pipeline};
use crate::error::KvError;

/// Handle to the shared document store.
///
/// ## Backends
///
/// - **Redis**: shared across every process reading the same database. Requires the
///   RedisJSON module.
/// - **Memory**: single-process store with the same path and expiry semantics, used
///   when Redis is disabled and in tests.
///
/// Cloning is cheap; all clones share the same connections or map.
#[derive(Clone)]
pub enum KvClient {
    Memory(MemoryStore),
    Redis(Pool),
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KvClient").field(&self.mode()).finish()
    }
}

impl KvClient {
    /// Create a client over a fresh in-process store.
    pub fn memory() -> Self {
        KvClient::Memory(MemoryStore::new())
    }

    /// Create a Redis-backed client.
    pub fn redis(pool: Pool) -> Self {
        KvClient::Redis(pool)
    }

    pub fn mode(&self) -> &'static str {
        match self {
            KvClient::Memory(_) => "memory",
            KvClient::Redis(_) => "redis",
        }
    }

    pub fn is_redis(&self) -> bool {
        matches!(self, KvClient::Redis(_))
    }

    /// The in-process store, when this client is not backed by Redis.
    pub fn memory_store(&self) -> Option<&MemoryStore> {
        match self {
            KvClient::Memory(store) => Some(store),
            KvClient::Redis(_) => None,
        }
    }

    /// Check that the store is reachable (for health checks).
    pub async fn ping(&self) -> Result<(), KvError> {
        match self {
            KvClient::Memory(_) => Ok(()),
            KvClient::Redis(pool) => {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| KvError::Connection(e.to_string()))?;
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| KvError::Command(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Read the JSON value at `path`. `Ok(None)` means the key does not exist.
    pub async fn get_path(&self, key: &str, path: &str) -> Result<Option<String>, KvError> {
        let mut pipe = Pipeline::new();
        pipe.get_path(key, path);
        Ok(self.execute_one(pipe).await?.into_value())
    }

    /// Write a JSON value at `path`, applying `ttl` to the whole key in the same
    /// transaction when given.
    pub async fn set_path(
        &self,
        key: &str,
        path: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut pipe = Pipeline::new();
        pipe.set_path(key, path, value, ttl);
        match self.execute(pipe).await?.first() {
            Some(KvReply::Set(true)) => Ok(()),
            Some(KvReply::Set(false)) => Err(KvError::Command(format!(
                "JSON.SET {key} {path} did not write (path does not exist)"
            ))),
            other => Err(KvError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Delete the value at `path`. Returns how many paths were removed; deleting the
    /// root path removes the key.
    pub async fn delete_path(&self, key: &str, path: &str) -> Result<u64, KvError> {
        let mut pipe = Pipeline::new();
        pipe.delete_path(key, path);
        match self.execute_one(pipe).await? {
            KvReply::Deleted(n) => Ok(n),
            other => Err(KvError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut pipe = Pipeline::new();
        pipe.exists(key);
        Ok(self.execute_one(pipe).await?.exists())
    }

    /// Set the time to live of a key. Returns `false` when the key does not exist.
    pub async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut pipe = Pipeline::new();
        pipe.expire(key, ttl);
        match self.execute_one(pipe).await? {
            KvReply::Expire(applied) => Ok(applied),
            other => Err(KvError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Start an empty batch for [`execute`](Self::execute).
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Run a batch of operations as one round trip.
    ///
    /// On Redis, batches of more than one operation run inside MULTI/EXEC so readers
    /// never observe a document without its expiry. Replies come back in queue order.
    pub async fn execute(&self, pipeline: Pipeline) -> Result<Vec<KvReply>, KvError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            KvClient::Memory(store) => pipeline.ops.iter().map(|op| store.apply(op)).collect(),
            KvClient::Redis(pool) => {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| KvError::Connection(e.to_string()))?;

                let mut pipe = redis::pipe();
                if pipeline.len() > 1 {
                    pipe.atomic();
                }
                for op in &pipeline.ops {
                    queue_command(&mut pipe, op);
                }

                let values: Vec<redis::Value> = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| KvError::Command(e.to_string()))?;

                if values.len() != pipeline.len() {
                    return Err(KvError::UnexpectedReply(format!(
                        "expected {} replies, got {}",
                        pipeline.len(),
                        values.len()
                    )));
                }

                pipeline
                    .ops
                    .iter()
                    .zip(values.iter())
                    .map(|(op, value)| convert_reply(op, value))
                    .collect()
            }
        }
    }

    async fn execute_one(&self, pipeline: Pipeline) -> Result<KvReply, KvError> {
        self.execute(pipeline)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KvError::UnexpectedReply("empty reply".to_string()))
    }
}

fn queue_command(pipe: &mut redis::Pipeline, op: &KvOp) {
    match op {
        KvOp::GetPath { key, path } => {
            pipe.cmd("JSON.GET").arg(key).arg(path);
        }
        KvOp::SetPath { key, path, value } => {
            pipe.cmd("JSON.SET").arg(key).arg(path).arg(value);
        }
        KvOp::DeletePath { key, path } => {
            pipe.cmd("JSON.DEL").arg(key).arg(path);
        }
        KvOp::Exists { key } => {
            pipe.cmd("EXISTS").arg(key);
        }
        KvOp::Expire { key, ttl } => {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            pipe.cmd("PEXPIRE").arg(key).arg(millis);
        }
    }
}

fn convert_reply(op: &KvOp, value: &redis::Value) -> Result<KvReply, KvError> {
    let unexpected = |e: redis::RedisError| KvError::UnexpectedReply(e.to_string());
    match op {
        KvOp::GetPath { .. } => redis::from_redis_value::<Option<String>>(value)
            .map(KvReply::Value)
            .map_err(unexpected),
        KvOp::SetPath { .. } => redis::from_redis_value::<Option<String>>(value)
            .map(|reply| KvReply::Set(reply.is_some()))
            .map_err(unexpected),
        KvOp::DeletePath { .. } => redis::from_redis_value::<u64>(value)
            .map(KvReply::Deleted)
            .map_err(unexpected),
        KvOp::Exists { .. } => redis::from_redis_value::<i64>(value)
            .map(|n| KvReply::Exists(n > 0))
            .map_err(unexpected),
        KvOp::Expire { .. } => redis::from_redis_value::<i64>(value)
            .map(|n| KvReply::Expire(n == 1))
            .map_err(unexpected),
    }
}
