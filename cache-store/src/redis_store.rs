use crate::glob::glob_to_regex;
use crate::{CacheStore, SetEntry, StoreBackendError};
use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use derive_more::{Display, Error, From};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Debug, Display, Error, From)]
pub enum RedisStoreError {
    #[display(fmt = "redis connection pool error: {_0}")]
    Pool(bb8::RunError<redis::RedisError>),
    #[display(fmt = "redis command error: {_0}")]
    Command(redis::RedisError),
    #[display(fmt = "could not parse stored JSON: {_0}")]
    Decode(serde_json::Error),
}

/// `bb8::ErrorSink` that just logs; mirrors how the pool's background error
/// channel is wired up everywhere else a `bb8` pool is used in this tree.
#[derive(Debug, Clone)]
pub struct RedisErrorSink;

impl bb8::ErrorSink<redis::RedisError> for RedisErrorSink {
    fn sink(&self, err: redis::RedisError) {
        warn!(?err, "redis pool connection error");
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<redis::RedisError>> {
        Box::new(self.clone())
    }
}

/// Shared cache store backed by Redis, reachable from every proxy instance.
/// The only backend that gives the distributed lock real cross-process
/// meaning.
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, RedisStoreError> {
        let manager = RedisConnectionManager::new(url).map_err(RedisStoreError::Command)?;
        let pool = Pool::builder()
            .error_sink(Box::new(RedisErrorSink))
            .max_size(16)
            .build(manager)
            .await
            .map_err(RedisStoreError::Pool)?;

        // fail fast on a bad URL/unreachable server rather than surfacing the
        // first error on the first real request.
        {
            let mut conn = pool.get().await.map_err(RedisStoreError::Pool)?;
            let _: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(RedisStoreError::Command)?;
        }

        Ok(Self { pool })
    }

    async fn try_get(&self, key: &str) -> Result<Option<serde_json::Value>, RedisStoreError> {
        let mut conn = self.pool.get().await.map_err(RedisStoreError::Pool)?;
        let raw: Option<String> = conn.get(key).await.map_err(RedisStoreError::Command)?;
        match raw {
            None => Ok(None),
            Some(text) => Ok(Some(
                serde_json::from_str(&text).map_err(RedisStoreError::Decode)?,
            )),
        }
    }

    async fn try_set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.pool.get().await.map_err(RedisStoreError::Pool)?;
        let text = serde_json::to_string(value).map_err(RedisStoreError::Decode)?;
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .pset_ex(key, text, ttl.as_millis() as u64)
                    .await
                    .map_err(RedisStoreError::Command)?;
            }
            None => {
                let _: () = conn.set(key, text).await.map_err(RedisStoreError::Command)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        match self.try_get(key).await {
            Ok(hit) => {
                trace!(%key, hit = hit.is_some(), "redis store get");
                hit
            }
            Err(err) => {
                warn!(%key, %err, "redis get failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        if let Err(err) = self.try_set(key, &value, ttl).await {
            warn!(%key, %err, "redis set failed, ignoring");
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%key, %err, "redis pool exhausted during set_if_absent");
                return false;
            }
        };

        let result: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => {
                warn!(%key, %err, "redis set_if_absent failed");
                false
            }
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%key, %err, "redis pool exhausted during delete");
                return;
            }
        };
        if let Err(err) = conn.del::<_, ()>(key).await {
            warn!(%key, %err, "redis delete failed");
        }
    }

    async fn delete_matching(&self, pattern: &str) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%pattern, %err, "redis pool exhausted during delete_matching");
                return;
            }
        };

        // never KEYS: walk the keyspace with SCAN+MATCH and pipeline the
        // deletes in batches.
        let mut cursor: u64 = 0;
        let mut to_delete = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(256)
                .query_async(&mut *conn)
                .await
            {
                Ok(v) => v,
                Err(err) => {
                    warn!(%pattern, %err, "redis scan failed mid-walk");
                    break;
                }
            };
            to_delete.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        if !to_delete.is_empty() {
            let mut pipe = redis::pipe();
            for key in &to_delete {
                pipe.del(key).ignore();
            }
            if let Err(err) = pipe.query_async::<_, ()>(&mut *conn).await {
                warn!(%pattern, %err, "redis pipelined delete failed");
            }
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<serde_json::Value>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "redis pool exhausted during multi_get");
                return vec![None; keys.len()];
            }
        };

        let raw: Result<Vec<Option<String>>, redis::RedisError> = conn.mget(keys).await;
        match raw {
            Ok(values) => values
                .into_iter()
                .map(|v| v.and_then(|text| serde_json::from_str(&text).ok()))
                .collect(),
            Err(err) => {
                warn!(%err, "redis mget failed");
                vec![None; keys.len()]
            }
        }
    }

    async fn multi_set(&self, entries: Vec<SetEntry>) {
        // MSET has no per-key TTL, so fan the batch out as a pipeline of
        // individual SET/PSETEX commands instead.
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "redis pool exhausted during multi_set");
                return;
            }
        };

        let mut pipe = redis::pipe();
        for (key, value, ttl) in &entries {
            let text = match serde_json::to_string(value) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%key, %err, "skipping entry with unserialisable value");
                    continue;
                }
            };
            match ttl {
                Some(ttl) => {
                    pipe.cmd("PSETEX")
                        .arg(key)
                        .arg(ttl.as_millis() as u64)
                        .arg(text)
                        .ignore();
                }
                None => {
                    pipe.cmd("SET").arg(key).arg(text).ignore();
                }
            }
        }

        if let Err(err) = pipe.query_async::<_, ()>(&mut *conn).await {
            warn!(%err, "redis pipelined multi_set failed");
        }
    }

    async fn flush_all(&self) -> Result<(), StoreBackendError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(RedisStoreError::Pool)
            .map_err(StoreBackendError::Redis)?;
        redis::cmd("FLUSHDB")
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(RedisStoreError::Command)
            .map_err(StoreBackendError::Redis)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn stats(&self) -> serde_json::Value {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "redis pool exhausted during stats");
                return serde_json::json!({});
            }
        };
        match redis::cmd("DBSIZE").query_async::<_, i64>(&mut *conn).await {
            Ok(count) => serde_json::json!({ "dbSize": count }),
            Err(err) => {
                warn!(%err, "redis dbsize failed");
                serde_json::json!({})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::glob_to_regex;

    #[test]
    fn scan_pattern_is_compatible_with_store_glob() {
        // the pattern we hand to SCAN MATCH is the same dialect deleteMatching
        // uses for the memory store, so both backends agree on what matches.
        let re = glob_to_regex("lock:*");
        assert!(re.is_match("lock:eth_blockNumber:[]"));
    }
}
