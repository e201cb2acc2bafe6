use crate::{
    error::{Error, Result},
    store::{Fields, StorageBackend},
};
use async_trait::async_trait;
use core::{future::Future, time::Duration};
use redis::{AsyncCommands, aio::ConnectionManager};

const BACKEND: &str = "redis";

/// Networked [`StorageBackend`] shared by every service instance.
///
/// Backed by a Redis [`ConnectionManager`], which multiplexes commands over a
/// single connection and re-establishes it transparently. Every command is
/// bounded by `op_timeout`; a timeout counts as a transport failure so the
/// limiter can fail over instead of stalling the request.
#[derive(Clone)]
pub struct RemoteStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl core::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Opens a managed connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the URL is malformed or the
    /// first connection cannot be established within `op_timeout`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::unavailable(BACKEND, e))?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::unavailable(BACKEND, "connect timed out"))?
            .map_err(|e| Error::unavailable(BACKEND, e))?;
        Ok(Self { conn, op_timeout })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::unavailable(BACKEND, e)),
            Err(_) => Err(Error::unavailable(BACKEND, "operation timed out")),
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get_all(&self, key: &str) -> Result<Fields> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let fields: redis::RedisResult<Fields> = conn.hgetall(key).await;
            fields
        })
        .await
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let done: redis::RedisResult<()> = conn.hset_multiple(key, &items[..]).await;
            done
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        if ttl.is_zero() {
            return self
                .bounded(async move {
                    let done: redis::RedisResult<()> = conn.del(key).await;
                    done
                })
                .await;
        }
        let secs = expire_secs(ttl);
        self.bounded(async move {
            let done: redis::RedisResult<()> = conn.expire(key, secs).await;
            done
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        let pipe = write_pipeline(key, fields, ttl);
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let done: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
            done
        })
        .await
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        self.bounded(async move { redis::cmd("PING").query_async::<String>(&mut conn).await })
            .await
            .is_ok_and(|pong| pong.eq_ignore_ascii_case("PONG"))
    }
}

/// EXPIRE takes whole seconds; round up so a key never expires early.
fn expire_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).unwrap_or(i64::MAX)
}

/// `HSET` + `EXPIRE` in a single `MULTI`/`EXEC` transaction. A zero TTL
/// deletes the key instead.
pub(crate) fn write_pipeline(key: &str, fields: &Fields, ttl: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    if ttl.is_zero() {
        pipe.del(key).ignore();
        return pipe;
    }
    if !fields.is_empty() {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pipe.hset_multiple(key, &items[..]).ignore();
    }
    pipe.expire(key, expire_secs(ttl)).ignore();
    pipe
}
