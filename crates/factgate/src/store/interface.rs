use crate::error::Result;
use async_trait::async_trait;
use core::{fmt, time::Duration};
use std::collections::HashMap;

/// The field map stored under a single key.
pub type Fields = HashMap<String, String>;

/// A uniform hash-map-like store shared by the limiter's backends.
///
/// Every implementation obeys the same semantics so callers never need to
/// know which backend is serving them:
///
/// - [`get_all`] of a missing or expired key is an empty map.
/// - [`set`] merges `fields` into the key atomically; readers never observe
///   a partial update.
/// - [`expire`] with a zero TTL deletes the key.
/// - [`ping`] answers within a bounded time and never fails: every transport
///   problem is reported as `false`.
///
/// [`get_all`]: StorageBackend::get_all
/// [`set`]: StorageBackend::set
/// [`expire`]: StorageBackend::expire
/// [`ping`]: StorageBackend::ping
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Short label identifying the backend kind, used in metrics and logs.
    fn name(&self) -> &'static str;

    /// Reads every field stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on transport failure.
    ///
    /// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
    async fn get_all(&self, key: &str) -> Result<Fields>;

    /// Writes `fields` under `key`, keeping fields not mentioned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on transport failure.
    ///
    /// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
    async fn set(&self, key: &str, fields: &Fields) -> Result<()>;

    /// Sets the time-to-live of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on transport failure.
    ///
    /// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Writes `fields` under `key` and sets its time-to-live in one step.
    ///
    /// Backends that can apply both together should, so a failure between
    /// the two never leaves a key without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on transport failure.
    ///
    /// [`Error::StoreUnavailable`]: crate::Error::StoreUnavailable
    async fn set_with_ttl(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        self.set(key, fields).await?;
        self.expire(key, ttl).await
    }

    /// Reports whether the backend is reachable.
    async fn ping(&self) -> bool;

    /// Releases any resources held by the backend. Must be idempotent.
    async fn close(&self) {}
}
