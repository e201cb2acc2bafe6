//! Lazily connected, retrying owner of a [`StorageBackend`].
//!
//! [`StoreFactory`] wraps a backend constructor. The first [`get`] connects,
//! retrying up to `max_attempts` times with a fixed delay in between, and
//! only reports [`Error::Connect`] once every attempt has failed. Each
//! attempt, failure, retry and backend switch is counted in [`StoreStats`]
//! so operators can see which backend is serving traffic.
//!
//! [`get`]: StoreFactory::get

use crate::{
    error::{Error, Result},
    store::StorageBackend,
};
use core::{future::Future, time::Duration};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Builder =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn StorageBackend>>> + Send + Sync>;

/// Connection counters for one [`StoreFactory`].
#[derive(Debug, Default)]
pub struct StoreStats {
    attempts: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    switches: AtomicU64,
}

impl StoreStats {
    /// Backend construction attempts, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Backend construction attempts that failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Failed attempts that were followed by another attempt.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Times the active backend kind changed between connections.
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Slot {
    store: Option<Arc<dyn StorageBackend>>,
    last_backend: Option<&'static str>,
}

/// Builds and owns the active backend for a named logical store.
pub struct StoreFactory {
    name: String,
    builder: RwLock<Builder>,
    max_attempts: usize,
    retry_delay: Duration,
    slot: tokio::sync::Mutex<Slot>,
    active: Mutex<Option<&'static str>>,
    stats: Arc<StoreStats>,
}

impl core::fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreFactory")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("active", &*self.active.lock())
            .finish_non_exhaustive()
    }
}

impl StoreFactory {
    /// Creates an unconnected factory.
    ///
    /// `max_attempts` is clamped to at least one.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        builder: F,
        max_attempts: usize,
        retry_delay: Duration,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn StorageBackend>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            builder: RwLock::new(box_builder(builder)),
            max_attempts: max_attempts.max(1),
            retry_delay,
            slot: tokio::sync::Mutex::new(Slot::default()),
            active: Mutex::new(None),
            stats: Arc::new(StoreStats::default()),
        }
    }

    /// Logical name of the store, used as a metric label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label of the backend currently connected, if any.
    pub fn active_backend(&self) -> Option<&'static str> {
        *self.active.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.active_backend().is_some()
    }

    pub fn stats(&self) -> Arc<StoreStats> {
        Arc::clone(&self.stats)
    }

    /// Replaces the constructor used by future connects.
    pub fn configure<F, Fut>(&self, builder: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn StorageBackend>>> + Send + 'static,
    {
        *self.builder.write() = box_builder(builder);
    }

    /// Returns the active backend, connecting on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] when every attempt fails.
    pub async fn get(&self) -> Result<Arc<dyn StorageBackend>> {
        let mut slot = self.slot.lock().await;
        if let Some(store) = &slot.store {
            return Ok(Arc::clone(store));
        }
        self.connect_locked(&mut slot).await
    }

    /// Connects if not already connected. With `force`, any existing backend
    /// is closed and rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] when every attempt fails.
    pub async fn connect(&self, force: bool) -> Result<Arc<dyn StorageBackend>> {
        let mut slot = self.slot.lock().await;
        if let Some(store) = &slot.store {
            if !force {
                return Ok(Arc::clone(store));
            }
            self.close_locked(&mut slot).await;
        }
        self.connect_locked(&mut slot).await
    }

    /// Closes any existing backend and builds a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] when every attempt fails.
    pub async fn reconnect(&self) -> Result<Arc<dyn StorageBackend>> {
        self.connect(true).await
    }

    /// Closes the active backend. Safe to call repeatedly or before any
    /// connect.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        self.close_locked(&mut slot).await;
    }

    async fn close_locked(&self, slot: &mut Slot) {
        let Some(store) = slot.store.take() else {
            return;
        };
        *self.active.lock() = None;
        store.close().await;
        #[cfg(feature = "tracing")]
        tracing::debug!(store = %self.name, backend = store.name(), "closed store backend");
    }

    async fn connect_locked(&self, slot: &mut Slot) -> Result<Arc<dyn StorageBackend>> {
        let builder = Arc::clone(&*self.builder.read());
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            match builder().await {
                Ok(store) => {
                    let backend = store.name();
                    if slot.last_backend.is_some_and(|previous| previous != backend) {
                        self.stats.switches.fetch_add(1, Ordering::Relaxed);
                        #[cfg(feature = "tracing")]
                        tracing::info!(
                            store = %self.name,
                            from = slot.last_backend.unwrap_or_default(),
                            to = backend,
                            "store backend switched"
                        );
                    }
                    slot.last_backend = Some(backend);
                    slot.store = Some(Arc::clone(&store));
                    *self.active.lock() = Some(backend);
                    return Ok(store);
                }
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.max_attempts {
                        #[cfg(feature = "tracing")]
                        tracing::error!(
                            store = %self.name,
                            attempts = attempt,
                            "unable to initialize store backend: {e}"
                        );
                        return Err(Error::Connect {
                            store: self.name.clone(),
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        store = %self.name,
                        "failed to initialize store backend (attempt {attempt}/{}): {e}",
                        self.max_attempts
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }
}

fn box_builder<F, Fut>(builder: F) -> Builder
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn StorageBackend>>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn StorageBackend>>> {
        Box::pin(builder())
    })
}
