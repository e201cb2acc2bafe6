//! Bookkeeping for in-flight streams and coordinated shutdown.
//!
//! Every SSE response and every WebSocket generation holds a [`StreamGuard`]
//! for as long as it is producing chunks. [`StreamRegistry::shutdown`] uses
//! the live count to let running streams finish before cancelling the rest.

use crate::server::telemetry::{
    decrement_streams_inflight, increment_streams_inflight, record_stream_duration,
};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Tracks running streams and owns the shutdown token they listen on.
#[derive(Debug)]
pub struct StreamRegistry {
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl StreamRegistry {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Registers a new stream, or returns `None` once shutdown has begun.
    pub fn begin(self: &Arc<Self>) -> Option<StreamGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Some(StreamGuard {
            registry: Arc::clone(self),
            started: Instant::now(),
        })
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolves when remaining streams must stop.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.shutdown_token.clone().cancelled_owned()
    }

    /// Gracefully stops streaming.
    ///
    /// - Refuses new streams.
    /// - Waits up to `shutdown_timeout` for running streams to finish.
    /// - Cancels whatever is still running.
    pub async fn shutdown(&self) {
        // === Phase 0: Stop accepting new streams ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new streams");
        self.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for in-flight streams to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight streams ({} active)", self.inflight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight streams drained successfully");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} streams still active)",
                    self.inflight()
                );
            }
        }

        // === Phase 2: Cancel the rest ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Cancelling remaining streams via shutdown token");
        self.shutdown_token.cancel();
    }
}

/// Marks one stream as running until dropped.
#[derive(Debug)]
pub struct StreamGuard {
    registry: Arc<StreamRegistry>,
    started: Instant,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
        record_stream_duration(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}
