//! Stream transports and their bookkeeping.
//!
//! ## Structure
//!
//! - [`sse`] - `POST` endpoints answering with Server-Sent Events.
//! - [`ws`] - WebSocket sessions carrying one stream per inbound message.
//! - [`session`] - per-connection limits for WebSocket sessions.
//! - [`registry`] - in-flight stream accounting and graceful shutdown.

pub mod registry;
pub mod session;
pub mod sse;
pub mod ws;

#[cfg(test)]
mod tests;

use crate::server::config::StreamConfig;
use core::time::Duration;
use serde::Deserialize;

/// Query parameters accepted by the SSE endpoints.
///
/// Integers are read signed so out-of-range values are clamped like the
/// WebSocket fields instead of failing the request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamParams {
    pub chunk_size: Option<i64>,
    /// Inter-chunk delay in seconds.
    pub token_delay: Option<f64>,
    pub cursor: Option<i64>,
}

impl StreamParams {
    pub fn chunk_size(&self, config: &StreamConfig) -> usize {
        let requested = self
            .chunk_size
            .map(|size| usize::try_from(size.max(1)).unwrap_or(usize::MAX));
        clamp_chunk_size(requested, config)
    }

    pub fn delay(&self, config: &StreamConfig) -> Duration {
        delay_or_default(self.token_delay, config)
    }

    /// Explicit resume cursor; negative values start from the beginning.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
            .map(|cursor| usize::try_from(cursor.max(0)).unwrap_or(usize::MAX))
    }
}

/// Requested chunk size bounded to `1..=max_chunk_size`.
pub fn clamp_chunk_size(requested: Option<usize>, config: &StreamConfig) -> usize {
    requested
        .unwrap_or(config.chunk_size)
        .clamp(1, config.max_chunk_size.max(1))
}

/// Requested delay in seconds; negative values mean no delay and unusable
/// ones fall back to the configured default.
pub fn delay_or_default(requested: Option<f64>, config: &StreamConfig) -> Duration {
    requested
        .filter(|secs| secs.is_finite())
        .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
        .unwrap_or(config.token_delay)
}
