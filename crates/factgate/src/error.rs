//! Error types for admission control and chunk streaming.
//!
//! ## Error Cases
//! - `StoreUnavailable`: a transport-level failure talking to a store. The
//!   limiter converts it into a fail-over transition; request handlers never
//!   see it.
//! - `Connect`: the [`StoreFactory`] exhausted its connection attempts.
//! - `QuotaExceeded`: one or more quota dimensions denied a request.
//! - `StreamProducer`: the text producer behind a stream failed.
//! - `InvalidQuota`: a quota was constructed with an unusable refill rate.
//! - `InvalidConfig`: limiter settings that would silently disable limiting.
//!
//! A resume cursor past the end of a stream is deliberately *not* an error:
//! it yields an empty continuation so that resuming stays idempotent.
//!
//! [`StoreFactory`]: crate::StoreFactory

use crate::{limiter::Rejection, stream::PipelineError};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the admission-control and streaming core.
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A store operation failed at the transport level.
    #[error("store `{backend}` unavailable: {reason}")]
    StoreUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// The backend constructor kept failing until retries ran out.
    #[error("unable to connect `{store}` store after {attempts} attempts: {reason}")]
    Connect {
        store: String,
        attempts: usize,
        reason: String,
    },

    /// At least one enabled quota denied the request.
    #[error("rate limit exceeded, retry after {}s", .0.retry_after)]
    QuotaExceeded(Rejection),

    /// The producer of a stream failed mid-flight.
    #[error(transparent)]
    StreamProducer(#[from] PipelineError),

    /// A quota was configured with a refill rate that is not strictly positive.
    #[error("invalid quota: {reason}")]
    InvalidQuota { reason: String },

    /// Limiter settings that cannot enforce any quota.
    #[error("invalid limiter config: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    pub(crate) fn unavailable(backend: &'static str, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}
