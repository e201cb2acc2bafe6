use core::fmt;

/// A source of timestamps for bucket refill and key expiry.
///
/// Readings are seconds as `f64`. Implementations must never go backward;
/// the limiter still clamps negative elapsed time to zero.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current reading in seconds.
    fn now(&self) -> f64;
}
