mod bucket;
mod failover;
mod limiter;
mod quota;
mod stats;

pub use bucket::*;
pub use failover::*;
pub use limiter::*;
pub use quota::*;
pub use stats::*;

#[cfg(test)]
mod tests;
