//! Fixtures shared by the server's unit tests.

use crate::server::{
    config::{ServerConfig, SessionConfig, StreamConfig},
    service::handler::AppState,
};
use core::time::Duration;
use factgate::{LimiterConfig, LocalPipeline, ManualClock, RateQuota, TokenBucketLimiter};
use std::sync::Arc;

/// Two requests per API key with a slow refill; every other quota is off.
pub fn config() -> ServerConfig {
    ServerConfig {
        server_addr: "127.0.0.1:0".to_owned(),
        store: None,
        limiter: LimiterConfig {
            api: RateQuota::new(2, 1.0).unwrap(),
            ip: RateQuota::disabled(),
            org: RateQuota::disabled(),
            ttl: Duration::from_secs(300),
            fallback_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
        },
        stream: StreamConfig {
            chunk_size: 6,
            max_chunk_size: 64,
            token_delay: Duration::ZERO,
        },
        session: SessionConfig {
            message_limit: 3,
            window: Duration::from_secs(60),
            max_sessions_per_key: 1,
        },
        api_key_header: "x-api-key".to_owned(),
        org_header: "x-organization".to_owned(),
        shutdown_timeout: Duration::from_secs(1),
    }
}

/// State over a frozen clock, so buckets never refill during a test.
pub fn state(config: ServerConfig) -> AppState {
    let clock = Arc::new(ManualClock::new(1_000.0));
    let limiter = Arc::new(TokenBucketLimiter::new(config.limiter.clone(), None, clock));
    AppState::new(config, limiter, Arc::new(LocalPipeline))
}
