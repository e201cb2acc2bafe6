use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use factgate::{LimiterConfig, RateQuota};

/// Runtime configuration for the `factgate-server` binary.
///
/// These settings control admission control (the three quotas, bucket expiry
/// and store fail-over timing), the remote store connection, and chunked
/// stream delivery. All values are parsed from CLI arguments or environment
/// variables, with defaults suitable for a single local instance.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "factgate-server",
    version,
    about = "Rate-limited, resumable SSE and WebSocket text streaming"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// URL of the shared remote store holding rate-limit buckets.
    ///
    /// When unset, every instance keeps its buckets in process memory and no
    /// fail-over takes place.
    ///
    /// Environment variable: `REDIS_URL`
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Connection attempts made before the remote store is reported as
    /// unavailable.
    ///
    /// Environment variable: `STORE_CONNECT_ATTEMPTS`
    #[arg(long, env = "STORE_CONNECT_ATTEMPTS", default_value_t = 3)]
    pub store_connect_attempts: usize,

    /// Delay between two connection attempts, in milliseconds.
    ///
    /// Environment variable: `STORE_RETRY_DELAY_MS`
    #[arg(long, env = "STORE_RETRY_DELAY_MS", default_value_t = 100)]
    pub store_retry_delay_ms: u64,

    /// Upper bound on any single remote store operation, health probes
    /// included, in milliseconds.
    ///
    /// Environment variable: `STORE_OP_TIMEOUT_MS`
    #[arg(long, env = "STORE_OP_TIMEOUT_MS", default_value_t = 250)]
    pub store_op_timeout_ms: u64,

    /// Burst capacity of the per-API-key quota. Zero disables it.
    ///
    /// Environment variable: `RATE_KEY_BURST`
    #[arg(long, env = "RATE_KEY_BURST", default_value_t = 60)]
    pub rate_key_burst: u32,

    /// Tokens per second refilled into the per-API-key quota.
    ///
    /// Environment variable: `RATE_KEY_SUSTAIN`
    #[arg(long, env = "RATE_KEY_SUSTAIN", default_value_t = 1.0)]
    pub rate_key_sustain: f64,

    /// Burst capacity of the per-address quota. Zero disables it.
    ///
    /// Environment variable: `RATE_IP_BURST`
    #[arg(long, env = "RATE_IP_BURST", default_value_t = 120)]
    pub rate_ip_burst: u32,

    /// Tokens per second refilled into the per-address quota.
    ///
    /// Environment variable: `RATE_IP_SUSTAIN`
    #[arg(long, env = "RATE_IP_SUSTAIN", default_value_t = 2.0)]
    pub rate_ip_sustain: f64,

    /// Burst capacity of the per-organization quota. Zero disables it.
    ///
    /// Environment variable: `RATE_ORG_BURST`
    #[arg(long, env = "RATE_ORG_BURST", default_value_t = 600)]
    pub rate_org_burst: u32,

    /// Tokens per second refilled into the per-organization quota.
    ///
    /// Environment variable: `RATE_ORG_SUSTAIN`
    #[arg(long, env = "RATE_ORG_SUSTAIN", default_value_t = 10.0)]
    pub rate_org_sustain: f64,

    /// Idle time after which a bucket expires, in seconds.
    ///
    /// Environment variable: `BUCKET_TTL_SECS`
    #[arg(long, env = "BUCKET_TTL_SECS", default_value_t = 300)]
    pub bucket_ttl_secs: u64,

    /// Minimum time spent on the local store after the remote store fails,
    /// in seconds.
    ///
    /// Environment variable: `FALLBACK_TIMEOUT_SECS`
    #[arg(long, env = "FALLBACK_TIMEOUT_SECS", default_value_t = 30)]
    pub fallback_timeout_secs: u64,

    /// Minimum spacing between two health probes of the remote store, in
    /// seconds.
    ///
    /// Environment variable: `HEALTH_CHECK_INTERVAL_SECS`
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 5)]
    pub health_check_interval_secs: u64,

    /// Default size of a streamed chunk, in characters.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 160)]
    pub chunk_size: usize,

    /// Largest chunk size a client may ask for.
    ///
    /// Environment variable: `MAX_CHUNK_SIZE`
    #[arg(long, env = "MAX_CHUNK_SIZE", default_value_t = 4096)]
    pub max_chunk_size: usize,

    /// Default pause between two streamed chunks, in milliseconds.
    ///
    /// Environment variable: `TOKEN_DELAY_MS`
    #[arg(long, env = "TOKEN_DELAY_MS", default_value_t = 0)]
    pub token_delay_ms: u64,

    /// Header carrying the caller's API key.
    ///
    /// Environment variable: `API_KEY_HEADER`
    #[arg(long, env = "API_KEY_HEADER", default_value_t = String::from("x-api-key"))]
    pub api_key_header: String,

    /// Header carrying the caller's organization.
    ///
    /// Environment variable: `ORG_HEADER`
    #[arg(long, env = "ORG_HEADER", default_value_t = String::from("x-organization"))]
    pub org_header: String,

    /// Messages a single WebSocket session may send per window. Zero
    /// disables the per-session limit.
    ///
    /// Environment variable: `WS_SESSION_LIMIT`
    #[arg(long, env = "WS_SESSION_LIMIT", default_value_t = 30)]
    pub ws_session_limit: usize,

    /// Length of the per-session WebSocket window, in seconds.
    ///
    /// Environment variable: `WS_SESSION_WINDOW_SECS`
    #[arg(long, env = "WS_SESSION_WINDOW_SECS", default_value_t = 60)]
    pub ws_session_window_secs: u64,

    /// Parallel WebSocket sessions allowed per API key. Zero disables the
    /// cap.
    ///
    /// Environment variable: `WS_MAX_SESSIONS_PER_KEY`
    #[arg(long, env = "WS_MAX_SESSIONS_PER_KEY", default_value_t = 4)]
    pub ws_max_sessions_per_key: usize,

    /// How long in-flight streams may keep running after a shutdown signal,
    /// in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

/// Remote store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub connect_attempts: usize,
    pub retry_delay: Duration,
    pub op_timeout: Duration,
}

/// Defaults and bounds for chunked streams.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_size: usize,
    pub max_chunk_size: usize,
    pub token_delay: Duration,
}

/// Per-connection WebSocket limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub message_limit: usize,
    pub window: Duration,
    pub max_sessions_per_key: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub store: Option<StoreConfig>,
    pub limiter: LimiterConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub api_key_header: String,
    pub org_header: String,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.store_connect_attempts == 0 {
            bail!("STORE_CONNECT_ATTEMPTS must be greater than 0");
        }

        if args.chunk_size == 0 {
            bail!("CHUNK_SIZE must be greater than 0");
        }

        if args.chunk_size > args.max_chunk_size {
            bail!(
                "CHUNK_SIZE ({}) exceeds MAX_CHUNK_SIZE ({})",
                args.chunk_size,
                args.max_chunk_size
            );
        }

        if args.api_key_header.is_empty() || args.org_header.is_empty() {
            bail!("API_KEY_HEADER and ORG_HEADER must not be empty");
        }

        let quota = |name: &str, burst: u32, sustain: f64| {
            RateQuota::new(burst, sustain).map_err(|e| anyhow::anyhow!("{name}: {e}"))
        };

        let limiter = LimiterConfig {
            api: quota("RATE_KEY_SUSTAIN", args.rate_key_burst, args.rate_key_sustain)?,
            ip: quota("RATE_IP_SUSTAIN", args.rate_ip_burst, args.rate_ip_sustain)?,
            org: quota("RATE_ORG_SUSTAIN", args.rate_org_burst, args.rate_org_sustain)?,
            ttl: Duration::from_secs(args.bucket_ttl_secs),
            fallback_timeout: Duration::from_secs(args.fallback_timeout_secs),
            health_check_interval: Duration::from_secs(args.health_check_interval_secs),
        };
        limiter
            .validate()
            .map_err(|e| anyhow::anyhow!("BUCKET_TTL_SECS: {e}"))?;

        let store = args.redis_url.filter(|url| !url.is_empty()).map(|url| StoreConfig {
            url,
            connect_attempts: args.store_connect_attempts,
            retry_delay: Duration::from_millis(args.store_retry_delay_ms),
            op_timeout: Duration::from_millis(args.store_op_timeout_ms),
        });

        Ok(Self {
            server_addr: args.server_addr,
            store,
            limiter,
            stream: StreamConfig {
                chunk_size: args.chunk_size,
                max_chunk_size: args.max_chunk_size,
                token_delay: Duration::from_millis(args.token_delay_ms),
            },
            session: SessionConfig {
                message_limit: args.ws_session_limit,
                window: Duration::from_secs(args.ws_session_window_secs),
                max_sessions_per_key: args.ws_max_sessions_per_key,
            },
            api_key_header: args.api_key_header.to_ascii_lowercase(),
            org_header: args.org_header.to_ascii_lowercase(),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
