use crate::error::{Error, Result};
use core::{fmt, time::Duration};

/// Capacity and refill rate of one quota dimension.
///
/// A `burst` of zero disables the quota: it is never evaluated and never
/// touches a store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateQuota {
    burst: u32,
    sustain: f64,
}

impl RateQuota {
    /// Creates a quota holding at most `burst` tokens, refilled at `sustain`
    /// tokens per second.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQuota`] unless `sustain` is finite and
    /// strictly positive.
    pub fn new(burst: u32, sustain: f64) -> Result<Self> {
        if !sustain.is_finite() || sustain <= 0.0 {
            return Err(Error::InvalidQuota {
                reason: format!("sustain must be a positive number of tokens per second, got {sustain}"),
            });
        }
        Ok(Self { burst, sustain })
    }

    /// A quota that is never enforced.
    pub const fn disabled() -> Self {
        Self {
            burst: 0,
            sustain: 1.0,
        }
    }

    pub const fn burst(&self) -> u32 {
        self.burst
    }

    pub const fn sustain(&self) -> f64 {
        self.sustain
    }

    pub const fn is_enabled(&self) -> bool {
        self.burst > 0
    }
}

/// The independent axes a request is limited on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    /// The caller's API key.
    ApiKey,
    /// The caller's network address.
    Ip,
    /// The caller's organization.
    Org,
}

impl Dimension {
    pub const ALL: [Self; 3] = [Self::ApiKey, Self::Ip, Self::Org];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "key",
            Self::Ip => "ip",
            Self::Org => "org",
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::ApiKey => 0,
            Self::Ip => 1,
            Self::Org => 2,
        }
    }

    /// Store key of the bucket for `identity` along this dimension.
    pub fn bucket_key(&self, identity: &str) -> String {
        format!("rl:{}:{identity}", self.as_str())
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking: one identifier per [`Dimension`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub api_key: String,
    pub ip: String,
    pub org: String,
}

impl Identity {
    pub fn new(api_key: impl Into<String>, ip: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ip: ip.into(),
            org: org.into(),
        }
    }

    pub fn get(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::ApiKey => &self.api_key,
            Dimension::Ip => &self.ip,
            Dimension::Org => &self.org,
        }
    }
}

/// Settings for a [`TokenBucketLimiter`].
///
/// [`TokenBucketLimiter`]: crate::TokenBucketLimiter
#[derive(Clone, Debug, PartialEq)]
pub struct LimiterConfig {
    pub api: RateQuota,
    pub ip: RateQuota,
    pub org: RateQuota,
    /// Idle time after which a bucket is dropped from its store.
    pub ttl: Duration,
    /// Minimum time spent serving from the local store after a remote failure.
    pub fallback_timeout: Duration,
    /// Minimum spacing between two health probes of the remote store.
    pub health_check_interval: Duration,
}

impl LimiterConfig {
    pub const fn quota(&self, dimension: Dimension) -> &RateQuota {
        match dimension {
            Dimension::ApiKey => &self.api,
            Dimension::Ip => &self.ip,
            Dimension::Org => &self.org,
        }
    }

    /// Checks settings that would otherwise turn limiting off without notice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when `ttl` is zero: every bucket
    /// would be deleted right after being written and each request would
    /// see a full bucket.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "bucket ttl must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// Sum of the bursts of every enabled quota.
    pub fn total_burst(&self) -> u64 {
        Dimension::ALL
            .iter()
            .map(|d| u64::from(self.quota(*d).burst()))
            .sum()
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            api: RateQuota {
                burst: 60,
                sustain: 1.0,
            },
            ip: RateQuota {
                burst: 120,
                sustain: 2.0,
            },
            org: RateQuota {
                burst: 600,
                sustain: 10.0,
            },
            ttl: Duration::from_secs(300),
            fallback_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
        }
    }
}
