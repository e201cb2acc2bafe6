use crate::{limiter::RateQuota, store::Fields};

const TOKENS: &str = "tokens";
const TS: &str = "ts";

/// Stored state of one bucket: the token level and when it was last refilled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: f64,
}

impl BucketState {
    /// Decodes a bucket from its store fields. Missing or malformed fields
    /// read as an absent bucket.
    pub fn decode(fields: &Fields) -> Option<Self> {
        let tokens = fields.get(TOKENS)?.parse::<f64>().ok()?;
        let last_refill = fields.get(TS)?.parse::<f64>().ok()?;
        (tokens.is_finite() && last_refill.is_finite()).then_some(Self {
            tokens,
            last_refill,
        })
    }

    pub fn encode(&self) -> Fields {
        Fields::from([
            (TOKENS.to_owned(), self.tokens.to_string()),
            (TS.to_owned(), self.last_refill.to_string()),
        ])
    }

    /// Runs one token-bucket step at time `now`.
    ///
    /// An absent bucket starts full. Tokens refill at `sustain` per second of
    /// non-negative elapsed time, capped at `burst`. One token is taken only
    /// if `consume` is set and a whole token is available. Returns the new
    /// state (stamped `now`) and whether the request is allowed.
    pub fn step(previous: Option<Self>, quota: &RateQuota, now: f64, consume: bool) -> (Self, bool) {
        let burst = f64::from(quota.burst());
        let (tokens, last) = previous.map_or((burst, now), |b| (b.tokens, b.last_refill));
        let elapsed = (now - last).max(0.0);
        let mut tokens = (tokens + elapsed * quota.sustain()).clamp(0.0, burst);
        let allowed = tokens >= 1.0;
        if consume && allowed {
            tokens -= 1.0;
        }
        (
            Self {
                tokens,
                last_refill: now,
            },
            allowed,
        )
    }

    /// Whole seconds until one token is available, never less than one.
    pub fn retry_after(&self, quota: &RateQuota) -> u64 {
        let wait = ((1.0 - self.tokens) / quota.sustain()).ceil();
        if wait.is_finite() && wait > 1.0 {
            wait as u64
        } else {
            1
        }
    }
}
