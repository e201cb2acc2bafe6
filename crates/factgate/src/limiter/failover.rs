use core::fmt;

/// Which store is authoritative for bucket state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// The shared remote store serves every bucket operation.
    Primary,
    /// The remote store is considered unhealthy; the local store serves.
    Fallback,
    /// No remote store is configured at all.
    Local,
}

impl StoreMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance-local fail-over bookkeeping of a limiter.
///
/// Only the owning limiter mutates it; callers get copies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FailoverState {
    pub using_fallback: bool,
    /// Earliest time at which a fail-back probe may run.
    pub fallback_until: Option<f64>,
    /// When the remote store was last probed.
    pub last_health_check: f64,
}

impl FailoverState {
    pub(crate) const fn new(now: f64) -> Self {
        Self {
            using_fallback: false,
            fallback_until: None,
            last_health_check: now,
        }
    }

    /// Enters (or stays in) FALLBACK until at least `until`. An existing
    /// window is never shortened. Returns `true` on an actual transition.
    pub(crate) fn degrade(&mut self, until: f64) -> bool {
        let was_degraded = self.using_fallback;
        self.using_fallback = true;
        self.fallback_until = Some(self.fallback_until.map_or(until, |current| current.max(until)));
        !was_degraded
    }

    pub(crate) fn restore(&mut self) {
        self.using_fallback = false;
        self.fallback_until = None;
    }

    /// Whether the fallback window has elapsed at `now`.
    pub(crate) fn window_elapsed(&self, now: f64) -> bool {
        self.fallback_until.is_none_or(|until| now >= until)
    }
}
