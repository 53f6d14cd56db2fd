use crate::settings::Device;

/// Poll cadence rules for the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    pub initial_interval: i64,
    pub increment: i64,
    pub max_interval: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Poll respected the interval; interval unchanged.
    Proceed,
    /// Poll came too early; persist `new_interval` (never lower than before).
    SlowDown { new_interval: i64 },
}

impl From<&Device> for PollingPolicy {
    fn from(cfg: &Device) -> Self {
        Self {
            initial_interval: cfg.poll_interval_secs,
            increment: cfg.slow_down_increment_secs,
            max_interval: cfg.max_poll_interval_secs,
        }
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self::from(&Device::default())
    }
}

impl PollingPolicy {
    /// Judge a poll at `now` against the record's previous poll.
    ///
    /// The first poll is always on time. A poll strictly sooner than
    /// `interval` seconds after the previous one is a slow_down.
    pub fn evaluate(&self, last_poll_at: Option<i64>, interval: i64, now: i64) -> PollDecision {
        match last_poll_at {
            Some(last) if now - last < interval => PollDecision::SlowDown {
                new_interval: self.bump(interval),
            },
            _ => PollDecision::Proceed,
        }
    }

    /// Interval after one slow_down. The cap never lowers an interval that
    /// is already above it.
    pub fn bump(&self, interval: i64) -> i64 {
        interval
            .saturating_add(self.increment)
            .min(self.max_interval)
            .max(interval)
    }
}
