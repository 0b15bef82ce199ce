//! Throttle limit definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Largest `max_count` a single limit may declare.
pub const MAX_COUNT_LIMIT: i64 = i32::MAX as i64;

/// Time unit used to express a limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Per-millisecond window
    Millisecond,
    /// Per-second window
    Second,
    /// Per-minute window
    Minute,
    /// Per-hour window
    Hour,
    /// Per-day window
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A single `(window, max_count)` limit.
///
/// At most `max_count` executions are admitted within any rolling `window`.
/// A `max_count` of zero means the entry imposes no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThrottleLimit {
    window: Duration,
    max_count: usize,
}

impl ThrottleLimit {
    /// Create a new limit.
    ///
    /// Fails with [`SluiceError::InvalidArgument`] if `max_count` is negative
    /// or above [`MAX_COUNT_LIMIT`].
    pub fn new(window: Duration, max_count: i64) -> Result<Self> {
        if max_count > MAX_COUNT_LIMIT {
            return Err(SluiceError::InvalidArgument(format!(
                "max_count must be at most {}, got {}",
                MAX_COUNT_LIMIT, max_count
            )));
        }
        let max_count = usize::try_from(max_count).map_err(|_| {
            SluiceError::InvalidArgument(format!(
                "max_count must be non-negative, got {}",
                max_count
            ))
        })?;

        Ok(Self { window, max_count })
    }

    /// Create a limit entry that never restricts executions.
    pub fn unlimited(window: Duration) -> Self {
        Self {
            window,
            max_count: 0,
        }
    }

    /// Get the rolling window of this limit.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the maximum executions admitted per window.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Whether this entry imposes no limit.
    pub fn is_unlimited(&self) -> bool {
        self.max_count == 0
    }
}

impl fmt::Display for ThrottleLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited per {:?}", self.window)
        } else {
            write!(f, "{} per {:?}", self.max_count, self.window)
        }
    }
}
