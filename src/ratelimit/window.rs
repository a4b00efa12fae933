//! Window specification and hit results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Largest window whose length in milliseconds still fits a store score.
const MAX_WINDOW_SECONDS: u64 = i64::MAX as u64 / 1000;

/// A budget of `limit` hits per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSpec {
    limit: u64,
    window_seconds: u64,
}

impl WindowSpec {
    /// Create a window spec. Both values must be positive and fit the
    /// store's signed 64-bit integers once the window is in milliseconds.
    pub fn new(limit: u64, window_seconds: u64) -> Result<Self> {
        let limit_ok = (1..=i64::MAX as u64).contains(&limit);
        let window_ok = (1..=MAX_WINDOW_SECONDS).contains(&window_seconds);
        if !limit_ok || !window_ok {
            return Err(LimiterError::InvalidWindow {
                limit,
                window_seconds,
            });
        }
        Ok(Self {
            limit,
            window_seconds,
        })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_seconds.saturating_mul(1000)
    }
}

/// What a strategy read back from the store for one hit.
///
/// `wait_or_ttl` is the key's remaining TTL for the fixed window and the
/// wait until the boundary entry ages out for the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOutcome {
    pub count: i64,
    pub wait_or_ttl: i64,
}

/// The outcome of a single hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitResult {
    /// Hits counted in the current window, including this one when admitted.
    pub current: u64,
    /// Hits left in the current window.
    pub remaining: u64,
    /// Whether this hit was rejected.
    pub over_limit: bool,
    /// Milliseconds to wait before the next hit can be admitted.
    pub wait_ms: u64,
}

impl HitResult {
    pub fn is_allowed(&self) -> bool {
        !self.over_limit
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}
