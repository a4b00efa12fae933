//! Rate limiter facade.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{Algorithm, Execution, LimiterOptions};
use crate::error::{LimiterError, Result};
use crate::store::{Command, Store, StoreError};

use super::clock::{Clock, SystemClock};
use super::fixed::FixedWindow;
use super::key::RateLimitKey;
use super::sliding::SlidingWindow;
use super::window::{HitResult, RawOutcome, WindowSpec};

/// The strategy a limiter was built with.
#[derive(Debug)]
enum Strategy {
    Fixed(FixedWindow),
    Sliding(SlidingWindow),
}

/// Distributed rate limiter over a shared store.
///
/// Holds configuration only; all counting state lives in the store, so any
/// number of limiters in any number of processes can share a budget. The
/// limiter is `Send + Sync` and is meant to be shared behind an `Arc`.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    key_prefix: String,
    strategy: Strategy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter using the system clock.
    pub fn new(store: Arc<dyn Store>, options: LimiterOptions) -> Self {
        Self::with_clock(store, options, Arc::new(SystemClock))
    }

    /// Create a new rate limiter with an explicit clock for sliding window timestamps.
    pub fn with_clock(store: Arc<dyn Store>, options: LimiterOptions, clock: Arc<dyn Clock>) -> Self {
        let strategy = match options.algorithm {
            Algorithm::Fixed => Strategy::Fixed(FixedWindow::new(options.execution)),
            Algorithm::Sliding => Strategy::Sliding(SlidingWindow::new(options.execution)),
        };

        Self {
            store,
            key_prefix: options.key_prefix,
            strategy,
            clock,
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn algorithm(&self) -> Algorithm {
        match self.strategy {
            Strategy::Fixed(_) => Algorithm::Fixed,
            Strategy::Sliding(_) => Algorithm::Sliding,
        }
    }

    pub fn execution(&self) -> Execution {
        match &self.strategy {
            Strategy::Fixed(fixed) => fixed.execution(),
            Strategy::Sliding(sliding) => sliding.execution(),
        }
    }

    /// The store key used for a caller identifier.
    pub fn namespaced(&self, key: &str) -> RateLimitKey {
        RateLimitKey::new(&self.key_prefix, key)
    }

    /// Register one hit against `key`, allowing `limit` hits per `window_seconds`.
    ///
    /// Returns [`LimiterError::HitRegistrationFailed`] when the store
    /// interaction fails for any reason; whether to fail open or closed is up
    /// to the caller.
    pub async fn hit(&self, key: &str, limit: u64, window_seconds: u64) -> Result<HitResult> {
        let window = WindowSpec::new(limit, window_seconds)?;
        let key = self.namespaced(key);

        trace!(
            key = %key,
            limit = limit,
            window_seconds = window_seconds,
            "Registering hit"
        );

        let result = match &self.strategy {
            Strategy::Fixed(fixed) => {
                let outcome = fixed
                    .evaluate(self.store.as_ref(), &key, &window)
                    .await
                    .map_err(|e| registration_failed(&key, e))?;
                let ttl_lost = outcome.wait_or_ttl < 0;
                if ttl_lost {
                    warn!(
                        key = %key,
                        ttl_ms = outcome.wait_or_ttl,
                        "Fixed window lost its expiry, re-applying"
                    );
                    self.store
                        .execute(Command::Expire {
                            key: key.as_str().to_string(),
                            seconds: window.window_seconds(),
                        })
                        .await
                        .map_err(|e| registration_failed(&key, e))?;
                }
                fixed_result(outcome, &window)
            }
            Strategy::Sliding(sliding) => {
                let outcome = sliding
                    .evaluate(self.store.as_ref(), &key, &window, self.clock.now_ms())
                    .await
                    .map_err(|e| registration_failed(&key, e))?;
                sliding_result(outcome, &window)
            }
        };

        if result.over_limit {
            debug!(
                key = %key,
                current = result.current,
                limit = limit,
                wait_ms = result.wait_ms,
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    /// Delete all state for `key`. Missing keys are not an error.
    pub async fn reset(&self, key: &str) -> Result<()> {
        let key = self.namespaced(key);
        self.store
            .execute(Command::Del {
                key: key.as_str().to_string(),
            })
            .await?;
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }
}

fn registration_failed(key: &RateLimitKey, source: StoreError) -> LimiterError {
    warn!(key = %key, error = %source, "Could not register hit");
    LimiterError::HitRegistrationFailed {
        key: key.to_string(),
        source,
    }
}

/// Over the limit once the counter passes it; the wait is the window's remaining TTL.
///
/// A negative TTL means the key had lost its expiry; the caller re-applies it
/// and this hit reports no wait.
fn fixed_result(outcome: RawOutcome, window: &WindowSpec) -> HitResult {
    let current = outcome.count.max(0) as u64;
    let ttl_ms = outcome.wait_or_ttl.max(0) as u64;
    let over_limit = current > window.limit();

    HitResult {
        current,
        remaining: window.limit().saturating_sub(current),
        over_limit,
        wait_ms: if over_limit { ttl_ms } else { 0 },
    }
}

/// Over the limit whenever the strategy reported a wait.
fn sliding_result(outcome: RawOutcome, window: &WindowSpec) -> HitResult {
    let current = outcome.count.max(0) as u64;
    let wait_ms = outcome.wait_or_ttl.max(0) as u64;

    HitResult {
        current,
        remaining: if current > 0 {
            window.limit().saturating_sub(current)
        } else {
            0
        },
        over_limit: wait_ms > 0,
        wait_ms,
    }
}
