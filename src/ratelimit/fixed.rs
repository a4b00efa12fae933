//! Fixed window strategy.
//!
//! A window starts at the first hit after the previous one lapsed and lasts
//! exactly `window_seconds`. The expiry is attached to a scratch key that is
//! renamed onto the counter only when the counter does not exist yet, so the
//! increments inside a window never push its end forward.

use tracing::trace;

use crate::config::Execution;
use crate::store::{Command, LuaScript, Reply, Store, StoreError, StoreResult};

use super::key::RateLimitKey;
use super::window::{RawOutcome, WindowSpec};

/// KEYS[1] = counter key, ARGV[1] = window in seconds.
///
/// Returns the four command replies: `{setex, renamenx, incr, pttl}`.
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = ARGV[1]
local tmp_key = string.format('tmp:%s', key)
local r0 = redis.call('setex', tmp_key, ttl, 0)
local r1 = redis.call('renamenx', tmp_key, key)
local r2 = redis.call('incr', key)
local r3 = redis.call('pttl', key)

return {r0, r1, r2, r3}
"#;

/// Fixed window counter evaluated by script or by transaction.
#[derive(Debug)]
pub struct FixedWindow {
    execution: Execution,
    script: LuaScript,
}

impl FixedWindow {
    pub fn new(execution: Execution) -> Self {
        Self {
            execution,
            script: LuaScript::new(FIXED_WINDOW_SCRIPT),
        }
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Count one hit, returning the counter and its remaining TTL in ms.
    pub async fn evaluate(
        &self,
        store: &dyn Store,
        key: &RateLimitKey,
        window: &WindowSpec,
    ) -> StoreResult<RawOutcome> {
        let replies = match self.execution {
            Execution::Scripted => {
                let keys = [key.as_str().to_string()];
                let args = [window.window_seconds().to_string()];
                self.script.invoke(store, &keys, &args).await?.into_array()?
            }
            Execution::Transactional => store.atomic(Self::commands(key, window)).await?,
        };

        let outcome = Self::parse(&replies)?;
        trace!(
            key = %key,
            count = outcome.count,
            ttl_ms = outcome.wait_or_ttl,
            "Fixed window evaluated"
        );
        Ok(outcome)
    }

    /// The command sequence shared by both execution paths.
    fn commands(key: &RateLimitKey, window: &WindowSpec) -> Vec<Command> {
        let tmp_key = key.temp_key();
        vec![
            Command::SetEx {
                key: tmp_key.clone(),
                value: "0".to_string(),
                seconds: window.window_seconds(),
            },
            Command::RenameNx {
                from: tmp_key,
                to: key.as_str().to_string(),
            },
            Command::Incr {
                key: key.as_str().to_string(),
            },
            Command::Pttl {
                key: key.as_str().to_string(),
            },
        ]
    }

    fn parse(replies: &[Reply]) -> StoreResult<RawOutcome> {
        match replies {
            [_, _, count, ttl] => Ok(RawOutcome {
                count: count.as_i64()?,
                wait_or_ttl: ttl.as_i64()?,
            }),
            _ => Err(StoreError::MalformedReply(format!(
                "expected 4 fixed window replies, got {}",
                replies.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (MemoryStore::new(clock.clone()), clock)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("rlimit:", "api")
    }

    #[test]
    fn test_commands_match_script_steps() {
        let window = WindowSpec::new(5, 60).unwrap();
        let commands = FixedWindow::commands(&key(), &window);

        assert_eq!(commands.len(), 4);
        assert_eq!(
            commands[0],
            Command::SetEx {
                key: "tmp:rlimit:api".to_string(),
                value: "0".to_string(),
                seconds: 60,
            }
        );
        assert!(matches!(&commands[1], Command::RenameNx { to, .. } if to == "rlimit:api"));
    }

    #[test]
    fn test_parse_rejects_short_reply() {
        let replies = vec![Reply::Int(1), Reply::Int(2)];
        assert!(matches!(
            FixedWindow::parse(&replies),
            Err(StoreError::MalformedReply(_))
        ));
    }

    async fn counts_and_ttl_not_extended(execution: Execution) {
        let (store, clock) = setup();
        let strategy = FixedWindow::new(execution);
        let window = WindowSpec::new(3, 2).unwrap();

        let first = strategy.evaluate(&store, &key(), &window).await.unwrap();
        assert_eq!(first, RawOutcome { count: 1, wait_or_ttl: 2000 });

        clock.advance(Duration::from_millis(700));
        let second = strategy.evaluate(&store, &key(), &window).await.unwrap();
        assert_eq!(second, RawOutcome { count: 2, wait_or_ttl: 1300 });

        clock.advance(Duration::from_millis(1299));
        let third = strategy.evaluate(&store, &key(), &window).await.unwrap();
        assert_eq!(third, RawOutcome { count: 3, wait_or_ttl: 1 });

        // The window lapses exactly two seconds after the first hit.
        clock.advance(Duration::from_millis(1));
        let fresh = strategy.evaluate(&store, &key(), &window).await.unwrap();
        assert_eq!(fresh, RawOutcome { count: 1, wait_or_ttl: 2000 });
    }

    #[tokio::test]
    async fn test_scripted_counts_and_ttl_not_extended() {
        counts_and_ttl_not_extended(Execution::Scripted).await;
    }

    #[tokio::test]
    async fn test_transactional_counts_and_ttl_not_extended() {
        counts_and_ttl_not_extended(Execution::Transactional).await;
    }

    #[tokio::test]
    async fn test_execution_paths_are_equivalent() {
        let window = WindowSpec::new(10, 5).unwrap();
        let (scripted_store, scripted_clock) = setup();
        let (tx_store, tx_clock) = setup();
        let scripted = FixedWindow::new(Execution::Scripted);
        let transactional = FixedWindow::new(Execution::Transactional);

        for _ in 0..20 {
            let a = scripted.evaluate(&scripted_store, &key(), &window).await.unwrap();
            let b = transactional.evaluate(&tx_store, &key(), &window).await.unwrap();
            assert_eq!(a, b);

            scripted_clock.advance(Duration::from_millis(400));
            tx_clock.advance(Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_scripted_loads_script_once() {
        let (store, _clock) = setup();
        let strategy = FixedWindow::new(Execution::Scripted);
        let window = WindowSpec::new(3, 2).unwrap();

        for _ in 0..5 {
            strategy.evaluate(&store, &key(), &window).await.unwrap();
        }
        assert_eq!(store.script_loads(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_error() {
        let (store, _clock) = setup();
        store.set_available(false);
        let window = WindowSpec::new(3, 2).unwrap();

        for execution in [Execution::Scripted, Execution::Transactional] {
            let result = FixedWindow::new(execution).evaluate(&store, &key(), &window).await;
            assert!(matches!(result, Err(StoreError::Unavailable(_))));
        }
    }
}
