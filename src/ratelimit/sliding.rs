//! Sliding window strategy.
//!
//! Every admitted hit is a sorted set entry scored by its millisecond
//! timestamp. A hit is admitted when the `limit`-th most recent entry is
//! missing or already outside the trailing window; otherwise the caller is told
//! how long until that entry ages out. Stale entries are never deleted, they
//! simply fall out of the score ranges, and the key expires after a full
//! window without hits.

use tracing::trace;
use uuid::Uuid;

use crate::config::Execution;
use crate::store::{Command, LuaScript, Reply, Store, StoreError, StoreResult};

use super::key::RateLimitKey;
use super::window::{RawOutcome, WindowSpec};

/// KEYS[1] = window key, ARGV = `now_ms, window_seconds, limit, member`.
///
/// Returns `{count, wait_ms}`; a wait of zero means the hit was recorded.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local lower = now - window * 1000

local boundary = redis.call('zrevrange', key, limit - 1, limit - 1, 'WITHSCORES')
local count = redis.call('zcount', key, lower, now)

if boundary[2] and tonumber(boundary[2]) > lower then
    redis.call('expire', key, window)
    return {count, tonumber(boundary[2]) - lower}
end

redis.call('zadd', key, now, member)
redis.call('expire', key, window)
return {count + 1, 0}
"#;

/// Optimistic commits tried before a transactional hit gives up.
const MAX_WATCH_ATTEMPTS: usize = 16;

/// Sliding log evaluated by script or by transaction.
#[derive(Debug)]
pub struct SlidingWindow {
    execution: Execution,
    script: LuaScript,
}

impl SlidingWindow {
    pub fn new(execution: Execution) -> Self {
        Self {
            execution,
            script: LuaScript::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    /// Try to record one hit at `now_ms`, returning the in-window count and the wait in ms.
    pub async fn evaluate(
        &self,
        store: &dyn Store,
        key: &RateLimitKey,
        window: &WindowSpec,
        now_ms: u64,
    ) -> StoreResult<RawOutcome> {
        let member = entry_member(now_ms);
        let outcome = match self.execution {
            Execution::Scripted => self.run_script(store, key, window, now_ms, member).await?,
            Execution::Transactional => Self::run_transaction(store, key, window, now_ms, member).await?,
        };

        trace!(
            key = %key,
            count = outcome.count,
            wait_ms = outcome.wait_or_ttl,
            "Sliding window evaluated"
        );
        Ok(outcome)
    }

    async fn run_script(
        &self,
        store: &dyn Store,
        key: &RateLimitKey,
        window: &WindowSpec,
        now_ms: u64,
        member: String,
    ) -> StoreResult<RawOutcome> {
        let keys = [key.as_str().to_string()];
        let args = [
            now_ms.to_string(),
            window.window_seconds().to_string(),
            window.limit().to_string(),
            member,
        ];

        let replies = self.script.invoke(store, &keys, &args).await?.into_array()?;
        match replies.as_slice() {
            [count, wait] => Ok(RawOutcome {
                count: count.as_i64()?,
                wait_or_ttl: wait.as_i64()?,
            }),
            _ => Err(StoreError::MalformedReply(format!(
                "expected 2 sliding window replies, got {}",
                replies.len()
            ))),
        }
    }

    /// Decide under `WATCH`, then commit.
    ///
    /// The boundary and the count are read while the key is watched; the
    /// commit queues the entry only when the hit is admitted, plus the expiry
    /// refresh. A commit discarded because another client wrote to the key in
    /// between is retried from the reads.
    async fn run_transaction(
        store: &dyn Store,
        key: &RateLimitKey,
        window: &WindowSpec,
        now_ms: u64,
        member: String,
    ) -> StoreResult<RawOutcome> {
        let lower = (now_ms as i64).saturating_sub(window.window_ms() as i64);
        let rank = window.limit() as i64 - 1;

        let reads = || {
            vec![
                Command::ZRevRangeWithScores {
                    key: key.as_str().to_string(),
                    start: rank,
                    stop: rank,
                },
                Command::ZCount {
                    key: key.as_str().to_string(),
                    min: lower,
                    max: now_ms as i64,
                },
            ]
        };
        let plan = |replies: &[Reply]| -> StoreResult<Vec<Command>> {
            let mut commands = Vec::with_capacity(2);
            if Decision::from_reads(replies)?.wait(lower).is_none() {
                commands.push(Command::ZAdd {
                    key: key.as_str().to_string(),
                    score: now_ms,
                    member: member.clone(),
                });
            }
            commands.push(Command::Expire {
                key: key.as_str().to_string(),
                seconds: window.window_seconds(),
            });
            Ok(commands)
        };

        for attempt in 1..=MAX_WATCH_ATTEMPTS {
            match store.watched(key.as_str(), reads(), &plan).await? {
                Some(replies) => return Ok(Decision::from_reads(&replies.reads)?.outcome(lower)),
                None => trace!(key = %key, attempt = attempt, "Window changed before commit, retrying"),
            }
        }
        Err(StoreError::Contended(format!(
            "{key} changed before every one of {MAX_WATCH_ATTEMPTS} commits"
        )))
    }
}

/// What the boundary and count reads say about one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decision {
    /// Entries inside the window before this hit.
    count: i64,
    /// Score of the `limit`-th newest entry, if there are that many.
    boundary: Option<i64>,
}

impl Decision {
    fn from_reads(replies: &[Reply]) -> StoreResult<Self> {
        match replies {
            [boundary, count] => Ok(Self {
                count: count.as_i64()?,
                boundary: boundary_score(boundary.clone())?,
            }),
            _ => Err(StoreError::MalformedReply(format!(
                "expected 2 sliding window reads, got {}",
                replies.len()
            ))),
        }
    }

    /// Milliseconds until the boundary entry leaves the window, when it is still inside.
    fn wait(&self, lower: i64) -> Option<i64> {
        self.boundary.filter(|ts| *ts > lower).map(|ts| ts - lower)
    }

    fn outcome(&self, lower: i64) -> RawOutcome {
        match self.wait(lower) {
            Some(wait) => RawOutcome {
                count: self.count,
                wait_or_ttl: wait,
            },
            None => RawOutcome {
                count: self.count + 1,
                wait_or_ttl: 0,
            },
        }
    }
}

/// Score of the single `[member, score]` pair a `ZREVRANGE ... WITHSCORES` returned.
fn boundary_score(reply: Reply) -> StoreResult<Option<i64>> {
    let items = reply.into_flat_array()?;
    match items.get(1) {
        Some(score) => Ok(Some(score.as_f64()? as i64)),
        None => Ok(None),
    }
}

/// Unique sorted set member for a hit.
///
/// Hits landing in the same millisecond, from any process, must stay distinct
/// members, so the timestamp is paired with a random UUID.
pub(crate) fn entry_member(now_ms: u64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    const START: u64 = 1_700_000_000_000;

    fn setup() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        (MemoryStore::new(clock.clone()), clock)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("rlimit:", "login:failed")
    }

    async fn entries(store: &MemoryStore) -> i64 {
        store
            .execute(Command::ZCount {
                key: key().as_str().to_string(),
                min: 0,
                max: i64::MAX,
            })
            .await
            .unwrap()
            .as_i64()
            .unwrap()
    }

    #[test]
    fn test_entry_members_are_unique() {
        let a = entry_member(START);
        let b = entry_member(START);
        assert_ne!(a, b);
        assert!(a.starts_with("1700000000000-"));
    }

    #[test]
    fn test_boundary_score() {
        let reply = Reply::Array(vec![
            Reply::Data("m".to_string()),
            Reply::Data("1700000000000".to_string()),
        ]);
        assert_eq!(boundary_score(reply).unwrap(), Some(1_700_000_000_000));
        assert_eq!(boundary_score(Reply::Array(vec![])).unwrap(), None);
    }

    async fn third_hit_rejected(execution: Execution) {
        let (store, clock) = setup();
        let strategy = SlidingWindow::new(execution);
        let window = WindowSpec::new(2, 30).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(
                strategy
                    .evaluate(&store, &key(), &window, clock.now_ms())
                    .await
                    .unwrap(),
            );
            clock.advance(Duration::from_millis(1));
        }

        assert_eq!(outcomes[0], RawOutcome { count: 1, wait_or_ttl: 0 });
        assert_eq!(outcomes[1], RawOutcome { count: 2, wait_or_ttl: 0 });
        // Oldest entry at START, evaluated at START + 2.
        assert_eq!(outcomes[2], RawOutcome { count: 2, wait_or_ttl: 29_998 });
        assert_eq!(entries(&store).await, 2);
    }

    #[tokio::test]
    async fn test_scripted_third_hit_rejected() {
        third_hit_rejected(Execution::Scripted).await;
    }

    #[tokio::test]
    async fn test_transactional_third_hit_rejected() {
        third_hit_rejected(Execution::Transactional).await;
    }

    async fn wait_shrinks_until_oldest_ages_out(execution: Execution) {
        let (store, clock) = setup();
        let strategy = SlidingWindow::new(execution);
        let window = WindowSpec::new(3, 30).unwrap();

        for _ in 0..3 {
            strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }

        clock.set(START + 10_000);
        let at_10s = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
        clock.set(START + 20_000);
        let at_20s = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
        clock.set(START + 29_999);
        let at_30s = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();

        assert_eq!(at_10s.wait_or_ttl, 20_000);
        assert_eq!(at_20s.wait_or_ttl, 10_000);
        assert_eq!(at_30s.wait_or_ttl, 1);

        clock.set(START + 30_001);
        let admitted = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
        assert_eq!(admitted, RawOutcome { count: 3, wait_or_ttl: 0 });
    }

    #[tokio::test]
    async fn test_scripted_wait_shrinks_until_oldest_ages_out() {
        wait_shrinks_until_oldest_ages_out(Execution::Scripted).await;
    }

    #[tokio::test]
    async fn test_transactional_wait_shrinks_until_oldest_ages_out() {
        wait_shrinks_until_oldest_ages_out(Execution::Transactional).await;
    }

    #[tokio::test]
    async fn test_rejected_hit_refreshes_expiry() {
        for execution in [Execution::Scripted, Execution::Transactional] {
            let (store, clock) = setup();
            let strategy = SlidingWindow::new(execution);
            let window = WindowSpec::new(1, 30).unwrap();

            strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
            clock.advance(Duration::from_secs(10));
            let rejected = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
            assert!(rejected.wait_or_ttl > 0);

            let ttl = store
                .execute(Command::Pttl {
                    key: key().as_str().to_string(),
                })
                .await
                .unwrap();
            assert_eq!(ttl, Reply::Int(30_000));
        }
    }

    #[tokio::test]
    async fn test_execution_paths_are_equivalent() {
        let window = WindowSpec::new(4, 2).unwrap();
        let (scripted_store, scripted_clock) = setup();
        let (tx_store, tx_clock) = setup();
        let scripted = SlidingWindow::new(Execution::Scripted);
        let transactional = SlidingWindow::new(Execution::Transactional);

        for step in 0..40u64 {
            let a = scripted
                .evaluate(&scripted_store, &key(), &window, scripted_clock.now_ms())
                .await
                .unwrap();
            let b = transactional
                .evaluate(&tx_store, &key(), &window, tx_clock.now_ms())
                .await
                .unwrap();
            assert_eq!(a, b, "step {}", step);

            let pause = Duration::from_millis(50 + (step % 7) * 40);
            scripted_clock.advance(pause);
            tx_clock.advance(pause);
        }
    }

    #[tokio::test]
    async fn test_same_millisecond_hits_are_all_recorded() {
        let (store, clock) = setup();
        let strategy = SlidingWindow::new(Execution::Scripted);
        let window = WindowSpec::new(5, 10).unwrap();

        for expected in 1..=5 {
            let outcome = strategy.evaluate(&store, &key(), &window, clock.now_ms()).await.unwrap();
            assert_eq!(outcome, RawOutcome { count: expected, wait_or_ttl: 0 });
        }
        assert_eq!(entries(&store).await, 5);
    }

    async fn seed(store: &MemoryStore, score: u64, member: &str) {
        store
            .execute(Command::ZAdd {
                key: key().as_str().to_string(),
                score,
                member: member.to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_hit_leaves_no_entry_for_later_callers() {
        for execution in [Execution::Scripted, Execution::Transactional] {
            let (store, _clock) = setup();
            let strategy = SlidingWindow::new(execution);
            let window = WindowSpec::new(1, 30).unwrap();
            seed(&store, START, "first").await;

            let rejected = strategy
                .evaluate(&store, &key(), &window, START + 29_999)
                .await
                .unwrap();
            assert_eq!(rejected, RawOutcome { count: 1, wait_or_ttl: 1 }, "{:?}", execution);

            // The first entry has aged out; only a leftover rejected entry could block this.
            let admitted = strategy
                .evaluate(&store, &key(), &window, START + 30_001)
                .await
                .unwrap();
            assert_eq!(admitted, RawOutcome { count: 1, wait_or_ttl: 0 }, "{:?}", execution);
            assert_eq!(entries(&store).await, 2);
        }
    }

    #[tokio::test]
    async fn test_transaction_rereads_when_key_changes_before_commit() {
        let (store, _clock) = setup();
        let strategy = SlidingWindow::new(Execution::Transactional);
        let window = WindowSpec::new(2, 30).unwrap();
        seed(&store, START, "first").await;

        // Another client takes the last slot between our reads and our commit.
        let window_key = key().as_str().to_string();
        store.intercept_next_commit(move |keyspace| {
            keyspace
                .apply(Command::ZAdd {
                    key: window_key,
                    score: START + 5,
                    member: "other".to_string(),
                })
                .unwrap();
        });

        let outcome = strategy
            .evaluate(&store, &key(), &window, START + 10)
            .await
            .unwrap();
        assert_eq!(outcome, RawOutcome { count: 2, wait_or_ttl: 29_990 });
        assert_eq!(entries(&store).await, 2);
    }

    #[tokio::test]
    async fn test_caller_clock_behind_newer_entries() {
        for execution in [Execution::Scripted, Execution::Transactional] {
            let (store, _clock) = setup();
            let strategy = SlidingWindow::new(execution);
            let window = WindowSpec::new(2, 30).unwrap();
            seed(&store, START + 100, "a").await;
            seed(&store, START + 200, "b").await;

            let outcome = strategy
                .evaluate(&store, &key(), &window, START + 50)
                .await
                .unwrap();
            assert_eq!(outcome, RawOutcome { count: 0, wait_or_ttl: 30_050 }, "{:?}", execution);
            assert_eq!(entries(&store).await, 2);
        }
    }

    #[tokio::test]
    async fn test_failure_before_commit_writes_nothing() {
        // Watch, two reads, then the commit.
        for round_trips in 0..4 {
            let (store, _clock) = setup();
            let strategy = SlidingWindow::new(Execution::Transactional);
            let window = WindowSpec::new(3, 30).unwrap();

            store.fail_after(round_trips);
            let result = strategy.evaluate(&store, &key(), &window, START).await;
            assert!(matches!(result, Err(StoreError::Unavailable(_))), "after {}", round_trips);

            store.set_available(true);
            assert_eq!(entries(&store).await, 0, "after {}", round_trips);
        }
    }
}
