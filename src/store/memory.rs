//! In-process store with Redis command semantics.
//!
//! The whole keyspace sits behind one mutex, so every command, transaction and
//! script runs to completion before the next one starts. Watched transactions
//! release it between their reads and their commit, and are checked against
//! per-key write versions the way `WATCH` is. Keys expire lazily on
//! access against the configured [`Clock`], which lets tests move time forward
//! deterministically.
//!
//! Lua is not interpreted. Scripts are evaluated through native emulations
//! registered under the hash of their body; the crate's own window scripts are
//! registered by [`MemoryStore::new`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Command, Reply, Store, StoreError, StoreResult, WatchedReplies};
use crate::ratelimit::{Clock, FIXED_WINDOW_SCRIPT, SLIDING_WINDOW_SCRIPT};

/// Native stand-in for a Lua script: `(keyspace, KEYS, ARGV) -> reply`.
pub type ScriptFn = fn(&mut Keyspace, &[String], &[String]) -> StoreResult<Reply>;

/// Runs against the keyspace right before a watched transaction commits, as
/// another client would.
type CommitHook = Box<dyn FnOnce(&mut Keyspace) + Send>;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// Members ordered by `(score, member)` ascending.
    ZSet(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiry in epoch milliseconds.
    expires_at: Option<u64>,
}

/// The keyspace of a [`MemoryStore`], exposed to script emulations.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    /// Bumped on every write to a key; `WATCH` compares against it.
    versions: HashMap<String, u64>,
    now_ms: u64,
}

impl Keyspace {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= self.now_ms
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Apply one command with Redis semantics.
    pub fn apply(&mut self, command: Command) -> StoreResult<Reply> {
        let written = match &command {
            Command::SetEx { key, .. }
            | Command::Incr { key }
            | Command::Expire { key, .. }
            | Command::Del { key }
            | Command::ZAdd { key, .. } => vec![key.clone()],
            Command::RenameNx { from, to } => vec![from.clone(), to.clone()],
            Command::Pttl { .. } | Command::ZCount { .. } | Command::ZRevRangeWithScores { .. } => Vec::new(),
        };

        let reply = self.run(command)?;
        for key in written {
            *self.versions.entry(key).or_insert(0) += 1;
        }
        Ok(reply)
    }

    fn expiry_after(&self, seconds: u64) -> u64 {
        self.now_ms.saturating_add(seconds.saturating_mul(1000))
    }

    fn run(&mut self, command: Command) -> StoreResult<Reply> {
        match command {
            Command::SetEx { key, value, seconds } => {
                let expires_at = Some(self.expiry_after(seconds));
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at,
                    },
                );
                Ok(Reply::Status("OK".to_string()))
            }
            Command::RenameNx { from, to } => {
                if !self.exists(&from) {
                    return Err(StoreError::Command("ERR no such key".to_string()));
                }
                if self.exists(&to) {
                    return Ok(Reply::Int(0));
                }
                if let Some(entry) = self.entries.remove(&from) {
                    self.entries.insert(to, entry);
                }
                Ok(Reply::Int(1))
            }
            Command::Incr { key } => {
                if !self.exists(&key) {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Str("0".to_string()),
                            expires_at: None,
                        },
                    );
                }
                let Some(Entry { value: Value::Str(text), .. }) = self.entries.get_mut(&key) else {
                    return Err(wrong_type());
                };
                let current: i64 = text.parse().map_err(|_| {
                    StoreError::Command("ERR value is not an integer or out of range".to_string())
                })?;
                let next = current + 1;
                *text = next.to_string();
                Ok(Reply::Int(next))
            }
            Command::Pttl { key } => {
                let now = self.now_ms;
                let ttl = match self.live(&key) {
                    None => -2,
                    Some(Entry { expires_at: None, .. }) => -1,
                    Some(Entry { expires_at: Some(at), .. }) => (*at - now) as i64,
                };
                Ok(Reply::Int(ttl))
            }
            Command::Expire { key, seconds } => {
                let expires_at = self.expiry_after(seconds);
                match self.live(&key) {
                    Some(entry) => {
                        entry.expires_at = Some(expires_at);
                        Ok(Reply::Int(1))
                    }
                    None => Ok(Reply::Int(0)),
                }
            }
            Command::Del { key } => {
                let existed = self.exists(&key);
                self.entries.remove(&key);
                Ok(Reply::Int(existed as i64))
            }
            Command::ZAdd { key, score, member } => {
                if !self.exists(&key) {
                    self.entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::ZSet(Vec::new()),
                            expires_at: None,
                        },
                    );
                }
                let Some(Entry { value: Value::ZSet(set), .. }) = self.entries.get_mut(&key) else {
                    return Err(wrong_type());
                };
                let existing = set.iter().position(|(_, m)| *m == member);
                if let Some(index) = existing {
                    set.remove(index);
                }
                let score = score as f64;
                let at = set.partition_point(|(s, m)| (*s, m.as_str()) < (score, member.as_str()));
                set.insert(at, (score, member));
                Ok(Reply::Int(existing.is_none() as i64))
            }
            Command::ZCount { key, min, max } => {
                let set = match self.zset(&key)? {
                    Some(set) => set,
                    None => return Ok(Reply::Int(0)),
                };
                let count = set
                    .iter()
                    .filter(|(score, _)| *score >= min as f64 && *score <= max as f64)
                    .count();
                Ok(Reply::Int(count as i64))
            }
            Command::ZRevRangeWithScores { key, start, stop } => {
                let set = match self.zset(&key)? {
                    Some(set) => set,
                    None => return Ok(Reply::Array(Vec::new())),
                };
                let len = set.len() as i64;
                let start = if start < 0 { (len + start).max(0) } else { start };
                let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

                let mut items = Vec::new();
                if start <= stop {
                    for (score, member) in set.iter().rev().skip(start as usize).take((stop - start + 1) as usize) {
                        items.push(Reply::Data(member.clone()));
                        items.push(Reply::Data(score.to_string()));
                    }
                }
                Ok(Reply::Array(items))
            }
        }
    }

    fn zset(&mut self, key: &str) -> StoreResult<Option<&Vec<(f64, String)>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::ZSet(set), .. }) => Ok(Some(&*set)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn persist(&mut self, key: &str) -> bool {
        let removed = match self.live(key) {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        };
        if removed {
            *self.versions.entry(key.to_string()).or_insert(0) += 1;
        }
        removed
    }
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

#[derive(Debug, Default)]
struct State {
    keyspace: Keyspace,
    loaded_scripts: HashSet<String>,
}

/// A [`Store`] that keeps its data in the current process.
pub struct MemoryStore {
    state: Mutex<State>,
    emulations: HashMap<String, ScriptFn>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    /// Round trips left before the store goes unavailable.
    fail_after: Mutex<Option<usize>>,
    before_commit: Mutex<Option<CommitHook>>,
    script_loads: AtomicUsize,
    script_exists_checks: AtomicUsize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.state.lock().keyspace.entries.len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store with the window scripts registered.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            emulations: HashMap::new(),
            clock,
            available: AtomicBool::new(true),
            fail_after: Mutex::new(None),
            before_commit: Mutex::new(None),
            script_loads: AtomicUsize::new(0),
            script_exists_checks: AtomicUsize::new(0),
        }
        .with_script(FIXED_WINDOW_SCRIPT, emulate_fixed_window)
        .with_script(SLIDING_WINDOW_SCRIPT, emulate_sliding_window)
    }

    /// Register a native emulation for a script body.
    pub fn with_script(mut self, body: &str, emulation: ScriptFn) -> Self {
        let hash = ::redis::Script::new(body).get_hash().to_string();
        self.emulations.insert(hash, emulation);
        self
    }

    /// Toggle availability; while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        *self.fail_after.lock() = None;
    }

    /// Serve `round_trips` more calls, then fail like [`set_available(false)`](Self::set_available).
    ///
    /// Each read inside [`Store::watched`] and its commit count as separate
    /// round trips.
    pub fn fail_after(&self, round_trips: usize) {
        *self.fail_after.lock() = Some(round_trips);
    }

    /// Run `hook` against the keyspace between the reads and the commit of the
    /// next watched transaction.
    pub fn intercept_next_commit(&self, hook: impl FnOnce(&mut Keyspace) + Send + 'static) {
        *self.before_commit.lock() = Some(Box::new(hook));
    }

    /// Drop every cached script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.state.lock().loaded_scripts.clear();
    }

    /// Remove the expiry of a key, like `PERSIST`. Returns whether an expiry was removed.
    pub fn persist(&self, key: &str) -> bool {
        let mut state = self.lock();
        state.keyspace.persist(key)
    }

    /// Number of `SCRIPT LOAD` calls served.
    pub fn script_loads(&self) -> usize {
        self.script_loads.load(Ordering::SeqCst)
    }

    /// Number of `SCRIPT EXISTS` calls served.
    pub fn script_exists_checks(&self) -> usize {
        self.script_exists_checks.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        let offline = || StoreError::Unavailable("memory store is offline".to_string());
        if !self.available.load(Ordering::SeqCst) {
            return Err(offline());
        }

        let mut budget = self.fail_after.lock();
        match budget.as_mut() {
            Some(0) => {
                self.available.store(false, Ordering::SeqCst);
                Err(offline())
            }
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, State> {
        let mut state = self.state.lock();
        state.keyspace.now_ms = self.clock.now_ms();
        state
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, command: Command) -> StoreResult<Reply> {
        self.check_available()?;
        self.lock().keyspace.apply(command)
    }

    async fn atomic(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        self.check_available()?;
        let mut state = self.lock();
        commands
            .into_iter()
            .map(|command| state.keyspace.apply(command))
            .collect()
    }

    async fn script_exists(&self, hash: &str) -> StoreResult<bool> {
        self.check_available()?;
        self.script_exists_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().loaded_scripts.contains(hash))
    }

    async fn script_load(&self, body: &str) -> StoreResult<String> {
        self.check_available()?;
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        let hash = ::redis::Script::new(body).get_hash().to_string();
        self.state.lock().loaded_scripts.insert(hash.clone());
        Ok(hash)
    }

    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        self.check_available()?;
        let mut state = self.lock();
        if !state.loaded_scripts.contains(hash) {
            return Err(StoreError::NoScript(hash.to_string()));
        }
        let emulation = self
            .emulations
            .get(hash)
            .ok_or_else(|| StoreError::Script(format!("no emulation registered for {hash}")))?;
        emulation(&mut state.keyspace, keys, args)
    }

    async fn watched(
        &self,
        key: &str,
        reads: Vec<Command>,
        plan: &(dyn for<'r> Fn(&'r [Reply]) -> StoreResult<Vec<Command>> + Sync),
    ) -> StoreResult<Option<WatchedReplies>> {
        self.check_available()?;
        let watched_version = self.lock().keyspace.version(key);

        let mut read_replies = Vec::with_capacity(reads.len());
        for command in reads {
            self.check_available()?;
            read_replies.push(self.lock().keyspace.apply(command)?);
        }

        let commands = plan(&read_replies)?;

        let hook = self.before_commit.lock().take();
        if let Some(hook) = hook {
            hook(&mut self.lock().keyspace);
        }

        self.check_available()?;
        let mut state = self.lock();
        if state.keyspace.version(key) != watched_version {
            return Ok(None);
        }
        let writes = commands
            .into_iter()
            .map(|command| state.keyspace.apply(command))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Some(WatchedReplies {
            reads: read_replies,
            writes,
        }))
    }
}

fn script_arg<T: std::str::FromStr>(args: &[String], index: usize) -> StoreResult<T> {
    args.get(index)
        .and_then(|arg| arg.parse().ok())
        .ok_or_else(|| StoreError::Script(format!("bad or missing ARGV[{}]", index + 1)))
}

fn script_key(keys: &[String]) -> StoreResult<String> {
    keys.first()
        .cloned()
        .ok_or_else(|| StoreError::Script("missing KEYS[1]".to_string()))
}

fn emulate_fixed_window(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let key = script_key(keys)?;
    let ttl: u64 = script_arg(args, 0)?;
    let tmp_key = format!("tmp:{key}");

    let r0 = keyspace.apply(Command::SetEx {
        key: tmp_key.clone(),
        value: "0".to_string(),
        seconds: ttl,
    })?;
    let r1 = keyspace.apply(Command::RenameNx {
        from: tmp_key,
        to: key.clone(),
    })?;
    let r2 = keyspace.apply(Command::Incr { key: key.clone() })?;
    let r3 = keyspace.apply(Command::Pttl { key })?;
    Ok(Reply::Array(vec![r0, r1, r2, r3]))
}

fn emulate_sliding_window(keyspace: &mut Keyspace, keys: &[String], args: &[String]) -> StoreResult<Reply> {
    let key = script_key(keys)?;
    let now: i64 = script_arg(args, 0)?;
    let window_seconds: u64 = script_arg(args, 1)?;
    let limit: i64 = script_arg(args, 2)?;
    let member: String = script_arg(args, 3)?;
    let lower = now.saturating_sub((window_seconds as i64).saturating_mul(1000));

    let boundary = keyspace
        .apply(Command::ZRevRangeWithScores {
            key: key.clone(),
            start: limit - 1,
            stop: limit - 1,
        })?
        .into_flat_array()?;
    let count = keyspace
        .apply(Command::ZCount {
            key: key.clone(),
            min: lower,
            max: now,
        })?
        .as_i64()?;

    if let Some(score) = boundary.get(1) {
        let boundary_ts = score.as_f64()? as i64;
        if boundary_ts > lower {
            keyspace.apply(Command::Expire {
                key,
                seconds: window_seconds,
            })?;
            return Ok(Reply::Array(vec![Reply::Int(count), Reply::Int(boundary_ts - lower)]));
        }
    }

    keyspace.apply(Command::ZAdd {
        key: key.clone(),
        score: now as u64,
        member,
    })?;
    keyspace.apply(Command::Expire {
        key,
        seconds: window_seconds,
    })?;
    Ok(Reply::Array(vec![Reply::Int(count + 1), Reply::Int(0)]))
}
