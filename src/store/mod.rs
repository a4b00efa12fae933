//! Shared key-value store adapter.
//!
//! The limiting algorithms only need a small surface from the store: a handful
//! of primitive commands, atomic multi-command execution, and server-side
//! script evaluation addressed by content hash. [`Store`] captures exactly that
//! surface so the algorithms can run against Redis or the in-process
//! [`MemoryStore`].

mod memory;
mod redis;
mod script;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreSettings};
use crate::ratelimit::Clock;

pub use self::memory::{Keyspace, MemoryStore, ScriptFn};
pub use self::redis::RedisStore;
pub use script::LuaScript;

/// Errors raised by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// A script failed to load or evaluate.
    #[error("Script error: {0}")]
    Script(String),
    /// Evaluation by hash missed the server-side script cache.
    #[error("No script loaded for hash {0}")]
    NoScript(String),
    /// A command was rejected by the store.
    #[error("Command error: {0}")]
    Command(String),
    /// The store answered with a reply of an unexpected shape.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
    /// A watched key kept changing and the transaction was never committed.
    #[error("Transaction contended: {0}")]
    Contended(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A primitive store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `SET key value EX seconds`
    SetEx {
        key: String,
        value: String,
        seconds: u64,
    },
    /// `RENAMENX from to`
    RenameNx { from: String, to: String },
    /// `INCR key`
    Incr { key: String },
    /// `PTTL key`
    Pttl { key: String },
    /// `EXPIRE key seconds`
    Expire { key: String, seconds: u64 },
    /// `DEL key`
    Del { key: String },
    /// `ZADD key score member`
    ZAdd {
        key: String,
        score: u64,
        member: String,
    },
    /// `ZCOUNT key min max`
    ZCount { key: String, min: i64, max: i64 },
    /// `ZREVRANGE key start stop WITHSCORES`
    ZRevRangeWithScores { key: String, start: i64, stop: i64 },
}

/// A reply from the store, reduced to the shapes the algorithms consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Double(f64),
    Data(String),
    Status(String),
    Array(Vec<Reply>),
}

impl Reply {
    /// Interpret the reply as an integer.
    pub fn as_i64(&self) -> StoreResult<i64> {
        match self {
            Reply::Int(value) => Ok(*value),
            Reply::Data(text) => text
                .parse()
                .map_err(|_| StoreError::MalformedReply(format!("not an integer: {text}"))),
            other => Err(StoreError::MalformedReply(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    /// Interpret the reply as a floating point score.
    pub fn as_f64(&self) -> StoreResult<f64> {
        match self {
            Reply::Int(value) => Ok(*value as f64),
            Reply::Double(value) => Ok(*value),
            Reply::Data(text) => text
                .parse()
                .map_err(|_| StoreError::MalformedReply(format!("not a number: {text}"))),
            other => Err(StoreError::MalformedReply(format!(
                "expected number, got {other:?}"
            ))),
        }
    }

    /// Take the elements of an array reply.
    pub fn into_array(self) -> StoreResult<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(StoreError::MalformedReply(format!(
                "expected array, got {other:?}"
            ))),
        }
    }

    /// Take the elements of an array reply, flattening one level of nesting.
    ///
    /// RESP3 servers return `WITHSCORES` results as `[[member, score], ...]`
    /// while RESP2 returns `[member, score, ...]`.
    pub fn into_flat_array(self) -> StoreResult<Vec<Reply>> {
        let mut flat = Vec::new();
        for item in self.into_array()? {
            match item {
                Reply::Array(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        Ok(flat)
    }
}

/// Replies of a committed [`Store::watched`] transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedReplies {
    /// Replies to the reads issued while the watch was held.
    pub reads: Vec<Reply>,
    /// Replies to the committed commands.
    pub writes: Vec<Reply>,
}

/// The contract the limiting algorithms depend on.
///
/// Every method except [`Store::watched`] is one round trip. [`Store::atomic`]
/// must apply the whole sequence as one indivisible unit with respect to other
/// clients, and [`Store::eval_sha`] must run the script atomically.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a single command.
    async fn execute(&self, command: Command) -> StoreResult<Reply>;

    /// Run a sequence of commands as one transaction, returning one reply per command.
    async fn atomic(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    /// Check whether a script with the given hash is in the server cache.
    async fn script_exists(&self, hash: &str) -> StoreResult<bool>;

    /// Load a script body into the server cache, returning its hash.
    async fn script_load(&self, body: &str) -> StoreResult<String>;

    /// Evaluate a cached script by hash.
    ///
    /// Fails with [`StoreError::NoScript`] when the hash is not cached.
    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> StoreResult<Reply>;

    /// Optimistic transaction on one key: `WATCH key`, the reads, then
    /// `MULTI`, the commands `plan` derives from the read replies, `EXEC`.
    ///
    /// Returns `None` when another client modified `key` after the watch was
    /// set; nothing is written in that case. Nothing is written either when a
    /// read, the plan or the connection fails before `EXEC`.
    async fn watched(
        &self,
        key: &str,
        reads: Vec<Command>,
        plan: &(dyn for<'r> Fn(&'r [Reply]) -> StoreResult<Vec<Command>> + Sync),
    ) -> StoreResult<Option<WatchedReplies>>;
}

/// Build the store described by the settings.
pub async fn connect(settings: &StoreSettings, clock: Arc<dyn Clock>) -> StoreResult<Arc<dyn Store>> {
    match settings.backend {
        StoreBackend::Redis => {
            let timeout = Duration::from_millis(settings.response_timeout_ms);
            let store = RedisStore::connect(&settings.url, timeout).await?;
            info!(url = %settings.url, "Connected to Redis store");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("Using in-process memory store");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}
