//! Redis implementation of the store adapter.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Cmd, ErrorKind, RedisError, Value};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Command, Reply, Store, StoreError, StoreResult, WatchedReplies};

/// A store backed by a Redis server.
///
/// Uses a multiplexed [`ConnectionManager`] that reconnects on its own; cloning
/// it per call is cheap and lets concurrent hits share one socket. Watched
/// transactions open a connection of their own, since `WATCH` state belongs to
/// the connection and must not leak into other callers' commands.
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    manager: ConnectionManager,
    response_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    ///
    /// `response_timeout` bounds the initial connection and every later round trip.
    pub async fn connect(url: &str, response_timeout: Duration) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis url {url}: {e}")))?;
        let manager = with_timeout(response_timeout, client.get_connection_manager()).await?;

        Ok(Self {
            client,
            manager,
            response_timeout,
        })
    }

    async fn query(&self, cmd: &Cmd) -> StoreResult<Value> {
        let mut conn = self.manager.clone();
        with_timeout(self.response_timeout, cmd.query_async(&mut conn)).await
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn execute(&self, command: Command) -> StoreResult<Reply> {
        let value = self.query(&to_cmd(&command)).await?;
        to_reply(value)
    }

    async fn atomic(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }

        let mut conn = self.manager.clone();
        let value: Value = with_timeout(self.response_timeout, pipe.query_async(&mut conn)).await?;

        let replies = match to_reply(value)? {
            Reply::Array(replies) => replies,
            Reply::Nil => {
                return Err(StoreError::Command("transaction was aborted".to_string()));
            }
            other => {
                return Err(StoreError::MalformedReply(format!(
                    "expected transaction results, got {other:?}"
                )));
            }
        };

        if replies.len() != commands.len() {
            return Err(StoreError::MalformedReply(format!(
                "expected {} transaction results, got {}",
                commands.len(),
                replies.len()
            )));
        }
        Ok(replies)
    }

    async fn script_exists(&self, hash: &str) -> StoreResult<bool> {
        let mut cmd = ::redis::cmd("SCRIPT");
        cmd.arg("EXISTS").arg(hash);

        let flags = to_reply(self.query(&cmd).await?)?.into_array()?;
        match flags.first() {
            Some(flag) => Ok(flag.as_i64()? == 1),
            None => Err(StoreError::MalformedReply("empty SCRIPT EXISTS reply".to_string())),
        }
    }

    async fn script_load(&self, body: &str) -> StoreResult<String> {
        let mut cmd = ::redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(body);

        let value = self.query(&cmd).await.map_err(into_script_error)?;
        match to_reply(value)? {
            Reply::Data(hash) | Reply::Status(hash) => {
                debug!(hash = %hash, "Loaded script into Redis");
                Ok(hash)
            }
            other => Err(StoreError::MalformedReply(format!(
                "expected script hash, got {other:?}"
            ))),
        }
    }

    async fn eval_sha(&self, hash: &str, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let mut cmd = ::redis::cmd("EVALSHA");
        cmd.arg(hash).arg(keys.len()).arg(keys).arg(args);

        let value = self.query(&cmd).await.map_err(into_script_error)?;
        to_reply(value)
    }

    async fn watched(
        &self,
        key: &str,
        reads: Vec<Command>,
        plan: &(dyn for<'r> Fn(&'r [Reply]) -> StoreResult<Vec<Command>> + Sync),
    ) -> StoreResult<Option<WatchedReplies>> {
        let timeout = self.response_timeout;
        let mut conn = with_timeout(timeout, self.client.get_multiplexed_async_connection()).await?;

        let mut watch = ::redis::cmd("WATCH");
        watch.arg(key);
        let _: Value = with_timeout(timeout, watch.query_async(&mut conn)).await?;

        let mut read_replies = Vec::with_capacity(reads.len());
        for command in &reads {
            let cmd = to_cmd(command);
            let value: Value = with_timeout(timeout, cmd.query_async(&mut conn)).await?;
            read_replies.push(to_reply(value)?);
        }

        // Any error above drops the connection, and the watch with it.
        let commands = plan(&read_replies)?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }
        let value: Value = with_timeout(timeout, pipe.query_async(&mut conn)).await?;

        match to_reply(value)? {
            Reply::Nil => {
                debug!(key = %key, "Watched key changed, transaction discarded");
                Ok(None)
            }
            Reply::Array(writes) if writes.len() == commands.len() => Ok(Some(WatchedReplies {
                reads: read_replies,
                writes,
            })),
            other => Err(StoreError::MalformedReply(format!(
                "expected {} transaction results, got {other:?}",
                commands.len()
            ))),
        }
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Redis round trip timed out");
            Err(StoreError::Unavailable(format!(
                "no response within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::NoScriptError {
            StoreError::NoScript(err.to_string())
        } else if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Command failures while loading or running a script are script errors.
fn into_script_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Command(message) => StoreError::Script(message),
        other => other,
    }
}

fn to_cmd(command: &Command) -> Cmd {
    match command {
        Command::SetEx { key, value, seconds } => {
            let mut cmd = ::redis::cmd("SET");
            cmd.arg(key).arg(value).arg("EX").arg(*seconds);
            cmd
        }
        Command::RenameNx { from, to } => {
            let mut cmd = ::redis::cmd("RENAMENX");
            cmd.arg(from).arg(to);
            cmd
        }
        Command::Incr { key } => {
            let mut cmd = ::redis::cmd("INCR");
            cmd.arg(key);
            cmd
        }
        Command::Pttl { key } => {
            let mut cmd = ::redis::cmd("PTTL");
            cmd.arg(key);
            cmd
        }
        Command::Expire { key, seconds } => {
            let mut cmd = ::redis::cmd("EXPIRE");
            cmd.arg(key).arg(*seconds);
            cmd
        }
        Command::Del { key } => {
            let mut cmd = ::redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        Command::ZAdd { key, score, member } => {
            let mut cmd = ::redis::cmd("ZADD");
            cmd.arg(key).arg(*score).arg(member);
            cmd
        }
        Command::ZCount { key, min, max } => {
            let mut cmd = ::redis::cmd("ZCOUNT");
            cmd.arg(key).arg(*min).arg(*max);
            cmd
        }
        Command::ZRevRangeWithScores { key, start, stop } => {
            let mut cmd = ::redis::cmd("ZREVRANGE");
            cmd.arg(key).arg(*start).arg(*stop).arg("WITHSCORES");
            cmd
        }
    }
}

fn to_reply(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Int(value) => Ok(Reply::Int(value)),
        Value::Double(value) => Ok(Reply::Double(value)),
        Value::BulkString(bytes) => Ok(Reply::Data(String::from_utf8_lossy(&bytes).into_owned())),
        Value::SimpleString(status) => Ok(Reply::Status(status)),
        Value::Okay => Ok(Reply::Status("OK".to_string())),
        Value::Array(items) | Value::Set(items) => items
            .into_iter()
            .map(to_reply)
            .collect::<StoreResult<Vec<_>>>()
            .map(Reply::Array),
        other => Err(StoreError::MalformedReply(format!("unsupported reply {other:?}"))),
    }
}
