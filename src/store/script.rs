//! Server-side script handle with a local hash cache.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::{Reply, Store, StoreError, StoreResult};

/// A Lua script addressed by its SHA1 content hash.
///
/// Evaluation goes by hash only. The first call checks the server cache and
/// loads the body if it is missing; after that the local `loaded` flag skips
/// the check until an evaluation reports that the server lost the script.
#[derive(Debug)]
pub struct LuaScript {
    body: &'static str,
    hash: String,
    loaded: AtomicBool,
}

impl LuaScript {
    pub fn new(body: &'static str) -> Self {
        Self {
            body,
            hash: ::redis::Script::new(body).get_hash().to_string(),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Make sure the server has the script cached. Idempotent.
    pub async fn ensure_loaded(&self, store: &dyn Store) -> StoreResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        if !store.script_exists(&self.hash).await? {
            self.load(store).await?;
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Evaluate the script by hash, reloading it once if the server cache missed.
    pub async fn invoke(&self, store: &dyn Store, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        self.ensure_loaded(store).await?;

        match store.eval_sha(&self.hash, keys, args).await {
            Err(StoreError::NoScript(_)) => {
                debug!(hash = %self.hash, "Script missing from server cache, reloading");
                self.loaded.store(false, Ordering::Release);
                self.load(store).await?;
                self.loaded.store(true, Ordering::Release);
                store.eval_sha(&self.hash, keys, args).await
            }
            result => result,
        }
    }

    async fn load(&self, store: &dyn Store) -> StoreResult<()> {
        let hash = store.script_load(self.body).await?;
        if hash != self.hash {
            return Err(StoreError::Script(format!(
                "server returned hash {hash}, expected {}",
                self.hash
            )));
        }
        debug!(hash = %hash, "Script loaded");
        Ok(())
    }
}
