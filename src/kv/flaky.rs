use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Batch, Command, KvStore, MemoryStore};
use crate::error::{Error, Result};

/// Fails the next `failures` batches that contain a matching command.
pub struct FlakyStore {
    inner: MemoryStore,
    fails_on: fn(&Command) -> bool,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(fails_on: fn(&Command) -> bool, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            fails_on,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.inner.lpop(key).await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.inner.lrange(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn exec(&self, batch: Batch) -> Result<()> {
        let matches = batch.commands().iter().any(self.fails_on);
        if matches
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::store("connection reset"));
        }
        self.inner.exec(batch).await
    }
}
