use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Batch, Command, KvStore};
use crate::error::{Error, Result};

/// In-process store. Every operation runs under one lock, so batches are
/// trivially atomic. Suitable for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
}

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::store("memory store lock poisoned"))
    }
}

impl State {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Set { key, value } => {
                self.strings.insert(
                    key,
                    StringEntry {
                        value,
                        expires_at: None,
                    },
                );
            }
            Command::Del { key } => {
                self.strings.remove(&key);
                self.hashes.remove(&key);
                self.lists.remove(&key);
                self.sets.remove(&key);
            }
            Command::HSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            Command::HDel { key, fields } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    for field in &fields {
                        hash.remove(field);
                    }
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            Command::RPush { key, member } => {
                self.lists.entry(key).or_default().push_back(member);
            }
            Command::LPush { key, member } => {
                self.lists.entry(key).or_default().push_front(member);
            }
            Command::LRem { key, member } => {
                if let Some(list) = self.lists.get_mut(&key) {
                    list.retain(|m| *m != member);
                }
            }
            Command::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            Command::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state
            .strings
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock()?;
        if state.strings.get(key).is_some_and(StringEntry::is_live) {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        Ok(state.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn exec(&self, batch: Batch) -> Result<()> {
        let mut state = self.lock()?;
        for command in batch.into_commands() {
            state.apply(command);
        }
        Ok(())
    }
}
