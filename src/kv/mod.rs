//! Key-value primitives backing the project keyspace.
//!
//! The store exposes the handful of operations the project state machine
//! needs: strings (with a set-if-absent guard), field maps, a FIFO list and an
//! unordered set. Multi-key mutations are grouped into a [`Batch`] that a
//! backend applies atomically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[cfg(test)]
mod flaky;
mod memory;
mod postgres;

#[cfg(test)]
pub(crate) use flaky::FlakyStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    HDel { key: String, fields: Vec<String> },
    RPush { key: String, member: String },
    LPush { key: String, member: String },
    LRem { key: String, member: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

/// An ordered group of mutations applied all-or-nothing.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hdel(mut self, key: impl Into<String>, fields: &[&str]) -> Self {
        self.commands.push(Command::HDel {
            key: key.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn rpush(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::RPush {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn lpush(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::LPush {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    /// Removes every occurrence of `member` from the list.
    pub fn lrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::LRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Returns an empty map when the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Sets `key` only if it is absent (or its previous value expired).
    /// Returns whether this call acquired the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically removes and returns the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn exec(&self, batch: Batch) -> Result<()>;
}
