use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};
use tracing::debug;

use super::{Batch, Command, KvStore};
use crate::error::Result;

/// PostgreSQL-backed keyspace.
///
/// Lists are rows ordered by a sequence; `lpop` deletes the lowest row with
/// `FOR UPDATE SKIP LOCKED`, so concurrent poppers never receive the same
/// member, across processes included.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgStore {
            pool: Arc::new(pool),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply(tx: &mut Transaction<'_, Postgres>, command: Command) -> Result<()> {
    match command {
        Command::Set { key, value } => {
            sqlx::query(
                "INSERT INTO kv_string (key, value, expires_at) VALUES ($1, $2, NULL) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = NULL",
            )
            .bind(&key)
            .bind(&value)
            .execute(&mut **tx)
            .await?;
        }
        Command::Del { key } => {
            for table in ["kv_string", "kv_hash", "kv_list", "kv_set"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE key = $1"))
                    .bind(&key)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Command::HSet { key, fields } => {
            for (field, value) in fields {
                sqlx::query(
                    "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3) \
                     ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(&key)
                .bind(&field)
                .bind(&value)
                .execute(&mut **tx)
                .await?;
            }
        }
        Command::HDel { key, fields } => {
            sqlx::query("DELETE FROM kv_hash WHERE key = $1 AND field = ANY($2)")
                .bind(&key)
                .bind(fields)
                .execute(&mut **tx)
                .await?;
        }
        Command::RPush { key, member } => {
            sqlx::query("INSERT INTO kv_list (key, member) VALUES ($1, $2)")
                .bind(&key)
                .bind(&member)
                .execute(&mut **tx)
                .await?;
        }
        Command::LPush { key, member } => {
            // ids below the current head; the sequence only hands out positive ones
            sqlx::query(
                "INSERT INTO kv_list (id, key, member) \
                 SELECT LEAST(COALESCE(MIN(id), 0), 0) - 1, $1, $2 FROM kv_list",
            )
            .bind(&key)
            .bind(&member)
            .execute(&mut **tx)
            .await?;
        }
        Command::LRem { key, member } => {
            sqlx::query("DELETE FROM kv_list WHERE key = $1 AND member = $2")
                .bind(&key)
                .bind(&member)
                .execute(&mut **tx)
                .await?;
        }
        Command::SAdd { key, member } => {
            sqlx::query(
                "INSERT INTO kv_set (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(&key)
            .bind(&member)
            .execute(&mut **tx)
            .await?;
        }
        Command::SRem { key, member } => {
            sqlx::query("DELETE FROM kv_set WHERE key = $1 AND member = $2")
                .bind(&key)
                .bind(&member)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT value FROM kv_string \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM kv_hash WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .fetch_optional(&*self.pool)
                .await?,
        )
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT field, value FROM kv_hash WHERE key = $1")
                .bind(key)
                .fetch_all(&*self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // An expired holder is overwritten in place; a live one leaves the row untouched.
        let acquired: Option<String> = sqlx::query_scalar(
            "INSERT INTO kv_string (key, value, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at \
             WHERE kv_string.expires_at IS NOT NULL AND kv_string.expires_at <= now() \
             RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await?;
        debug!(key, acquired = acquired.is_some(), "set_nx");
        Ok(acquired.is_some())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            "DELETE FROM kv_list WHERE id = ( \
                SELECT id FROM kv_list WHERE key = $1 \
                ORDER BY id LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
             ) RETURNING member",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT member FROM kv_list WHERE key = $1 ORDER BY id")
                .bind(key)
                .fetch_all(&*self.pool)
                .await?,
        )
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT member FROM kv_set WHERE key = $1")
            .bind(key)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn exec(&self, batch: Batch) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for command in batch.into_commands() {
            apply(&mut tx, command).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
