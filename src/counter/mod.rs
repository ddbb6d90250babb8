//! Single-row persisted counter behind `/api/count`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Row id used by the counter API.
pub const COUNTER_ID: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub id: i64,
    pub count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Counter {
    pub fn new(id: i64, count: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            count,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Counter>>;
    async fn insert(&self, counter: &Counter) -> Result<()>;
    async fn update(&self, counter: &Counter) -> Result<()>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Creates the row with count 1 or increments it, atomically.
    async fn increment(&self, id: i64) -> Result<Counter>;
}

#[derive(Clone)]
pub struct SqliteCounterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCounterStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open counter database {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS counters (
                id         INTEGER PRIMARY KEY,
                count      INTEGER NOT NULL DEFAULT 1 CHECK (count >= 0),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_db_path(data_dir: &Path) -> PathBuf {
        data_dir.join("wxrelay.db")
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .context("counter store task panicked")?
    }
}

fn unix_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn row_to_counter(row: &Row<'_>) -> rusqlite::Result<Counter> {
    Ok(Counter {
        id: row.get(0)?,
        count: row.get(1)?,
        created_at: unix_to_utc(row.get(2)?),
        updated_at: unix_to_utc(row.get(3)?),
    })
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn get(&self, id: i64) -> Result<Option<Counter>> {
        self.with_conn(move |conn| {
            let counter = conn
                .query_row(
                    "SELECT id, count, created_at, updated_at FROM counters WHERE id = ?1",
                    params![id],
                    row_to_counter,
                )
                .optional()?;
            Ok(counter)
        })
        .await
    }

    async fn insert(&self, counter: &Counter) -> Result<()> {
        let counter = counter.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO counters(id, count, created_at, updated_at) VALUES(?1, ?2, ?3, ?4)",
                params![
                    counter.id,
                    counter.count,
                    counter.created_at.timestamp(),
                    counter.updated_at.timestamp()
                ],
            )
            .with_context(|| format!("failed to insert counter id={}", counter.id))?;
            Ok(())
        })
        .await
    }

    async fn update(&self, counter: &Counter) -> Result<()> {
        let counter = counter.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE counters SET count = ?2, updated_at = ?3 WHERE id = ?1",
                params![counter.id, counter.count, counter.updated_at.timestamp()],
            )?;
            if changed == 0 {
                anyhow::bail!("counter id={} does not exist", counter.id);
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM counters WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn increment(&self, id: i64) -> Result<Counter> {
        let now = Utc::now().timestamp();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let counter = tx.query_row(
                "INSERT INTO counters(id, count, created_at, updated_at) VALUES(?1, 1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
                 RETURNING id, count, created_at, updated_at",
                params![id, now],
                row_to_counter,
            )?;
            tx.commit()?;
            Ok(counter)
        })
        .await
    }
}
