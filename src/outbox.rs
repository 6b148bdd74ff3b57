//! Durable FIFO outbox with retry scheduling and dead-lettering. `Outbox<T>`
//! is generic over the payload so the same queue mechanics back both the
//! delta push path and the action channel (aliased below as
//! `QueueEntry`/`ActionQueueEntry`).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use tracing::warn;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::message::{Action, RowDelta};

const RETRY_BASE_MS: i64 = 1000;
const RETRY_CAP_MS: i64 = 30_000;
/// Hard upper bound on `peek`'s limit parameter: an unbounded caller-supplied
/// limit could otherwise try to materialise the entire backlog in memory.
pub const MAX_PEEK_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Sending,
}

impl EntryStatus {
    fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Sending => "sending",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "sending" => Some(EntryStatus::Sending),
            _ => None,
        }
    }
}

/// One queued item. Generic over the payload type `T` (a `RowDelta` or an
/// `Action`).
#[derive(Debug, Clone)]
pub struct OutboxEntry<T> {
    pub id: String,
    pub item: T,
    pub status: EntryStatus,
    pub created_at: i64,
    pub retry_count: u32,
    pub retry_after: Option<i64>,
}

pub type QueueEntry = OutboxEntry<RowDelta>;
pub type ActionQueueEntry = OutboxEntry<Action>;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Backoff for the nth nack: base * 2^n capped at `RETRY_CAP_MS`.
pub fn backoff_delay_ms(retry_count: u32) -> i64 {
    let factor = 1i64.checked_shl(retry_count).unwrap_or(i64::MAX);
    RETRY_BASE_MS.saturating_mul(factor).min(RETRY_CAP_MS)
}

/// Storage contract an outbox delegates to. Implementations choose their own
/// persistence; the volatile in-memory backend and the rusqlite-backed
/// backend below both satisfy it.
#[async_trait]
pub trait OutboxBackend<T>: Send + Sync
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    async fn push(&self, item: T) -> SyncResult<String>;
    async fn peek(&self, limit: i64) -> SyncResult<Vec<OutboxEntry<T>>>;
    async fn mark_sending(&self, ids: &[String]) -> SyncResult<()>;
    async fn ack(&self, ids: &[String]) -> SyncResult<()>;
    async fn nack(&self, ids: &[String]) -> SyncResult<()>;
    async fn depth(&self) -> SyncResult<i64>;
    async fn clear(&self) -> SyncResult<()>;
}

/// Thin facade over a backend: push/peek/mark_sending/ack/nack.
pub struct Outbox<T>
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    backend: Box<dyn OutboxBackend<T>>,
}

impl<T> Outbox<T>
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn new(backend: Box<dyn OutboxBackend<T>>) -> Self {
        Self { backend }
    }

    pub async fn push(&self, item: T) -> SyncResult<String> {
        self.backend.push(item).await
    }

    pub async fn peek(&self, limit: i64) -> SyncResult<Vec<OutboxEntry<T>>> {
        let clamped = limit.clamp(0, MAX_PEEK_LIMIT);
        if clamped < limit {
            warn!(requested = limit, clamped, "peek limit clamped");
        }
        self.backend.peek(clamped).await
    }

    pub async fn mark_sending(&self, ids: &[String]) -> SyncResult<()> {
        self.backend.mark_sending(ids).await
    }

    pub async fn ack(&self, ids: &[String]) -> SyncResult<()> {
        self.backend.ack(ids).await
    }

    pub async fn nack(&self, ids: &[String]) -> SyncResult<()> {
        self.backend.nack(ids).await
    }

    pub async fn depth(&self) -> SyncResult<i64> {
        self.backend.depth().await
    }

    pub async fn clear(&self) -> SyncResult<()> {
        self.backend.clear().await
    }
}

// ---------------------------------------------------------------------
// Volatile in-memory backend, for tests and ephemeral clients.
// ---------------------------------------------------------------------

struct MemoryEntry<T> {
    item: T,
    status: EntryStatus,
    created_at: i64,
    retry_count: u32,
    retry_after: Option<i64>,
}

pub struct MemoryOutboxBackend<T> {
    entries: AsyncMutex<BTreeMap<String, MemoryEntry<T>>>,
}

impl<T> MemoryOutboxBackend<T> {
    pub fn new() -> Self {
        Self {
            entries: AsyncMutex::new(BTreeMap::new()),
        }
    }
}

impl<T> Default for MemoryOutboxBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> OutboxBackend<T> for MemoryOutboxBackend<T>
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    async fn push(&self, item: T) -> SyncResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().await;
        entries.insert(
            id.clone(),
            MemoryEntry {
                item,
                status: EntryStatus::Pending,
                created_at: now_ms(),
                retry_count: 0,
                retry_after: None,
            },
        );
        Ok(id)
    }

    async fn peek(&self, limit: i64) -> SyncResult<Vec<OutboxEntry<T>>> {
        let entries = self.entries.lock().await;
        let now = now_ms();
        let mut visible: Vec<(&String, &MemoryEntry<T>)> = entries
            .iter()
            .filter(|(_, e)| {
                e.status == EntryStatus::Pending
                    && e.retry_after.map(|ra| ra <= now).unwrap_or(true)
            })
            .collect();
        visible.sort_by_key(|(_, e)| e.created_at);
        Ok(visible
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(id, e)| OutboxEntry {
                id: id.clone(),
                item: e.item.clone(),
                status: e.status,
                created_at: e.created_at,
                retry_count: e.retry_count,
                retry_after: e.retry_after,
            })
            .collect())
    }

    async fn mark_sending(&self, ids: &[String]) -> SyncResult<()> {
        let mut entries = self.entries.lock().await;
        for id in ids {
            if let Some(e) = entries.get_mut(id) {
                if e.status == EntryStatus::Pending {
                    e.status = EntryStatus::Sending;
                }
            }
        }
        Ok(())
    }

    async fn ack(&self, ids: &[String]) -> SyncResult<()> {
        let mut entries = self.entries.lock().await;
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn nack(&self, ids: &[String]) -> SyncResult<()> {
        let mut entries = self.entries.lock().await;
        let now = now_ms();
        for id in ids {
            if let Some(e) = entries.get_mut(id) {
                e.status = EntryStatus::Pending;
                e.retry_count += 1;
                e.retry_after = Some(now + backoff_delay_ms(e.retry_count));
            }
        }
        Ok(())
    }

    async fn depth(&self) -> SyncResult<i64> {
        let entries = self.entries.lock().await;
        Ok(entries
            .values()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::Sending))
            .count() as i64)
    }

    async fn clear(&self) -> SyncResult<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------
// SQLite-backed durable backend: rusqlite calls bracketed in
// spawn_blocking, async/await at the call boundary.
// ---------------------------------------------------------------------

use std::sync::Arc;

pub struct SqliteOutboxBackend<T> {
    conn: Arc<AsyncMutex<Connection>>,
    table: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<T> SqliteOutboxBackend<T>
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    /// `table` must be a fixed, trusted identifier (`"delta_outbox"` or
    /// `"action_outbox"`); it is never derived from user input.
    pub fn new(conn: Arc<AsyncMutex<Connection>>, table: &'static str) -> SyncResult<Self> {
        Ok(Self {
            conn,
            table,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn init_schema_sync(conn: &Connection, table: &str) -> SyncResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                item_json TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending','sending')),
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_after INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, created_at);"
        ))?;
        Ok(())
    }
}

#[async_trait]
impl<T> OutboxBackend<T> for SqliteOutboxBackend<T>
where
    T: Send + Sync + Serialize + DeserializeOwned + Clone + 'static,
{
    async fn push(&self, item: T) -> SyncResult<String> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let id = Uuid::new_v4().to_string();
        let item_json = serde_json::to_string(&item)?;
        let created_at = now_ms();
        let id_for_task = id.clone();
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            guard.execute(
                &format!(
                    "INSERT INTO {table} (id, item_json, status, created_at, retry_count, retry_after)
                     VALUES (?1, ?2, 'pending', ?3, 0, NULL)"
                ),
                params![id_for_task, item_json, created_at],
            )?;
            Ok(())
        })
        .await??;
        Ok(id)
    }

    async fn peek(&self, limit: i64) -> SyncResult<Vec<OutboxEntry<T>>> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let now = now_ms();
        task::spawn_blocking(move || -> SyncResult<Vec<OutboxEntry<T>>> {
            let guard = conn.blocking_lock();
            let mut stmt = guard.prepare(&format!(
                "SELECT id, item_json, status, created_at, retry_count, retry_after
                 FROM {table}
                 WHERE status = 'pending' AND (retry_after IS NULL OR retry_after <= ?1)
                 ORDER BY created_at ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now, limit], |row| {
                let item_json: String = row.get(1)?;
                let status_str: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    item_json,
                    status_str,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, item_json, status_str, created_at, retry_count, retry_after) = row?;
                let item: T = serde_json::from_str(&item_json)?;
                let status = EntryStatus::parse(&status_str)
                    .ok_or_else(|| SyncError::Queue(format!("bad status {status_str}").into()))?;
                out.push(OutboxEntry {
                    id,
                    item,
                    status,
                    created_at,
                    retry_count: retry_count as u32,
                    retry_after,
                });
            }
            Ok(out)
        })
        .await?
    }

    async fn mark_sending(&self, ids: &[String]) -> SyncResult<()> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let ids = ids.to_vec();
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            for id in ids {
                guard.execute(
                    &format!(
                        "UPDATE {table} SET status = 'sending' WHERE id = ?1 AND status = 'pending'"
                    ),
                    params![id],
                )?;
            }
            Ok(())
        })
        .await?
    }

    async fn ack(&self, ids: &[String]) -> SyncResult<()> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let ids = ids.to_vec();
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            for id in ids {
                guard.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
            }
            Ok(())
        })
        .await?
    }

    async fn nack(&self, ids: &[String]) -> SyncResult<()> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let ids = ids.to_vec();
        let now = now_ms();
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            for id in &ids {
                let retry_count: Option<i64> = guard
                    .query_row(
                        &format!("SELECT retry_count FROM {table} WHERE id = ?1"),
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(retry_count) = retry_count else {
                    continue;
                };
                let new_retry_count = retry_count + 1;
                let retry_after = now + backoff_delay_ms(new_retry_count as u32);
                guard.execute(
                    &format!(
                        "UPDATE {table} SET status = 'pending', retry_count = ?1, retry_after = ?2
                         WHERE id = ?3"
                    ),
                    params![new_retry_count, retry_after, id],
                )?;
            }
            Ok(())
        })
        .await?
    }

    async fn depth(&self) -> SyncResult<i64> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        task::spawn_blocking(move || -> SyncResult<i64> {
            let guard = conn.blocking_lock();
            let count: i64 = guard.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {table} WHERE status IN ('pending', 'sending')"
                ),
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await?
    }

    async fn clear(&self) -> SyncResult<()> {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            guard.execute(&format!("DELETE FROM {table}"), [])?;
            Ok(())
        })
        .await?
    }
}
