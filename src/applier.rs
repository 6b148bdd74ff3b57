//! Conflict-resolving applier: merges a batch of remote
//! deltas into the local store, deferring to a pluggable [`Resolver`] when a
//! delta conflicts with a pending local outbox entry, and advancing the
//! per-table sync cursor in `_sync_cursor`.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;

use crate::error::SyncResult;
use crate::hlc::HlcTimestamp;
use crate::message::{RowDelta, RowOp};
use crate::outbox::Outbox;
use crate::schema::{quote_identifier, validate_identifier};

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Conflict resolution is a capability, not a base class: any type
/// implementing this one method can replace [`LwwResolver`] without
/// touching the applier.
pub trait Resolver: Send + Sync {
    fn resolve(&self, local: &RowDelta, remote: &RowDelta) -> SyncResult<Winner>;
}

/// Default Last-Writer-Wins resolver: higher `hlc` wins; ties break on
/// lexicographically greater `client_id`.
pub struct LwwResolver;

impl Resolver for LwwResolver {
    fn resolve(&self, local: &RowDelta, remote: &RowDelta) -> SyncResult<Winner> {
        match HlcTimestamp::compare(remote.hlc, local.hlc) {
            std::cmp::Ordering::Greater => Ok(Winner::Remote),
            std::cmp::Ordering::Less => Ok(Winner::Local),
            std::cmp::Ordering::Equal => {
                if remote.client_id >= local.client_id {
                    Ok(Winner::Remote)
                } else {
                    Ok(Winner::Local)
                }
            }
        }
    }
}

/// One pending local outbox entry, indexed by `(table, row_id)` for
/// conflict lookup during apply.
struct PendingLocal {
    outbox_id: String,
    delta: RowDelta,
}

/// Applies remote delta batches into the local store under conflict
/// resolution, one rusqlite transaction per call.
pub struct Applier {
    conn: Arc<AsyncMutex<Connection>>,
    outbox: Arc<Outbox<RowDelta>>,
    resolver: Arc<dyn Resolver>,
}

impl Applier {
    pub fn new(
        conn: Arc<AsyncMutex<Connection>>,
        outbox: Arc<Outbox<RowDelta>>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            conn,
            outbox,
            resolver,
        }
    }

    pub fn init_schema_sync(conn: &Connection) -> SyncResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _sync_cursor (
                table_name TEXT PRIMARY KEY,
                last_synced_hlc INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS _applied_deltas (
                delta_id TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub async fn last_synced_hlc(&self, table: &str) -> SyncResult<HlcTimestamp> {
        validate_identifier(table)?;
        let conn = Arc::clone(&self.conn);
        let table = table.to_string();
        task::spawn_blocking(move || -> SyncResult<HlcTimestamp> {
            let guard = conn.blocking_lock();
            Self::init_schema_sync(&guard)?;
            let raw: Option<i64> = guard
                .query_row(
                    "SELECT last_synced_hlc FROM _sync_cursor WHERE table_name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|v| HlcTimestamp(v as u64)).unwrap_or(HlcTimestamp::ZERO))
        })
        .await?
    }

    /// Apply `remote` against the local store, resolving conflicts against
    /// pending outbox entries and advancing `_sync_cursor`. Returns the
    /// number of deltas actually written to the store (an `UPDATE` with no
    /// columns still counts; a local-win skip does not).
    pub async fn apply(&self, remote: Vec<RowDelta>) -> SyncResult<usize> {
        if remote.is_empty() {
            return Ok(0);
        }

        let pending = self.snapshot_pending().await?;
        let conn = Arc::clone(&self.conn);
        let resolver = Arc::clone(&self.resolver);

        let (applied, to_ack) = task::spawn_blocking(move || -> SyncResult<(usize, Vec<String>)> {
            let mut guard = conn.blocking_lock();
            let tx = guard.transaction()?;
            Self::init_schema_sync(&tx)?;

            let mut applied = 0usize;
            let mut to_ack = Vec::new();
            let mut cursor_advance: HashMap<String, HlcTimestamp> = HashMap::new();

            for delta in &remote {
                if Self::already_applied(&tx, &delta.delta_id)? {
                    Self::bump_cursor(&mut cursor_advance, &delta.table, delta.hlc);
                    continue;
                }

                let key = delta.key();
                let mut write_remote = true;

                if let Some(local) = pending.get(&key) {
                    match resolver.resolve(&local.delta, delta)? {
                        Winner::Remote => {
                            // remote superseded local: the pending entry is
                            // acked once the transaction below commits.
                            to_ack.push(local.outbox_id.clone());
                        }
                        Winner::Local => {
                            // local wins: skip the remote write but the
                            // cursor still advances past it below, so the
                            // gateway is never re-asked for this delta.
                            write_remote = false;
                        }
                    }
                }

                if write_remote {
                    Self::apply_one(&tx, delta)?;
                    applied += 1;
                }
                Self::mark_applied(&tx, &delta.delta_id)?;
                Self::bump_cursor(&mut cursor_advance, &delta.table, delta.hlc);
            }

            for (table, hlc) in cursor_advance {
                Self::advance_cursor(&tx, &table, hlc)?;
            }

            tx.commit()?;
            Ok((applied, to_ack))
        })
        .await??;

        if !to_ack.is_empty() {
            self.outbox.ack(&to_ack).await?;
        }

        Ok(applied)
    }

    async fn snapshot_pending(&self) -> SyncResult<HashMap<(String, String), PendingLocal>> {
        let entries = self.outbox.peek(crate::outbox::MAX_PEEK_LIMIT).await?;
        let mut by_key = HashMap::new();
        for entry in entries {
            by_key.insert(
                entry.item.key(),
                PendingLocal {
                    outbox_id: entry.id,
                    delta: entry.item,
                },
            );
        }
        Ok(by_key)
    }

    fn already_applied(tx: &Transaction<'_>, delta_id: &str) -> SyncResult<bool> {
        let seen: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM _applied_deltas WHERE delta_id = ?1",
                params![delta_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    fn mark_applied(tx: &Transaction<'_>, delta_id: &str) -> SyncResult<()> {
        tx.execute(
            "INSERT OR IGNORE INTO _applied_deltas (delta_id, applied_at) VALUES (?1, ?2)",
            params![delta_id, crate::outbox::now_ms()],
        )?;
        Ok(())
    }

    fn bump_cursor(map: &mut HashMap<String, HlcTimestamp>, table: &str, hlc: HlcTimestamp) {
        map.entry(table.to_string())
            .and_modify(|cur| *cur = (*cur).max(hlc))
            .or_insert(hlc);
    }

    fn advance_cursor(tx: &Transaction<'_>, table: &str, hlc: HlcTimestamp) -> SyncResult<()> {
        tx.execute(
            "INSERT INTO _sync_cursor (table_name, last_synced_hlc) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET
               last_synced_hlc = MAX(last_synced_hlc, excluded.last_synced_hlc)",
            params![table, hlc.0 as i64],
        )?;
        Ok(())
    }

    /// Per-op SQL semantics: INSERT with `_row_id` + columns
    /// (upserts on conflict, since a remote INSERT for an already-locally-
    /// materialised row must still win the row's contents), UPDATE with
    /// only the changed columns (no-op if empty), DELETE keyed on
    /// `_row_id`. Identifiers are allowlist-validated and quoted; values
    /// always go through parameter binding.
    fn apply_one(tx: &Transaction<'_>, delta: &RowDelta) -> SyncResult<()> {
        validate_identifier(&delta.table)?;
        for col in &delta.columns {
            validate_identifier(&col.column_name)?;
        }

        match delta.op {
            RowOp::Insert => {
                let mut names = vec![quote_identifier("_row_id")];
                let mut placeholders = vec!["?1".to_string()];
                let mut values: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(delta.row_id.clone())];
                for (i, col) in delta.columns.iter().enumerate() {
                    names.push(quote_identifier(&col.column_name));
                    placeholders.push(format!("?{}", i + 2));
                    values.push(Box::new(col.value.to_string()));
                }
                let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();

                if delta.columns.is_empty() {
                    let sql = format!(
                        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                        quote_identifier(&delta.table),
                        names.join(", "),
                        placeholders.join(", ")
                    );
                    tx.execute(&sql, params.as_slice())?;
                } else {
                    let update_clause = delta
                        .columns
                        .iter()
                        .map(|c| {
                            format!(
                                "{} = excluded.{}",
                                quote_identifier(&c.column_name),
                                quote_identifier(&c.column_name)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "INSERT INTO {} ({}) VALUES ({})
                         ON CONFLICT(_row_id) DO UPDATE SET {}",
                        quote_identifier(&delta.table),
                        names.join(", "),
                        placeholders.join(", "),
                        update_clause
                    );
                    tx.execute(&sql, params.as_slice())?;
                }
                Ok(())
            }
            RowOp::Update => {
                if delta.columns.is_empty() {
                    return Ok(());
                }
                let mut set_clauses = Vec::new();
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                for (i, col) in delta.columns.iter().enumerate() {
                    set_clauses.push(format!(
                        "{} = ?{}",
                        quote_identifier(&col.column_name),
                        i + 1
                    ));
                    values.push(Box::new(col.value.to_string()));
                }
                values.push(Box::new(delta.row_id.clone()));
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    quote_identifier(&delta.table),
                    set_clauses.join(", "),
                    quote_identifier("_row_id"),
                    values.len()
                );
                let params: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                tx.execute(&sql, params.as_slice())?;
                Ok(())
            }
            RowOp::Delete => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_identifier(&delta.table),
                    quote_identifier("_row_id")
                );
                tx.execute(&sql, params![delta.row_id])?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutboxBackend;

    fn sample_delta(table: &str, row_id: &str, client_id: &str, hlc: u64, op: RowOp) -> RowDelta {
        use crate::message::ColumnDelta;
        RowDelta {
            op,
            table: table.into(),
            row_id: row_id.into(),
            columns: if op == RowOp::Delete {
                vec![]
            } else {
                vec![
                    ColumnDelta {
                        column_name: "title".into(),
                        value: serde_json::json!("x"),
                    },
                    ColumnDelta {
                        column_name: "completed".into(),
                        value: serde_json::json!(1),
                    },
                ]
            },
            hlc: HlcTimestamp(hlc),
            client_id: client_id.into(),
            delta_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn setup() -> (Applier, Arc<Outbox<RowDelta>>, Arc<AsyncMutex<Connection>>) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE todos (_row_id TEXT PRIMARY KEY, title TEXT, completed TEXT);",
        )
        .unwrap();
        let conn = Arc::new(AsyncMutex::new(conn));
        let outbox = Arc::new(Outbox::new(Box::new(MemoryOutboxBackend::new())));
        let applier = Applier::new(Arc::clone(&conn), Arc::clone(&outbox), Arc::new(LwwResolver));
        (applier, outbox, conn)
    }

    #[tokio::test]
    async fn remote_wins_writes_row_and_acks_local() {
        let (applier, outbox, conn) = setup().await;
        let local = sample_delta("todos", "r1", "A", 1_000_000, RowOp::Insert);
        let id = outbox.push(local).await.unwrap();

        let remote = sample_delta("todos", "r1", "remote", 5_000_000, RowOp::Update);
        let applied = applier.apply(vec![remote]).await.unwrap();

        assert_eq!(applied, 1);
        assert_eq!(outbox.depth().await.unwrap(), 0);
        assert!(outbox.peek(10).await.unwrap().iter().all(|e| e.id != id));

        let hlc = applier.last_synced_hlc("todos").await.unwrap();
        assert_eq!(hlc, HlcTimestamp(5_000_000));

        let guard = conn.lock().await;
        let title: String = guard
            .query_row("SELECT title FROM todos WHERE _row_id = 'r1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "\"x\"");
    }

    #[tokio::test]
    async fn local_wins_skips_write_but_advances_cursor() {
        let (applier, outbox, _conn) = setup().await;
        let local = sample_delta("todos", "r1", "A", 10_000_000, RowOp::Insert);
        outbox.push(local).await.unwrap();

        let remote = sample_delta("todos", "r1", "remote", 1_000_000, RowOp::Update);
        let applied = applier.apply(vec![remote]).await.unwrap();

        assert_eq!(applied, 0);
        assert_eq!(outbox.depth().await.unwrap(), 1, "local entry still pending");
        let hlc = applier.last_synced_hlc("todos").await.unwrap();
        assert_eq!(hlc, HlcTimestamp(1_000_000));
    }

    #[tokio::test]
    async fn no_conflict_writes_remote_directly() {
        let (applier, _outbox, conn) = setup().await;
        let remote = sample_delta("todos", "r2", "remote", 42, RowOp::Insert);
        let applied = applier.apply(vec![remote]).await.unwrap();
        assert_eq!(applied, 1);
        let guard = conn.lock().await;
        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM todos WHERE _row_id = 'r2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let (applier, _outbox, conn) = setup().await;
        applier
            .apply(vec![sample_delta("todos", "r3", "remote", 1, RowOp::Insert)])
            .await
            .unwrap();
        applier
            .apply(vec![sample_delta("todos", "r3", "remote", 2, RowOp::Delete)])
            .await
            .unwrap();
        let guard = conn.lock().await;
        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM todos WHERE _row_id = 'r3'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn duplicate_delta_id_is_idempotent() {
        let (applier, _outbox, conn) = setup().await;
        let delta = sample_delta("todos", "r4", "remote", 1, RowOp::Insert);
        applier.apply(vec![delta.clone()]).await.unwrap();
        let applied_again = applier.apply(vec![delta]).await.unwrap();
        assert_eq!(applied_again, 0, "already-applied delta is skipped, not reapplied");
        let guard = conn.lock().await;
        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM todos WHERE _row_id = 'r4'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
