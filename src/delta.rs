//! Delta extractor & local write tracker: turns local row
//! mutations into column-level `RowDelta`s and enqueues them onto the
//! outbox, atomically with the local write.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::hlc::Hlc;
use crate::message::{ColumnDelta, RowDelta, RowOp};
use crate::outbox::Outbox;
use crate::schema::{SchemaStore, quote_identifier, validate_identifier};

/// Captures local mutations against schema-registered tables and turns them
/// into queued `RowDelta`s. Owns no table data itself; it reads/writes
/// through the shared rusqlite connection the host's local store lives on.
pub struct DeltaExtractor {
    conn: Arc<AsyncMutex<Connection>>,
    clock: Arc<Hlc>,
    client_id: String,
    outbox: Arc<Outbox<RowDelta>>,
}

impl DeltaExtractor {
    pub fn new(
        conn: Arc<AsyncMutex<Connection>>,
        clock: Arc<Hlc>,
        client_id: String,
        outbox: Arc<Outbox<RowDelta>>,
    ) -> Self {
        Self {
            conn,
            clock,
            client_id,
            outbox,
        }
    }

    /// Insert a new row and enqueue an INSERT delta. `data` is restricted to
    /// schema-known columns.
    pub async fn insert(
        &self,
        table: &str,
        row_id: &str,
        data: HashMap<String, Value>,
    ) -> SyncResult<()> {
        validate_identifier(table)?;
        let hlc = self.clock.now();
        let conn = Arc::clone(&self.conn);
        let table_owned = table.to_string();
        let row_id_owned = row_id.to_string();

        let columns: Vec<ColumnDelta> = task::spawn_blocking({
            let table_owned = table_owned.clone();
            let row_id_owned = row_id_owned.clone();
            move || -> SyncResult<Vec<ColumnDelta>> {
                let guard = conn.blocking_lock();
                let schema_columns = SchemaStore::column_names_sync(&guard, &table_owned)?;
                let mut columns = Vec::new();
                let mut col_names = vec!["_row_id".to_string()];
                let mut col_placeholders = vec!["?1".to_string()];
                let mut values: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(row_id_owned.clone())];

                for (name, value) in data.iter() {
                    if !schema_columns.contains(name) {
                        continue;
                    }
                    validate_identifier(name)?;
                    columns.push(ColumnDelta {
                        column_name: name.clone(),
                        value: value.clone(),
                    });
                    col_names.push(name.clone());
                    col_placeholders.push(format!("?{}", col_names.len()));
                    values.push(Box::new(value.to_string()));
                }

                let quoted_cols: Vec<String> =
                    col_names.iter().map(|c| quote_identifier(c)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_identifier(&table_owned),
                    quoted_cols.join(", "),
                    col_placeholders.join(", ")
                );
                let params: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                guard.execute(&sql, params.as_slice())?;
                Ok(columns)
            }
        })
        .await??;

        let delta = RowDelta {
            op: RowOp::Insert,
            table: table_owned,
            row_id: row_id_owned,
            columns,
            hlc,
            client_id: self.client_id.clone(),
            delta_id: Uuid::new_v4().to_string(),
        };
        self.outbox.push(delta).await?;
        Ok(())
    }

    /// Update an existing row with a column-level patch. Emits no delta if
    /// the diff against the current row is empty.
    pub async fn update(
        &self,
        table: &str,
        row_id: &str,
        patch: HashMap<String, Value>,
    ) -> SyncResult<()> {
        validate_identifier(table)?;
        let conn = Arc::clone(&self.conn);
        let table_owned = table.to_string();
        let row_id_owned = row_id.to_string();

        let changed: Vec<ColumnDelta> = task::spawn_blocking({
            let table_owned = table_owned.clone();
            let row_id_owned = row_id_owned.clone();
            move || -> SyncResult<Vec<ColumnDelta>> {
                let guard = conn.blocking_lock();
                let schema_columns = SchemaStore::column_names_sync(&guard, &table_owned)?;
                let current = fetch_row(&guard, &table_owned, &row_id_owned, &schema_columns)?
                    .ok_or_else(|| SyncError::RowNotFound {
                        table: table_owned.clone(),
                        row_id: row_id_owned.clone(),
                    })?;

                let mut changed = Vec::new();
                for (name, value) in patch.iter() {
                    if !schema_columns.contains(name) {
                        continue;
                    }
                    if current.get(name) != Some(value) {
                        changed.push(ColumnDelta {
                            column_name: name.clone(),
                            value: value.clone(),
                        });
                    }
                }

                if changed.is_empty() {
                    return Ok(changed);
                }

                validate_identifier(&table_owned)?;
                let mut set_clauses = Vec::new();
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                for (i, col) in changed.iter().enumerate() {
                    validate_identifier(&col.column_name)?;
                    set_clauses.push(format!("{} = ?{}", quote_identifier(&col.column_name), i + 1));
                    values.push(Box::new(col.value.to_string()));
                }
                values.push(Box::new(row_id_owned.clone()));
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ?{}",
                    quote_identifier(&table_owned),
                    set_clauses.join(", "),
                    quote_identifier("_row_id"),
                    values.len()
                );
                let params: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                guard.execute(&sql, params.as_slice())?;
                Ok(changed)
            }
        })
        .await??;

        if changed.is_empty() {
            return Ok(());
        }

        let hlc = self.clock.now();
        let delta = RowDelta {
            op: RowOp::Update,
            table: table_owned,
            row_id: row_id_owned,
            columns: changed,
            hlc,
            client_id: self.client_id.clone(),
            delta_id: Uuid::new_v4().to_string(),
        };
        self.outbox.push(delta).await?;
        Ok(())
    }

    /// Delete a row and enqueue a DELETE delta.
    pub async fn delete(&self, table: &str, row_id: &str) -> SyncResult<()> {
        validate_identifier(table)?;
        let conn = Arc::clone(&self.conn);
        let table_owned = table.to_string();
        let row_id_owned = row_id.to_string();

        task::spawn_blocking({
            let table_owned = table_owned.clone();
            let row_id_owned = row_id_owned.clone();
            move || -> SyncResult<()> {
                let guard = conn.blocking_lock();
                let exists: Option<i64> = guard
                    .query_row(
                        &format!(
                            "SELECT 1 FROM {} WHERE {} = ?1",
                            quote_identifier(&table_owned),
                            quote_identifier("_row_id")
                        ),
                        [&row_id_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(SyncError::RowNotFound {
                        table: table_owned.clone(),
                        row_id: row_id_owned.clone(),
                    });
                }
                guard.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        quote_identifier(&table_owned),
                        quote_identifier("_row_id")
                    ),
                    [&row_id_owned],
                )?;
                Ok(())
            }
        })
        .await??;

        let hlc = self.clock.now();
        let delta = RowDelta {
            op: RowOp::Delete,
            table: table_owned,
            row_id: row_id_owned,
            columns: vec![],
            hlc,
            client_id: self.client_id.clone(),
            delta_id: Uuid::new_v4().to_string(),
        };
        self.outbox.push(delta).await?;
        Ok(())
    }
}

fn fetch_row(
    conn: &Connection,
    table: &str,
    row_id: &str,
    columns: &[String],
) -> SyncResult<Option<HashMap<String, Value>>> {
    if columns.is_empty() {
        return Ok(None);
    }
    let quoted_cols: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        quoted_cols.join(", "),
        quote_identifier(table),
        quote_identifier("_row_id")
    );
    let mut stmt = conn.prepare(&sql)?;
    let result = stmt
        .query_row([row_id], |row| {
            let mut map = HashMap::new();
            for (i, name) in columns.iter().enumerate() {
                let raw: Option<String> = row.get(i)?;
                let value = raw
                    .map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s)))
                    .unwrap_or(Value::Null);
                map.insert(name.clone(), value);
            }
            Ok(map)
        })
        .optional()?;
    Ok(result)
}
