//! Table schema tracking and additive-only migration.
//!
//! Local storage materialises every schema column as a `TEXT` column holding
//! its JSON-encoded representation: declared logical types
//! (`string|number|boolean|json|null`) drive schema-mismatch detection, not
//! SQL column affinity, which sidesteps SQLite's numeric-affinity coercion
//! of stored text.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Validate a table or column name against the identifier allowlist.
/// Called before any identifier is interpolated into SQL text.
pub fn validate_identifier(name: &str) -> SyncResult<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(SyncError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote an identifier already validated by [`validate_identifier`].
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Json,
    Null,
}

impl ColumnType {
    fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Json => "json",
            ColumnType::Null => "null",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ColumnType::String),
            "number" => Some(ColumnType::Number),
            "boolean" => Some(ColumnType::Boolean),
            "json" => Some(ColumnType::Json),
            "null" => Some(ColumnType::Null),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<TableColumn>,
}

/// Tracks `{table -> (schema_json, schema_version, updated_at)}` in the
/// `_lakesync_meta` table, and materialises/migrates the corresponding user
/// table.
pub struct SchemaStore;

impl SchemaStore {
    pub fn init_schema_sync(conn: &Connection) -> SyncResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _lakesync_meta (
                table_name TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL DEFAULT 1,
                schema_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Register a table for the first time: creates both the metadata row
    /// and the materialised table. Fails if the table is already registered
    /// (use [`SchemaStore::synchronise_sync`] for subsequent versions).
    pub fn register_sync(conn: &Connection, schema: &TableSchema, version: i64) -> SyncResult<()> {
        validate_identifier(&schema.table)?;
        for col in &schema.columns {
            validate_identifier(&col.name)?;
        }

        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (_row_id TEXT PRIMARY KEY",
            quote_identifier(&schema.table)
        );
        for col in &schema.columns {
            ddl.push_str(&format!(", {} TEXT", quote_identifier(&col.name)));
        }
        ddl.push(')');
        conn.execute_batch(&ddl)?;

        let schema_json = serde_json::to_string(schema)?;
        conn.execute(
            "INSERT INTO _lakesync_meta (table_name, schema_version, schema_json, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(table_name) DO UPDATE SET
               schema_version = excluded.schema_version,
               schema_json = excluded.schema_json,
               updated_at = excluded.updated_at",
            params![schema.table, version, schema_json],
        )?;
        Ok(())
    }

    pub fn get_sync(conn: &Connection, table: &str) -> SyncResult<Option<(TableSchema, i64)>> {
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT schema_json, schema_version FROM _lakesync_meta WHERE table_name = ?1",
                params![table],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((json, version)) => {
                let schema: TableSchema = serde_json::from_str(&json)?;
                Ok(Some((schema, version)))
            }
            None => Ok(None),
        }
    }

    pub fn column_names_sync(conn: &Connection, table: &str) -> SyncResult<Vec<String>> {
        match Self::get_sync(conn, table)? {
            Some((schema, _)) => Ok(schema.columns.into_iter().map(|c| c.name).collect()),
            None => Err(SyncError::SchemaMismatch(format!(
                "table {table} has no registered schema"
            ))),
        }
    }

    /// Additive-only migration to an incoming server schema/version, e.g.
    /// `SchemaStore::synchronise_sync(conn, "todos", server_schema, 5)`.
    /// Issues one `ALTER TABLE ... ADD COLUMN` per newly added column.
    /// Fails with `SCHEMA_MISMATCH` if the incoming schema removes a column,
    /// changes an existing column's type, or names a different table than
    /// `table` (the already-registered table this call targets).
    pub fn synchronise_sync(
        conn: &Connection,
        table: &str,
        incoming: &TableSchema,
        incoming_version: i64,
    ) -> SyncResult<()> {
        validate_identifier(table)?;
        validate_identifier(&incoming.table)?;
        for col in &incoming.columns {
            validate_identifier(&col.name)?;
        }

        if incoming.table != table {
            return Err(SyncError::SchemaMismatch(format!(
                "table name mismatch: {} != {}",
                table, incoming.table
            )));
        }

        let Some((current, current_version)) = Self::get_sync(conn, table)? else {
            return Self::register_sync(conn, incoming, incoming_version);
        };

        if incoming_version <= current_version {
            return Ok(());
        }

        let incoming_by_name: std::collections::HashMap<&str, ColumnType> = incoming
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect();

        // Removed or retyped columns violate additive-only migration.
        for col in &current.columns {
            match incoming_by_name.get(col.name.as_str()) {
                None => {
                    return Err(SyncError::SchemaMismatch(format!(
                        "column {} removed from table {}",
                        col.name, current.table
                    )));
                }
                Some(incoming_type) if *incoming_type != col.column_type => {
                    return Err(SyncError::SchemaMismatch(format!(
                        "column {} changed type from {} to {}",
                        col.name,
                        col.column_type.as_str(),
                        incoming_type.as_str()
                    )));
                }
                Some(_) => {}
            }
        }

        let current_names: std::collections::HashSet<&str> =
            current.columns.iter().map(|c| c.name.as_str()).collect();
        for col in &incoming.columns {
            if !current_names.contains(col.name.as_str()) {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} TEXT",
                        quote_identifier(&incoming.table),
                        quote_identifier(&col.name)
                    ),
                    [],
                )?;
            }
        }

        let schema_json = serde_json::to_string(incoming)?;
        conn.execute(
            "UPDATE _lakesync_meta SET schema_version = ?1, schema_json = ?2, updated_at = datetime('now')
             WHERE table_name = ?3",
            params![incoming_version, schema_json, incoming.table],
        )?;
        Ok(())
    }
}
