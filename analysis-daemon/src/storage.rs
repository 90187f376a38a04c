//! Storage engine owned by the driver process.
//!
//! Only the driver ever opens the storage file; everyone else goes through
//! the socket. The backend is used from a single dedicated thread, so it is
//! `Send` but never shared.

use crate::error::StorageError;
use crate::protocol::{Row, Statement};
use crate::worker::DriverConfig;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

pub trait StorageBackend: Send {
    /// Run one statement. Queries return their rows; other statements
    /// return a single `{rows_affected, last_insert_rowid}` row.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>;

    /// Run every statement in one transaction. The result rows of all
    /// statements are concatenated in order.
    fn execute_batch(&mut self, statements: &[Statement]) -> Result<Vec<Row>, StorageError>;

    fn path(&self) -> &Path;

    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Open the backend named by `config.driver_type`.
pub fn open_backend(config: &DriverConfig) -> Result<Box<dyn StorageBackend>, StorageError> {
    match config.driver_type.as_str() {
        "sqlite" => Ok(Box::new(SqliteBackend::open(
            &config.storage_path,
            &config.driver_settings,
        )?)),
        other => Err(StorageError::UnsupportedDriver(other.to_string())),
    }
}

pub struct SqliteBackend {
    conn: Connection,
    path: PathBuf,
}

impl SqliteBackend {
    pub fn open(path: &Path, settings: &BTreeMap<String, Value>) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::InvalidSetting {
                    key: "storage_path".to_string(),
                    message: format!("cannot create {}: {e}", parent.display()),
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn, settings)?;
        info!("Opened SQLite storage at {}", path.display());
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn, &BTreeMap::new())?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    /// Apply `driver_settings` as PRAGMAs. Values are validated against a
    /// fixed vocabulary before they reach SQL.
    fn configure(conn: &Connection, settings: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let mut busy_timeout = DEFAULT_BUSY_TIMEOUT_MS;
        let mut journal_mode = "WAL".to_string();
        let mut pragmas = Vec::new();

        for (key, value) in settings {
            let invalid = |message: &str| StorageError::InvalidSetting {
                key: key.clone(),
                message: format!("{message}, got {value}"),
            };
            match key.as_str() {
                "busy_timeout" => {
                    busy_timeout = value.as_u64().ok_or_else(|| invalid("expected milliseconds"))?;
                }
                "journal_mode" => {
                    let mode = value
                        .as_str()
                        .map(str::to_ascii_uppercase)
                        .filter(|m| {
                            matches!(
                                m.as_str(),
                                "DELETE" | "TRUNCATE" | "PERSIST" | "MEMORY" | "WAL" | "OFF"
                            )
                        })
                        .ok_or_else(|| invalid("expected a SQLite journal mode"))?;
                    journal_mode = mode;
                }
                "synchronous" => {
                    let level = match value {
                        Value::String(s) => s.to_ascii_uppercase(),
                        Value::Number(n) => n.to_string(),
                        _ => String::new(),
                    };
                    if !matches!(
                        level.as_str(),
                        "OFF" | "NORMAL" | "FULL" | "EXTRA" | "0" | "1" | "2" | "3"
                    ) {
                        return Err(invalid("expected OFF, NORMAL, FULL or EXTRA"));
                    }
                    pragmas.push(format!("PRAGMA synchronous = {level};"));
                }
                "foreign_keys" => {
                    let on = value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
                    pragmas.push(format!(
                        "PRAGMA foreign_keys = {};",
                        if on { "ON" } else { "OFF" }
                    ));
                }
                _ => return Err(invalid("unknown setting")),
            }
        }

        conn.busy_timeout(Duration::from_millis(busy_timeout))?;
        let applied: String =
            conn.query_row(&format!("PRAGMA journal_mode = {journal_mode}"), [], |row| {
                row.get(0)
            })?;
        debug!("journal_mode = {}", applied);
        if !pragmas.is_empty() {
            conn.execute_batch(&pragmas.join("\n"))?;
        }
        Ok(())
    }
}

impl StorageBackend for SqliteBackend {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        run_statement(&self.conn, sql, params)
    }

    fn execute_batch(&mut self, statements: &[Statement]) -> Result<Vec<Row>, StorageError> {
        let tx = self.conn.transaction()?;
        let mut rows = Vec::new();
        for statement in statements {
            rows.extend(run_statement(&tx, &statement.sql, &statement.params)?);
        }
        tx.commit()?;
        Ok(rows)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
    let values = params
        .iter()
        .map(to_sql_value)
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(sql)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(values.iter()))?;
        let mut row = Row::new();
        row.insert("rows_affected".to_string(), Value::from(affected));
        row.insert(
            "last_insert_rowid".to_string(),
            Value::from(conn.last_insert_rowid()),
        );
        return Ok(vec![row]);
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), from_sql_value(row.get_ref(idx)?));
        }
        out.push(obj);
    }
    Ok(out)
}

fn to_sql_value(value: &Value) -> Result<SqlValue, StorageError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if n.is_u64() {
                return Err(StorageError::UnsupportedParam(format!(
                    "{n} does not fit a 64-bit signed integer"
                )));
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Structured values are stored as their JSON text
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    })
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}
