use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use crate::error::StoreError;

use super::schema::SQLITE_PRAGMAS;
use super::{Backend, Dialect, Row, SqlValue, StoreResult};

/// Embedded backend: a single `rusqlite` connection behind a mutex.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connect(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        backend.initialize()?;
        debug!(path = %path.display(), "opened sqlite database");
        Ok(backend)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        backend.initialize()?;
        Ok(backend)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SQLITE_PRAGMAS)?;

        // Both are no-ops for in-memory databases.
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
        let _ = conn.execute_batch("PRAGMA mmap_size = 268435456;");
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connect("sqlite connection mutex poisoned".into()))
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
        SqlValue::Json(v) => SqliteValue::Text(v.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(sql, params_from_iter(params.iter().map(to_sqlite)))?;
        Ok(changed as u64)
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> StoreResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0u64;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for row in rows {
                changed += stmt.execute(params_from_iter(row.iter().map(to_sqlite)))? as u64;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter().map(to_sqlite)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(from_sqlite(row.get_ref(idx)?));
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }

    async fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.lock()?.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}
