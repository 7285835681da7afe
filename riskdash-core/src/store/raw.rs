use std::sync::Arc;

use crate::datasets::Dataset;
use crate::sql_params;
use crate::types::RawRecord;

use super::{Database, Row, SqlValue, StoreResult};

const RECORD_COLUMNS: &str = "title, category, risk_theme, risk_subtheme, raw_data";

/// Access to the ingested source records of each dataset.
#[derive(Debug, Clone)]
pub struct RawRecordStore {
    db: Arc<Database>,
}

impl RawRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get(&self, dataset: Dataset, id: &str) -> StoreResult<Option<RawRecord>> {
        let config = dataset.config();
        let (table, key) = (config.table, config.key_field);
        let row = self
            .db
            .fetchone(
                &format!("SELECT {key}, {RECORD_COLUMNS} FROM {table} WHERE {key} = ?"),
                &sql_params![id],
            )
            .await
            .map_err(|e| e.during("raw lookup", table))?;
        row.map(|r| record_from_row(&r, table)).transpose()
    }

    /// Every record id, ordered by key.
    pub async fn ids(&self, dataset: Dataset) -> StoreResult<Vec<String>> {
        let config = dataset.config();
        let (table, key) = (config.table, config.key_field);
        let rows = self
            .db
            .fetchall(&format!("SELECT {key} FROM {table} ORDER BY {key}"), &[])
            .await
            .map_err(|e| e.during("raw scan", table))?;
        rows.iter().map(|r| r.required_text(0)).collect()
    }

    /// Every record, ordered by key.
    pub async fn all(&self, dataset: Dataset) -> StoreResult<Vec<RawRecord>> {
        let config = dataset.config();
        let (table, key) = (config.table, config.key_field);
        let rows = self
            .db
            .fetchall(
                &format!("SELECT {key}, {RECORD_COLUMNS} FROM {table} ORDER BY {key}"),
                &[],
            )
            .await
            .map_err(|e| e.during("raw scan", table))?;
        rows.iter().map(|r| record_from_row(r, table)).collect()
    }

    pub async fn count(&self, dataset: Dataset) -> StoreResult<u64> {
        let table = dataset.config().table;
        let row = self
            .db
            .fetchone(&format!("SELECT COUNT(*) FROM {table}"), &[])
            .await
            .map_err(|e| e.during("raw count", table))?;
        let count = match row {
            Some(row) => row.integer(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Insert records, skipping ids that already exist. Returns rows inserted.
    pub async fn insert_many(&self, dataset: Dataset, records: &[RawRecord]) -> StoreResult<u64> {
        let config = dataset.config();
        let (table, key) = (config.table, config.key_field);
        let rows: Vec<Vec<SqlValue>> = records
            .iter()
            .map(|r| {
                sql_params![
                    r.id.as_str(),
                    r.title.clone(),
                    r.category.clone(),
                    r.theme.clone(),
                    r.subtheme.clone(),
                    r.blob.clone()
                ]
            })
            .collect();
        self.db
            .executemany(
                &format!(
                    "INSERT OR IGNORE INTO {table} ({key}, {RECORD_COLUMNS}) \
                     VALUES (?, ?, ?, ?, ?, ?)"
                ),
                &rows,
            )
            .await
            .map_err(|e| e.during("raw insert", table))
    }
}

/// Decode a `SELECT {key}, RECORD_COLUMNS` row.
fn record_from_row(row: &Row, table: &str) -> StoreResult<RawRecord> {
    Ok(RawRecord {
        id: row.required_text(0)?,
        title: row.text(1)?,
        category: row.text(2)?,
        theme: row.text(3)?,
        subtheme: row.text(4)?,
        blob: row.json(5).map_err(|e| e.during("raw decode", table))?,
    })
}
