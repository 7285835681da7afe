// Result cache: one table per (dataset, function), keyed by record id.
// Entries are replaced wholesale on every write; there is no expiry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::datasets::Dataset;
use crate::sql_params;
use crate::types::{CacheEntry, format_timestamp, parse_timestamp};

use super::adapter::ensure_identifier;
use super::{Database, StoreResult};

/// Read/write access to the per-function result tables.
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: Arc<Database>,
}

impl CacheStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn target(dataset: Dataset, function: &str) -> StoreResult<(String, &'static str)> {
        let table = dataset.cache_table(function);
        ensure_identifier(&table)?;
        Ok((table, dataset.config().key_field))
    }

    /// The stored entry for `id`, if any.
    pub async fn get(
        &self,
        dataset: Dataset,
        function: &str,
        id: &str,
    ) -> StoreResult<Option<CacheEntry>> {
        let (table, key) = Self::target(dataset, function)?;
        let row = self
            .db
            .fetchone(
                &format!("SELECT payload, created_at FROM {table} WHERE {key} = ?"),
                &sql_params![id],
            )
            .await
            .map_err(|e| e.during("cache read", &table))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let read = || -> StoreResult<CacheEntry> {
            let payload = row.json(0)?.unwrap_or(Value::Null);
            let created_at = parse_timestamp(&row.required_text(1)?)?;
            Ok(CacheEntry {
                payload,
                created_at,
            })
        };
        read().map(Some).map_err(|e| e.during("cache decode", &table))
    }

    /// Insert or replace the entry for `id`.
    pub async fn upsert(
        &self,
        dataset: Dataset,
        function: &str,
        id: &str,
        payload: &Value,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (table, key) = Self::target(dataset, function)?;
        self.db
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {table} ({key}, payload, created_at) VALUES (?, ?, ?)"
                ),
                &sql_params![id, payload.clone(), format_timestamp(&created_at)],
            )
            .await
            .map_err(|e| e.during("cache upsert", &table))?;
        Ok(())
    }

    /// Delete one entry, or every entry when `id` is `None`. Returns rows removed.
    pub async fn delete(
        &self,
        dataset: Dataset,
        function: &str,
        id: Option<&str>,
    ) -> StoreResult<u64> {
        let (table, key) = Self::target(dataset, function)?;
        let result = match id {
            Some(id) => {
                self.db
                    .execute(
                        &format!("DELETE FROM {table} WHERE {key} = ?"),
                        &sql_params![id],
                    )
                    .await
            }
            None => self.db.execute(&format!("DELETE FROM {table}"), &[]).await,
        };
        result.map_err(|e| e.during("cache delete", &table))
    }

    /// Number of cached entries for one function.
    pub async fn count(&self, dataset: Dataset, function: &str) -> StoreResult<u64> {
        let (table, _) = Self::target(dataset, function)?;
        let row = self
            .db
            .fetchone(&format!("SELECT COUNT(*) FROM {table}"), &[])
            .await
            .map_err(|e| e.during("cache count", &table))?;
        let count = match row {
            Some(row) => row.integer(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Ids that already have an entry, ordered by id.
    pub async fn ids(&self, dataset: Dataset, function: &str) -> StoreResult<Vec<String>> {
        let (table, key) = Self::target(dataset, function)?;
        let rows = self
            .db
            .fetchall(&format!("SELECT {key} FROM {table} ORDER BY {key}"), &[])
            .await
            .map_err(|e| e.during("cache scan", &table))?;
        rows.iter().map(|r| r.required_text(0)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    async fn store() -> CacheStore {
        CacheStore::new(Arc::new(Database::in_memory().await.unwrap()))
    }

    fn ts(text: &str) -> DateTime<Utc> {
        parse_timestamp(text).unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let cache = store().await;
        let payload = serde_json::json!({ "root_causes": ["config drift"], "confidence": 0.8 });
        cache
            .upsert(
                Dataset::Issues,
                "root_cause",
                "ISS-1",
                &payload,
                ts("2024-05-01T10:00:00.000001Z"),
            )
            .await
            .unwrap();

        let entry = cache
            .get(Dataset::Issues, "root_cause", "ISS-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(format_timestamp(&entry.created_at), "2024-05-01T10:00:00.000001Z");
        assert!(
            cache
                .get(Dataset::Issues, "enrichment", "ISS-1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let cache = store().await;
        for (n, stamp) in [(1, "2024-05-01T10:00:00Z"), (2, "2024-05-01T11:00:00Z")] {
            cache
                .upsert(
                    Dataset::Controls,
                    "enrichment",
                    "CTL-1",
                    &serde_json::json!({ "n": n }),
                    ts(stamp),
                )
                .await
                .unwrap();
        }
        assert_eq!(cache.count(Dataset::Controls, "enrichment").await.unwrap(), 1);
        let entry = cache
            .get(Dataset::Controls, "enrichment", "CTL-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload["n"], 2);
    }

    #[tokio::test]
    async fn scalar_payloads_keep_their_type() {
        let cache = store().await;
        for (id, payload) in [
            ("a", serde_json::json!("42")),
            ("b", serde_json::json!(42)),
            ("c", serde_json::json!(null)),
        ] {
            cache
                .upsert(Dataset::Issues, "enrichment", id, &payload, Utc::now())
                .await
                .unwrap();
            let entry = cache
                .get(Dataset::Issues, "enrichment", id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(entry.payload, payload, "{id}");
        }
    }

    #[tokio::test]
    async fn delete_one_and_all() {
        let cache = store().await;
        for id in ["a", "b", "c"] {
            cache
                .upsert(Dataset::Issues, "root_cause", id, &serde_json::json!({}), Utc::now())
                .await
                .unwrap();
        }
        assert_eq!(
            cache.ids(Dataset::Issues, "root_cause").await.unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            cache
                .delete(Dataset::Issues, "root_cause", Some("b"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            cache
                .delete(Dataset::Issues, "root_cause", Some("b"))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            cache.delete(Dataset::Issues, "root_cause", None).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn hostile_function_name_rejected() {
        let cache = store().await;
        let err = cache
            .get(Dataset::Issues, "x; DROP TABLE issues_raw", "a")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }
}
