// Integration test fixtures for riskdash: databases, seeded records,
// instrumented compute functions and a recording storage backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use riskdash_core::compute::{Computable, Computation, ComputeInput, ComputeRegistry, mock};
use riskdash_core::datasets::Dataset;
use riskdash_core::error::StoreError;
use riskdash_core::resolver::FunctionResolver;
use riskdash_core::store::{Backend, Database, Dialect, RawRecordStore, Row, SqlValue};
use riskdash_core::types::RawRecord;

/// Id and title used by the end-to-end scenario.
pub const SCENARIO_ID: &str = "ISS-2024-00042";
pub const SCENARIO_TITLE: &str = "Payment gateway timeout";

/// A file-backed embedded database in a temporary directory.
#[derive(Debug)]
pub struct TestDb {
    pub dir: tempfile::TempDir,
    pub db: Arc<Database>,
}

impl TestDb {
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let db = Database::open_sqlite(&dir.path().join("dashboard.db"))
            .await
            .expect("open sqlite");
        Self {
            dir,
            db: Arc::new(db),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("dashboard.db")
    }

    pub fn resume_dir(&self) -> PathBuf {
        self.dir.path().join("progress")
    }

    pub fn raw(&self) -> RawRecordStore {
        RawRecordStore::new(Arc::clone(&self.db))
    }

    pub async fn seed(&self, dataset: Dataset, records: &[RawRecord]) {
        self.raw()
            .insert_many(dataset, records)
            .await
            .expect("seed records");
    }

    pub fn resolver(&self, registry: ComputeRegistry) -> FunctionResolver {
        FunctionResolver::new(Arc::clone(&self.db), registry)
    }
}

/// An issue record carrying only scalar columns.
pub fn issue(id: &str, title: &str) -> RawRecord {
    RawRecord {
        id: id.to_string(),
        title: Some(title.to_string()),
        category: Some("Incident".to_string()),
        theme: Some("Technology".to_string()),
        subtheme: Some("Availability".to_string()),
        blob: None,
    }
}

pub fn scenario_issue() -> RawRecord {
    issue(SCENARIO_ID, SCENARIO_TITLE)
}

/// Deterministic root-cause function that counts calls and remembers ids.
#[derive(Debug, Clone, Default)]
pub struct CountingCompute {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl CountingCompute {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids computed so far, sorted.
    pub fn seen(&self) -> Vec<String> {
        let mut ids = self.seen.lock().expect("seen lock").clone();
        ids.sort();
        ids
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.seen.lock().expect("seen lock").clear();
    }

    /// Registry with this function as `dataset.function`.
    pub fn registry(&self, dataset: Dataset, function: &str) -> ComputeRegistry {
        let mut registry = ComputeRegistry::new();
        registry
            .register(dataset, function, self.clone())
            .expect("register counting compute");
        registry
    }
}

impl Computable for CountingCompute {
    fn compute(&self, input: ComputeInput) -> Computation {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("seen lock").push(input.id.clone());
        Computation::ready(mock::root_cause(&input.id))
    }
}

/// Fails for a fixed set of ids and succeeds for the rest.
#[derive(Debug, Clone, Default)]
pub struct FlakyCompute {
    failing: HashSet<String>,
}

impl FlakyCompute {
    pub fn failing_on(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl Computable for FlakyCompute {
    fn compute(&self, input: ComputeInput) -> Computation {
        if self.failing.contains(&input.id) {
            Computation::failed(format!("upstream model rejected {}", input.id))
        } else {
            Computation::ready(mock::root_cause(&input.id))
        }
    }
}

/// One statement as it reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Backend that records every statement. Queries of the form
/// `SELECT <item>, <item>, ...` are answered with one row: items that are
/// placeholders (`$N` or `?N`) yield the bound value at position `N`,
/// anything else comes back as text.
#[derive(Debug)]
pub struct RecordingBackend {
    dialect: Dialect,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingBackend {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            calls: Arc::default(),
        }
    }

    /// Shared view of the call log, usable after the backend is boxed.
    pub fn log(&self) -> Arc<Mutex<Vec<RecordedCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, sql: &str, params: &[SqlValue]) {
        self.calls.lock().expect("call log").push(RecordedCall {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

fn placeholder_position(item: &str) -> Option<usize> {
    item.strip_prefix('$')
        .or_else(|| item.strip_prefix('?'))
        .and_then(|digits| digits.parse().ok())
        .filter(|n| *n > 0)
}

#[async_trait::async_trait]
impl Backend for RecordingBackend {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.record(sql, params);
        Ok(1)
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<u64, StoreError> {
        for row in rows {
            self.record(sql, row);
        }
        Ok(rows.len() as u64)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.record(sql, params);
        let Some(list) = sql.strip_prefix("SELECT ") else {
            return Ok(Vec::new());
        };
        let mut values = Vec::new();
        for item in list.split(',').map(str::trim) {
            let value = match placeholder_position(item) {
                Some(n) => params
                    .get(n - 1)
                    .cloned()
                    .ok_or_else(|| StoreError::Decode(format!("no parameter at {item}")))?,
                None => SqlValue::Text(item.to_string()),
            };
            values.push(value);
        }
        Ok(vec![Row::new(values)])
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.record(sql, &[]);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read a resume file as JSON.
pub fn read_json(path: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(path).expect("read json file");
    serde_json::from_str(&text).expect("parse json file")
}
