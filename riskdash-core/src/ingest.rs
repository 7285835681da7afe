//! Loading source records into a dataset's raw table.
//!
//! Input is either a JSON array of objects or JSON lines (one object per
//! line, blank lines ignored). Each object is mapped through the dataset's
//! field names; rows whose key already exists are skipped.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument};

use crate::datasets::Dataset;
use crate::error::{DashError, Result};
use crate::store::RawRecordStore;
use crate::types::RawRecord;

/// Rows handed to one `executemany` call.
pub const INGEST_BATCH_SIZE: usize = 1000;

/// Error messages retained in an [`IngestReport`].
pub const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub dataset: Dataset,
    pub total: u64,
    /// Newly inserted rows.
    pub successful: u64,
    /// Valid rows whose key was already present.
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

impl IngestReport {
    fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            total: 0,
            successful: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, msg: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(msg);
        }
    }
}

/// Split input text into objects. Entries that are not JSON objects come
/// back as `Err` with a location label.
pub fn parse_objects(text: &str) -> Result<Vec<std::result::Result<Map<String, Value>, String>>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| DashError::invalid(format!("Input is not a JSON array: {e}")))?;
        return Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, v)| match v {
                Value::Object(map) => Ok(map),
                other => Err(format!("item {}: expected an object, got {}", i + 1, kind(&other))),
            })
            .collect());
    }

    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("line {}: expected an object, got {}", n + 1, kind(&other))),
            Err(e) => Err(format!("line {}: {e}", n + 1)),
        })
        .collect())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ingest a file from disk.
pub async fn ingest_file(
    raw: &RawRecordStore,
    dataset: Dataset,
    path: &Path,
) -> Result<IngestReport> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DashError::io(path, e))?;
    info!(%dataset, path = %path.display(), "ingesting");
    ingest_str(raw, dataset, &text).await
}

#[instrument(skip_all, name = "ingest", fields(%dataset))]
pub async fn ingest_str(
    raw: &RawRecordStore,
    dataset: Dataset,
    text: &str,
) -> Result<IngestReport> {
    let config = dataset.config();
    let mut report = IngestReport::new(dataset);
    let mut batch: Vec<RawRecord> = Vec::with_capacity(INGEST_BATCH_SIZE);

    for parsed in parse_objects(text)? {
        report.total += 1;
        let record = match parsed {
            Ok(object) => RawRecord::from_object(config, &object).map_err(|e| {
                let id = object
                    .get(config.key_field)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                format!("{id}: {e}")
            }),
            Err(e) => Err(e),
        };
        match record {
            Ok(record) => batch.push(record),
            Err(e) => {
                report.failed += 1;
                report.error(e);
            }
        }
        if batch.len() >= INGEST_BATCH_SIZE {
            flush(raw, dataset, &mut batch, &mut report).await;
        }
    }
    flush(raw, dataset, &mut batch, &mut report).await;

    info!(
        total = report.total,
        successful = report.successful,
        skipped = report.skipped,
        failed = report.failed,
        "ingest finished"
    );
    Ok(report)
}

async fn flush(
    raw: &RawRecordStore,
    dataset: Dataset,
    batch: &mut Vec<RawRecord>,
    report: &mut IngestReport,
) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len() as u64;
    match raw.insert_many(dataset, batch).await {
        Ok(inserted) => {
            report.successful += inserted;
            report.skipped += size.saturating_sub(inserted);
        }
        Err(e) => {
            error!(error = %e, rows = size, "batch insert failed");
            report.failed += size;
            report.error(format!("Batch insert error: {e}"));
        }
    }
    batch.clear();
}
