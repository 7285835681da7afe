//! Dump one function's cached results alongside the source records.
//!
//! Output is JSON lines ordered by record key. Each line is the hydrated
//! record (stored blob, with the dataset's scalar columns filled in under
//! both their dataset-specific and generic names) plus one field named after
//! the function, holding the payload or `null` when nothing is cached.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::datasets::{Dataset, DatasetConfig};
use crate::error::{DashError, Result};
use crate::progress::ProgressReporter;
use crate::store::{CacheStore, RawRecordStore};
use crate::types::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub rows: u64,
    /// Rows without a cached result.
    pub missing: u64,
}

/// `<dataset>_<function>_export.jsonl` in the working directory.
pub fn default_export_path(dataset: Dataset, function: &str) -> PathBuf {
    PathBuf::from(format!("{dataset}_{function}_export.jsonl"))
}

/// Record fields as exported: blob first, then any missing scalar fields.
pub fn hydrate(config: &DatasetConfig, record: &RawRecord) -> Map<String, Value> {
    let mut out = match &record.blob {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("raw_data".into(), other.clone());
            map
        }
        None => Map::new(),
    };

    let text = |v: &Option<String>| Value::String(v.clone().unwrap_or_default());
    let mut fill = |field: &str, value: Value| {
        out.entry(field.to_string()).or_insert(value);
    };

    fill(config.key_field, Value::String(record.id.clone()));
    fill(config.title_field, text(&record.title));
    if let Some(field) = config.category_field {
        fill(field, text(&record.category));
    }
    fill(config.theme_field, text(&record.theme));
    if let Some(field) = config.subtheme_field {
        fill(field, text(&record.subtheme));
    }

    fill("title", text(&record.title));
    fill("category", text(&record.category));
    fill("risk_theme", text(&record.theme));
    fill("risk_subtheme", text(&record.subtheme));
    out
}

/// Write every record of `dataset` with its `function` result to `path`.
#[instrument(skip_all, name = "export", fields(%dataset, function))]
pub async fn export_function(
    raw: &RawRecordStore,
    cache: &CacheStore,
    dataset: Dataset,
    function: &str,
    path: &Path,
    reporter: &dyn ProgressReporter,
) -> Result<ExportReport> {
    dataset.require_function(function)?;
    let config = dataset.config();
    let records = raw.all(dataset).await?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DashError::io(parent, e))?;
    }
    let file = std::fs::File::create(path).map_err(|e| DashError::io(path, e))?;
    let mut out = BufWriter::new(file);

    reporter.start(&format!("Export {dataset}:{function}"), Some(records.len() as u64));
    let mut missing = 0u64;
    for record in &records {
        let mut line = hydrate(config, record);
        let payload = match cache.get(dataset, function, &record.id).await? {
            Some(entry) => entry.payload,
            None => {
                missing += 1;
                Value::Null
            }
        };
        line.insert(function.to_string(), payload);

        serde_json::to_writer(&mut out, &line).map_err(|e| DashError::io(path, e.into()))?;
        out.write_all(b"\n").map_err(|e| DashError::io(path, e))?;
        reporter.advance(1);
    }
    out.flush().map_err(|e| DashError::io(path, e))?;
    reporter.finish();

    let report = ExportReport {
        path: path.to_path_buf(),
        rows: records.len() as u64,
        missing,
    };
    info!(rows = report.rows, missing, path = %path.display(), "export written");
    Ok(report)
}
