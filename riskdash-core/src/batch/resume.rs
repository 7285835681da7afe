//! Resume side-file for bulk runs.
//!
//! One pretty-printed JSON file per `(dataset, function)` under the resume
//! directory. It lists the ids already stored by an earlier, interrupted or
//! partially failed run with the same `refresh` setting. Files written for a
//! different dataset, function or refresh flag are ignored.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    BatchJob, BatchObserver, BatchProcessor, BatchReport, BatchStatus, BatchTotals, ChunkTally,
};
use crate::datasets::Dataset;
use crate::error::{BatchError, Result};

/// On-disk shape of the side-file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub dataset: String,
    #[serde(rename = "ai_function")]
    pub function: String,
    pub refresh: bool,
    /// Serialized as a sorted list.
    pub processed_ids: BTreeSet<String>,
}

impl ResumeState {
    fn empty(dataset: Dataset, function: &str, refresh: bool) -> Self {
        Self {
            dataset: dataset.to_string(),
            function: function.to_string(),
            refresh,
            processed_ids: BTreeSet::new(),
        }
    }

    fn matches(&self, dataset: Dataset, function: &str, refresh: bool) -> bool {
        self.dataset == dataset.as_str() && self.function == function && self.refresh == refresh
    }
}

/// Loads, updates and persists one side-file.
#[derive(Debug)]
pub struct ResumeTracker {
    path: PathBuf,
    state: ResumeState,
    resumed: usize,
}

impl ResumeTracker {
    /// `<dir>/<dataset>_<function>.json`
    pub fn path_for(dir: &Path, dataset: Dataset, function: &str) -> PathBuf {
        dir.join(format!("{dataset}_{function}.json"))
    }

    /// Load the side-file for this run. A missing, unreadable or mismatched
    /// file yields an empty tracker.
    pub fn load(dir: &Path, dataset: Dataset, function: &str, refresh: bool) -> Self {
        let path = Self::path_for(dir, dataset, function);
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<ResumeState>(&text) {
                Ok(state) if state.matches(dataset, function, refresh) => state,
                Ok(_) => {
                    info!(path = %path.display(), "resume file is for a different run, ignoring");
                    ResumeState::empty(dataset, function, refresh)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable resume file, ignoring");
                    ResumeState::empty(dataset, function, refresh)
                }
            },
            Err(_) => ResumeState::empty(dataset, function, refresh),
        };
        let resumed = state.processed_ids.len();
        if resumed > 0 {
            info!(path = %path.display(), resumed, "resuming bulk run");
        }
        Self {
            path,
            state,
            resumed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn processed(&self) -> &BTreeSet<String> {
        &self.state.processed_ids
    }

    /// Ids carried over from the file when it was loaded.
    pub fn resumed(&self) -> usize {
        self.resumed
    }

    pub fn mark<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .processed_ids
            .extend(ids.into_iter().map(Into::into));
    }

    /// Write the file durably: temp file, fsync, rename, fsync the directory.
    pub fn save(&self) -> std::result::Result<(), BatchError> {
        write_state(&self.path, &self.state)
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_async(&self) -> std::result::Result<(), BatchError> {
        let path = self.path.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || write_state(&path, &state))
            .await
            .map_err(|e| BatchError::Io(std::io::Error::other(e)))?
    }

    /// Remove the file. Missing is fine.
    pub fn clear(&self) -> std::result::Result<(), BatchError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "resume file cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_state(path: &Path, state: &ResumeState) -> std::result::Result<(), BatchError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(state)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    sync_dir(parent.unwrap_or_else(|| Path::new(".")));
    debug!(path = %path.display(), ids = state.processed_ids.len(), "resume file saved");
    Ok(())
}

/// Persist the rename itself.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory fsync skipped");
    }
}

/// Directories cannot be opened for syncing here.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Marks successful ids and saves after every chunk, then forwards to the
/// caller's observer.
struct ResumeObserver<'a> {
    tracker: Mutex<&'a mut ResumeTracker>,
    inner: &'a dyn BatchObserver,
}

#[async_trait::async_trait]
impl BatchObserver for ResumeObserver<'_> {
    fn on_start(&self, total: u64) {
        self.inner.on_start(total);
    }

    async fn on_chunk(&self, tally: &ChunkTally, totals: &BatchTotals) {
        {
            let mut tracker = self.tracker.lock().await;
            tracker.mark(tally.succeeded_ids.iter().cloned());
            if let Err(e) = tracker.save_async().await {
                warn!(error = %e, "could not save resume file");
            }
        }
        self.inner.on_chunk(tally, totals).await;
    }
}

/// Run `job` with resume bookkeeping under `dir`.
///
/// Ids recorded by a matching earlier run are skipped. The file is removed
/// once a run completes with no failures (or has nothing left to do) and is
/// kept after failures or cancellation.
pub async fn run_resumable(
    processor: &BatchProcessor,
    mut job: BatchJob,
    dir: &Path,
    observer: &dyn BatchObserver,
) -> Result<BatchReport> {
    let mut tracker = ResumeTracker::load(dir, job.dataset, &job.function, job.refresh);
    job.skip.extend(tracker.processed().iter().cloned());

    let outcome = {
        let resume_observer = ResumeObserver {
            tracker: Mutex::new(&mut tracker),
            inner: observer,
        };
        processor.run(&job, &resume_observer).await
    };

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            if !tracker.processed().is_empty() {
                tracker.save_async().await?;
            }
            return Err(e);
        }
    };

    match report.status {
        BatchStatus::NothingToDo => tracker.clear()?,
        BatchStatus::Completed if !report.has_failures() => tracker.clear()?,
        BatchStatus::Completed | BatchStatus::Cancelled => {
            tracker.save_async().await?;
            info!(
                path = %tracker.path().display(),
                processed = tracker.processed().len(),
                "progress kept for resume"
            );
        }
    }
    Ok(report)
}
