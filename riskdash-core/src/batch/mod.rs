//! Bulk computation over a dataset.
//!
//! Ids are filtered (already cached, already processed in a resumed run),
//! split into fixed-size chunks and handed to at most `max_workers`
//! concurrent tasks. Each task walks its chunk sequentially through
//! [`FunctionResolver::compute_and_store`] and returns a [`ChunkTally`];
//! tallies are merged as tasks finish. Per-id failures are logged and
//! counted, never propagated.

pub mod resume;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::compute::Computable;
use crate::config::BatchSection;
use crate::datasets::Dataset;
use crate::error::Result;
use crate::progress::ProgressReporter;
use crate::resolver::FunctionResolver;

pub use resume::{ResumeState, ResumeTracker, run_resumable};

/// What to compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub dataset: Dataset,
    pub function: String,
    /// Explicit ids; `None` means every record in the dataset.
    pub ids: Option<Vec<String>>,
    /// Recompute ids that already have a cache entry.
    pub refresh: bool,
    /// Ids to leave out, e.g. those finished by an interrupted run.
    pub skip: HashSet<String>,
}

impl BatchJob {
    pub fn new(dataset: Dataset, function: impl Into<String>) -> Self {
        Self {
            dataset,
            function: function.into(),
            ids: None,
            refresh: false,
            skip: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

/// Concurrency and error-retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub max_workers: usize,
    pub chunk_size: usize,
    pub max_errors_per_chunk: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchSection::default())
    }
}

impl From<&BatchSection> for BatchOptions {
    fn from(section: &BatchSection) -> Self {
        Self {
            max_workers: section.max_workers.max(1),
            chunk_size: section.chunk_size.max(1),
            max_errors_per_chunk: section.max_errors_per_chunk,
        }
    }
}

/// Outcome of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTally {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    /// `"<id>: <error>"`, capped per chunk.
    pub errors: Vec<String>,
    pub succeeded_ids: Vec<String>,
}

/// Running totals across merged chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTotals {
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

impl BatchTotals {
    fn merge(&mut self, tally: &ChunkTally) {
        self.processed += tally.processed;
        self.successful += tally.successful;
        self.failed += tally.failed;
        self.errors.extend(tally.errors.iter().cloned());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    NothingToDo,
    Cancelled,
}

/// Final summary of a bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub dataset: Dataset,
    pub function: String,
    pub total: u64,
    /// Ids excluded before scheduling (cached or already processed).
    pub skipped: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
    /// Items per second; `None` when the elapsed time rounds to zero.
    pub rate: Option<f64>,
}

impl BatchReport {
    fn finish(
        status: BatchStatus,
        job: &BatchJob,
        skipped: u64,
        totals: BatchTotals,
        elapsed: Duration,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let rate = (elapsed.as_millis() > 0)
            .then(|| totals.processed as f64 / elapsed.as_secs_f64());
        Self {
            status,
            dataset: job.dataset,
            function: job.function.clone(),
            total: totals.total,
            skipped,
            processed: totals.processed,
            successful: totals.successful,
            failed: totals.failed,
            errors: totals.errors,
            elapsed_secs: elapsed.as_secs_f64(),
            rate,
        }
    }

    /// True when any item failed or a chunk task died before reporting.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.errors.is_empty()
    }
}

/// Hooks invoked as a run progresses. Called from the coordinating task only.
#[async_trait::async_trait]
pub trait BatchObserver: Send + Sync {
    fn on_start(&self, _total: u64) {}
    async fn on_chunk(&self, _tally: &ChunkTally, _totals: &BatchTotals) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Feeds chunk completions into a [`ProgressReporter`].
pub struct ReporterObserver<'a> {
    reporter: &'a dyn ProgressReporter,
    task: String,
}

impl std::fmt::Debug for ReporterObserver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReporterObserver")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl<'a> ReporterObserver<'a> {
    pub fn new(reporter: &'a dyn ProgressReporter, task: impl Into<String>) -> Self {
        Self {
            reporter,
            task: task.into(),
        }
    }
}

#[async_trait::async_trait]
impl BatchObserver for ReporterObserver<'_> {
    fn on_start(&self, total: u64) {
        self.reporter.start(&self.task, Some(total));
    }

    async fn on_chunk(&self, tally: &ChunkTally, _totals: &BatchTotals) {
        self.reporter.advance(tally.processed);
    }
}

/// Shared stop signal, checked before each chunk is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives the compute step across many ids with bounded parallelism.
#[derive(Debug)]
pub struct BatchProcessor {
    resolver: Arc<FunctionResolver>,
    options: BatchOptions,
    cancel: CancelFlag,
}

impl BatchProcessor {
    pub fn new(resolver: Arc<FunctionResolver>, options: BatchOptions) -> Self {
        Self {
            resolver,
            options,
            cancel: CancelFlag::default(),
        }
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn options(&self) -> BatchOptions {
        self.options
    }

    /// Ids the job would compute, in key order, plus how many were skipped.
    pub async fn plan(&self, job: &BatchJob) -> Result<(Vec<String>, u64)> {
        job.dataset.require_function(&job.function)?;
        let raw = self.resolver.raw();
        let all = raw.ids(job.dataset).await?;
        let candidates: Vec<String> = match &job.ids {
            Some(explicit) => {
                let known: HashSet<&str> = all.iter().map(String::as_str).collect();
                let mut wanted: Vec<String> = explicit
                    .iter()
                    .filter(|id| known.contains(id.as_str()))
                    .cloned()
                    .collect();
                wanted.sort();
                wanted.dedup();
                wanted
            }
            None => all,
        };

        let cached: HashSet<String> = if job.refresh {
            HashSet::new()
        } else {
            self.resolver
                .cache()
                .ids(job.dataset, &job.function)
                .await?
                .into_iter()
                .collect()
        };

        let before = candidates.len();
        let pending: Vec<String> = candidates
            .into_iter()
            .filter(|id| !cached.contains(id) && !job.skip.contains(id))
            .collect();
        let skipped = (before - pending.len()) as u64;
        Ok((pending, skipped))
    }

    /// Run `job` to completion or cancellation.
    pub async fn run(&self, job: &BatchJob, observer: &dyn BatchObserver) -> Result<BatchReport> {
        let compute = self
            .resolver
            .registry()
            .require(job.dataset, &job.function)?;
        let (pending, skipped) = self.plan(job).await?;
        let started = Instant::now();

        if pending.is_empty() {
            info!(dataset = %job.dataset, function = %job.function, skipped, "nothing to process");
            return Ok(BatchReport::finish(
                BatchStatus::NothingToDo,
                job,
                skipped,
                BatchTotals::default(),
                started.elapsed(),
            ));
        }

        let mut totals = BatchTotals {
            total: pending.len() as u64,
            ..BatchTotals::default()
        };
        observer.on_start(totals.total);
        info!(
            dataset = %job.dataset,
            function = %job.function,
            total = totals.total,
            skipped,
            workers = self.options.max_workers,
            chunk_size = self.options.chunk_size,
            "bulk run started"
        );

        let mut tasks: JoinSet<ChunkTally> = JoinSet::new();
        let mut cancelled = false;

        for chunk in pending.chunks(self.options.chunk_size) {
            while tasks.len() >= self.options.max_workers {
                if let Some(joined) = tasks.join_next().await {
                    merge_joined(joined, &mut totals, observer).await;
                }
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            tasks.spawn(process_chunk(
                Arc::clone(&self.resolver),
                Arc::clone(&compute),
                job.dataset,
                job.function.clone(),
                chunk.to_vec(),
                self.options.max_errors_per_chunk,
            ));
        }

        // In-flight chunks always run to completion.
        while let Some(joined) = tasks.join_next().await {
            merge_joined(joined, &mut totals, observer).await;
        }

        let status = if cancelled {
            warn!(processed = totals.processed, "bulk run cancelled at chunk boundary");
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        let report = BatchReport::finish(status, job, skipped, totals, started.elapsed());
        info!(
            dataset = %job.dataset,
            function = %job.function,
            processed = report.processed,
            successful = report.successful,
            failed = report.failed,
            elapsed_secs = report.elapsed_secs,
            "bulk run finished"
        );
        Ok(report)
    }
}

async fn merge_joined(
    joined: std::result::Result<ChunkTally, tokio::task::JoinError>,
    totals: &mut BatchTotals,
    observer: &dyn BatchObserver,
) {
    match joined {
        Ok(tally) => {
            totals.merge(&tally);
            observer.on_chunk(&tally, totals).await;
        }
        Err(e) => {
            error!(error = %e, "chunk task failed");
            totals.errors.push(format!("chunk task failed: {e}"));
        }
    }
}

async fn process_chunk(
    resolver: Arc<FunctionResolver>,
    compute: Arc<dyn Computable>,
    dataset: Dataset,
    function: String,
    ids: Vec<String>,
    max_errors: usize,
) -> ChunkTally {
    let mut tally = ChunkTally::default();
    for id in ids {
        match resolver
            .compute_and_store(dataset, &function, &id, compute.as_ref())
            .await
        {
            Ok(_) => {
                tally.successful += 1;
                tally.succeeded_ids.push(id);
            }
            Err(e) => {
                warn!(%dataset, function = %function, id = %id, error = %e, "bulk item failed");
                tally.failed += 1;
                if tally.errors.len() < max_errors {
                    tally.errors.push(format!("{id}: {e}"));
                }
            }
        }
        tally.processed += 1;
    }
    tally
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::compute::{Computation, ComputeInput, ComputeRegistry};
    use crate::store::Database;
    use crate::types::RawRecord;

    fn record(id: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            title: Some(format!("title {id}")),
            category: None,
            theme: None,
            subtheme: None,
            blob: None,
        }
    }

    async fn resolver(n: usize, registry: ComputeRegistry) -> Arc<FunctionResolver> {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let resolver = FunctionResolver::new(db, registry);
        let records: Vec<RawRecord> = (0..n).map(|i| record(&format!("ISS-{i:03}"))).collect();
        resolver
            .raw()
            .insert_many(Dataset::Issues, &records)
            .await
            .unwrap();
        Arc::new(resolver)
    }

    fn failing_on(bad: &'static [&'static str]) -> ComputeRegistry {
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "root_cause", move |input: ComputeInput| {
                if bad.contains(&input.id.as_str()) {
                    Computation::failed("model refused")
                } else {
                    Computation::ready(serde_json::json!({ "id": input.id }))
                }
            })
            .unwrap();
        registry
    }

    fn options(workers: usize, chunk: usize) -> BatchOptions {
        BatchOptions {
            max_workers: workers,
            chunk_size: chunk,
            max_errors_per_chunk: 2,
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Option<u64>>,
        chunks: Mutex<Vec<BatchTotals>>,
    }

    #[async_trait::async_trait]
    impl BatchObserver for Recorder {
        fn on_start(&self, total: u64) {
            *self.started.lock().unwrap() = Some(total);
        }

        async fn on_chunk(&self, _tally: &ChunkTally, totals: &BatchTotals) {
            self.chunks.lock().unwrap().push(totals.clone());
        }
    }

    #[tokio::test]
    async fn processes_everything_and_reports() {
        let resolver = resolver(23, failing_on(&[])).await;
        let processor = BatchProcessor::new(Arc::clone(&resolver), options(3, 5));
        let recorder = Recorder::default();

        let report = processor
            .run(&BatchJob::new(Dataset::Issues, "root_cause"), &recorder)
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!((report.total, report.processed, report.successful), (23, 23, 23));
        assert_eq!(report.failed, 0);
        assert_eq!(*recorder.started.lock().unwrap(), Some(23));

        let chunks = recorder.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.windows(2).all(|w| w[0].processed < w[1].processed));
        assert_eq!(chunks.last().unwrap().processed, 23);
        assert_eq!(
            resolver
                .cache()
                .count(Dataset::Issues, "root_cause")
                .await
                .unwrap(),
            23
        );
    }

    #[tokio::test]
    async fn cached_ids_skipped_unless_refresh() {
        let resolver = resolver(6, failing_on(&[])).await;
        let processor = BatchProcessor::new(Arc::clone(&resolver), options(2, 2));
        let job = BatchJob::new(Dataset::Issues, "root_cause")
            .with_ids(vec!["ISS-000".into(), "ISS-001".into()]);
        processor.run(&job, &NoopObserver).await.unwrap();

        let rest = processor
            .run(&BatchJob::new(Dataset::Issues, "root_cause"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!((rest.processed, rest.skipped), (4, 2));

        let again = processor
            .run(&BatchJob::new(Dataset::Issues, "root_cause"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(again.status, BatchStatus::NothingToDo);
        assert_eq!(again.processed, 0);

        let forced = processor
            .run(
                &BatchJob::new(Dataset::Issues, "root_cause").refresh(true),
                &NoopObserver,
            )
            .await
            .unwrap();
        assert_eq!(forced.processed, 6);
    }

    #[tokio::test]
    async fn failures_are_contained_and_capped() {
        let bad: &'static [&'static str] = &["ISS-000", "ISS-001", "ISS-002", "ISS-007"];
        let resolver = resolver(8, failing_on(bad)).await;
        let processor = BatchProcessor::new(Arc::clone(&resolver), options(2, 4));

        let report = processor
            .run(&BatchJob::new(Dataset::Issues, "root_cause"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!((report.successful, report.failed), (4, 4));
        assert!(report.has_failures());
        // First chunk had three failures, capped at two messages.
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors.iter().any(|e| e.starts_with("ISS-007: ")));
    }

    #[tokio::test]
    async fn unknown_explicit_ids_are_dropped() {
        let resolver = resolver(3, failing_on(&[])).await;
        let processor = BatchProcessor::new(resolver, options(1, 10));
        let job = BatchJob::new(Dataset::Issues, "root_cause").with_ids(vec![
            "ISS-002".into(),
            "GHOST".into(),
            "ISS-002".into(),
        ]);
        let (pending, _) = processor.plan(&job).await.unwrap();
        assert_eq!(pending, vec!["ISS-002"]);
    }

    #[tokio::test]
    async fn cancel_stops_dispatch_at_chunk_boundary() {
        let resolver = resolver(10, failing_on(&[])).await;
        let processor = BatchProcessor::new(resolver, options(1, 2));
        processor.cancel_flag().cancel();

        let report = processor
            .run(&BatchJob::new(Dataset::Issues, "root_cause"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(report.total, 10);
    }

    #[tokio::test]
    async fn invalid_function_fails_before_work() {
        let resolver = resolver(1, failing_on(&[])).await;
        let processor = BatchProcessor::new(resolver, BatchOptions::default());
        let err = processor
            .run(&BatchJob::new(Dataset::Issues, "controls_taxonomy"), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
