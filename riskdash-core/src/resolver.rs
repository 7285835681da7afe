//! Cache-or-compute resolution for one `(dataset, function, id)` triple.
//!
//! ```text
//! resolve(req)
//!   ├─ function declared + registered?      no → InvalidArgument
//!   ├─ raw record exists?                   no → NotFound   (even if cache rows exist)
//!   ├─ !refresh && cache hit?              yes → source = cache (no writes)
//!   ├─ [in-flight lock, re-check cache]
//!   └─ compute → stamp → upsert            err → Compute (no writes)
//!                                           ok → source = computed
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};

use crate::compute::{Computable, ComputeInput, ComputeRegistry};
use crate::config::ResolverSection;
use crate::datasets::Dataset;
use crate::error::{DashError, Result};
use crate::store::{CacheStore, Database, RawRecordStore};
use crate::types::{CacheEntry, ResolveSource, Resolved};

/// One resolve call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub dataset: Dataset,
    pub function: String,
    pub id: String,
    pub refresh: bool,
    /// Extra fields overlaid on the record-derived context.
    pub context: Option<Map<String, Value>>,
}

impl ResolveRequest {
    pub fn new(dataset: Dataset, function: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            dataset,
            function: function.into(),
            id: id.into(),
            refresh: false,
            context: None,
        }
    }

    /// Build a request from a dataset name. Unknown names are `InvalidArgument`.
    pub fn parse(dataset: &str, function: &str, id: &str) -> Result<Self> {
        Ok(Self::new(dataset.parse()?, function, id))
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

/// Issues UTC timestamps at microsecond precision, each strictly later
/// than the one before it.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

type InflightKey = (Dataset, String, String);

/// Per-triple async locks, created on demand and dropped when unused.
#[derive(Debug, Default)]
struct InflightLocks {
    locks: Mutex<HashMap<InflightKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InflightLocks {
    async fn acquire(&self, key: InflightKey) -> InflightGuard<'_> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still holds belong to waiters that were
            // cancelled after the previous holder released.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        InflightGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct InflightGuard<'a> {
    owner: &'a InflightLocks,
    key: InflightKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}

/// Per-function cache coverage for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCoverage {
    pub function: String,
    pub computed: u64,
    pub pending: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub dataset: Dataset,
    pub total: u64,
    pub functions: Vec<FunctionCoverage>,
}

/// The cache-or-compute orchestrator.
#[derive(Debug)]
pub struct FunctionResolver {
    db: Arc<Database>,
    raw: RawRecordStore,
    cache: CacheStore,
    registry: Arc<ComputeRegistry>,
    clock: MonotonicClock,
    inflight: Option<InflightLocks>,
}

impl FunctionResolver {
    /// Resolver with in-flight dedupe enabled.
    pub fn new(db: Arc<Database>, registry: ComputeRegistry) -> Self {
        Self::with_config(db, registry, &ResolverSection::default())
    }

    pub fn with_config(
        db: Arc<Database>,
        registry: ComputeRegistry,
        config: &ResolverSection,
    ) -> Self {
        Self {
            raw: RawRecordStore::new(Arc::clone(&db)),
            cache: CacheStore::new(Arc::clone(&db)),
            db,
            registry: Arc::new(registry),
            clock: MonotonicClock::default(),
            inflight: config.dedupe_inflight.then(InflightLocks::default),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &ComputeRegistry {
        &self.registry
    }

    pub fn raw(&self) -> &RawRecordStore {
        &self.raw
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Return the cached result, or compute, store and return a fresh one.
    #[instrument(skip_all, name = "resolve", fields(
        dataset = %req.dataset,
        function = %req.function,
        id = %req.id,
        refresh = req.refresh,
    ))]
    pub async fn resolve(&self, req: &ResolveRequest) -> Result<Resolved> {
        let compute = self.registry.require(req.dataset, &req.function)?;
        let config = req.dataset.config();

        let record = self
            .raw
            .get(req.dataset, &req.id)
            .await?
            .ok_or_else(|| DashError::NotFound {
                dataset: req.dataset.to_string(),
                id: req.id.clone(),
            })?;

        if !req.refresh {
            if let Some(entry) = self.cache.get(req.dataset, &req.function, &req.id).await? {
                debug!("cache hit");
                return Ok(Resolved::from_entry(ResolveSource::Cache, entry));
            }
        }

        let mut context = record.context(config);
        if let Some(extra) = &req.context {
            context.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let _inflight = match &self.inflight {
            Some(locks) => {
                let guard = locks
                    .acquire((req.dataset, req.function.clone(), req.id.clone()))
                    .await;
                // Another caller may have filled the cache while we waited.
                if !req.refresh {
                    if let Some(entry) =
                        self.cache.get(req.dataset, &req.function, &req.id).await?
                    {
                        debug!("cache filled while waiting");
                        return Ok(Resolved::from_entry(ResolveSource::Cache, entry));
                    }
                }
                Some(guard)
            }
            None => None,
        };

        let entry = self
            .compute_with_context(req.dataset, &req.function, &req.id, context, compute.as_ref())
            .await?;
        Ok(Resolved::from_entry(ResolveSource::Computed, entry))
    }

    /// Look up the record, compute unconditionally and upsert the result.
    /// This is the write path shared with bulk runs; it never reads the cache.
    pub async fn compute_and_store(
        &self,
        dataset: Dataset,
        function: &str,
        id: &str,
        compute: &dyn Computable,
    ) -> Result<CacheEntry> {
        let record = self
            .raw
            .get(dataset, id)
            .await?
            .ok_or_else(|| DashError::NotFound {
                dataset: dataset.to_string(),
                id: id.to_string(),
            })?;
        let context = record.context(dataset.config());
        self.compute_with_context(dataset, function, id, context, compute)
            .await
    }

    async fn compute_with_context(
        &self,
        dataset: Dataset,
        function: &str,
        id: &str,
        context: Map<String, Value>,
        compute: &dyn Computable,
    ) -> Result<CacheEntry> {
        let input = ComputeInput {
            dataset,
            id: id.to_string(),
            context,
        };
        let payload = compute
            .compute(input)
            .resolve()
            .await
            .map_err(|source| {
                warn!(%dataset, function, id, error = %source, "compute failed");
                DashError::Compute {
                    function: function.to_string(),
                    id: id.to_string(),
                    source,
                }
            })?;

        let created_at = self.clock.now();
        self.cache
            .upsert(dataset, function, id, &payload, created_at)
            .await?;
        debug!(%dataset, function, id, "computed and stored");
        Ok(CacheEntry {
            payload,
            created_at,
        })
    }

    /// Every declared function's cache entry for `id`; missing ones map to `None`.
    #[instrument(skip(self), name = "get_all_results")]
    pub async fn get_all_results(
        &self,
        dataset: Dataset,
        id: &str,
    ) -> Result<BTreeMap<String, Option<CacheEntry>>> {
        let mut results = BTreeMap::new();
        for function in dataset.config().ai_functions {
            let entry = self.cache.get(dataset, function, id).await?;
            results.insert((*function).to_string(), entry);
        }
        Ok(results)
    }

    /// Delete cached rows. `None` widens the scope to every function / id.
    /// Returns the number of rows removed.
    #[instrument(skip(self), name = "clear_cache")]
    pub async fn clear_cache(
        &self,
        dataset: Dataset,
        function: Option<&str>,
        id: Option<&str>,
    ) -> Result<u64> {
        let functions: Vec<&str> = match function {
            Some(f) => {
                dataset.require_function(f)?;
                vec![f]
            }
            None => dataset.config().ai_functions.to_vec(),
        };

        let mut cleared = 0;
        for function in functions {
            cleared += self.cache.delete(dataset, function, id).await?;
        }
        debug!(cleared, "cache cleared");
        Ok(cleared)
    }

    /// Record count and per-function cache coverage.
    pub async fn coverage(&self, dataset: Dataset) -> Result<Coverage> {
        let total = self.raw.count(dataset).await?;
        let mut functions = Vec::new();
        for function in dataset.config().ai_functions {
            let computed = self.cache.count(dataset, function).await?.min(total);
            #[allow(clippy::cast_precision_loss)]
            let percentage = if total == 0 {
                0.0
            } else {
                (computed as f64 / total as f64 * 1000.0).round() / 10.0
            };
            functions.push(FunctionCoverage {
                function: (*function).to_string(),
                computed,
                pending: total - computed,
                percentage,
            });
        }
        Ok(Coverage {
            dataset,
            total,
            functions,
        })
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.as_ref().map_or(0, InflightLocks::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::compute::Computation;
    use crate::error::{ComputeError, ErrorKind};
    use crate::types::RawRecord;

    fn issue(id: &str, title: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            title: Some(title.into()),
            category: Some("Incident".into()),
            theme: Some("Technology".into()),
            subtheme: None,
            blob: None,
        }
    }

    async fn resolver_with(registry: ComputeRegistry, dedupe: bool) -> FunctionResolver {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let resolver = FunctionResolver::with_config(
            db,
            registry,
            &ResolverSection {
                dedupe_inflight: dedupe,
            },
        );
        resolver
            .raw()
            .insert_many(
                Dataset::Issues,
                &[issue("ISS-1", "Payment gateway timeout"), issue("ISS-2", "Batch job overrun")],
            )
            .await
            .unwrap();
        resolver
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Computable + 'static {
        let counter = Arc::clone(counter);
        move |input: ComputeInput| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Computation::ready(serde_json::json!({ "id": input.id, "call": n }))
        }
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            assert_eq!(next.timestamp_subsec_nanos() % 1000, 0);
            prev = next;
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "root_cause", counting(&calls))
            .unwrap();
        let resolver = resolver_with(registry, true).await;
        let req = ResolveRequest::new(Dataset::Issues, "root_cause", "ISS-1");

        let first = resolver.resolve(&req).await.unwrap();
        assert_eq!(first.source, ResolveSource::Computed);
        let second = resolver.resolve(&req).await.unwrap();
        assert_eq!(second.source, ResolveSource::Cache);
        assert_eq!(second.payload, first.payload);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.inflight_len(), 0);
    }

    #[tokio::test]
    async fn invalid_function_checked_before_storage() {
        let resolver = resolver_with(ComputeRegistry::with_mock_functions(), true).await;
        let err = resolver
            .resolve(&ResolveRequest::new(Dataset::Issues, "controls_taxonomy", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = ResolveRequest::parse("payments", "root_cause", "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn unregistered_function_is_invalid() {
        let resolver = resolver_with(ComputeRegistry::new(), true).await;
        let err = resolver
            .resolve(&ResolveRequest::new(Dataset::Issues, "root_cause", "ISS-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn compute_failure_writes_nothing() {
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "enrichment", |_: ComputeInput| {
                Computation::Ready(Err(ComputeError::Failed("model offline".into())))
            })
            .unwrap();
        let resolver = resolver_with(registry, false).await;
        let err = resolver
            .resolve(&ResolveRequest::new(Dataset::Issues, "enrichment", "ISS-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComputeFailure);
        assert!(err.to_string().contains("model offline"));
        assert_eq!(
            resolver
                .cache()
                .count(Dataset::Issues, "enrichment")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn caller_context_overlays_record_context() {
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "enrichment", |input: ComputeInput| {
                Computation::ready(Value::Object(input.context))
            })
            .unwrap();
        let resolver = resolver_with(registry, true).await;
        let mut extra = Map::new();
        extra.insert("risk_theme".into(), "Fraud".into());
        extra.insert("analyst".into(), "kim".into());

        let out = resolver
            .resolve(
                &ResolveRequest::new(Dataset::Issues, "enrichment", "ISS-1").with_context(extra),
            )
            .await
            .unwrap();
        assert_eq!(out.payload["issue_title"], "Payment gateway timeout");
        assert_eq!(out.payload["risk_theme"], "Fraud");
        assert_eq!(out.payload["analyst"], "kim");
    }

    #[tokio::test]
    async fn concurrent_misses_compute_once_with_dedupe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "slow_enrichment", move |input: ComputeInput| {
                counter.fetch_add(1, Ordering::SeqCst);
                Computation::pending(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(serde_json::json!({ "id": input.id }))
                })
            })
            .unwrap();
        let resolver = Arc::new(resolver_with(registry, true).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(&ResolveRequest::new(Dataset::Issues, "slow_enrichment", "ISS-1"))
                    .await
                    .unwrap()
            }));
        }
        let mut computed = 0;
        for handle in handles {
            if handle.await.unwrap().source == ResolveSource::Computed {
                computed += 1;
            }
        }
        assert_eq!(computed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.inflight_len(), 0);
    }

    #[tokio::test]
    async fn pending_compute_does_not_block_other_ids() {
        let mut registry = ComputeRegistry::new();
        registry
            .register(Dataset::Issues, "slow_enrichment", |input: ComputeInput| {
                let delay = if input.id == "ISS-1" { 500 } else { 0 };
                Computation::pending(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(serde_json::json!(input.id))
                })
            })
            .unwrap();
        let resolver = Arc::new(resolver_with(registry, true).await);

        let slow = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                resolver
                    .resolve(&ResolveRequest::new(Dataset::Issues, "slow_enrichment", "ISS-1"))
                    .await
            })
        };
        let fast = tokio::time::timeout(
            Duration::from_millis(250),
            resolver.resolve(&ResolveRequest::new(Dataset::Issues, "slow_enrichment", "ISS-2")),
        )
        .await
        .expect("unrelated resolve should not wait for the slow one")
        .unwrap();
        assert_eq!(fast.payload, "ISS-2");
        assert_eq!(slow.await.unwrap().unwrap().payload, "ISS-1");
    }

    #[tokio::test]
    async fn get_all_results_marks_absent() {
        let resolver = resolver_with(ComputeRegistry::with_mock_functions(), true).await;
        resolver
            .resolve(&ResolveRequest::new(Dataset::Issues, "root_cause", "ISS-1"))
            .await
            .unwrap();
        let all = resolver
            .get_all_results(Dataset::Issues, "ISS-1")
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all["root_cause"].is_some());
        assert!(all["issue_taxonomy"].is_none());
        assert!(all["enrichment"].is_none());
    }

    #[tokio::test]
    async fn coverage_counts_per_function() {
        let resolver = resolver_with(ComputeRegistry::with_mock_functions(), true).await;
        resolver
            .resolve(&ResolveRequest::new(Dataset::Issues, "root_cause", "ISS-1"))
            .await
            .unwrap();
        let coverage = resolver.coverage(Dataset::Issues).await.unwrap();
        assert_eq!(coverage.total, 2);
        let root = coverage
            .functions
            .iter()
            .find(|f| f.function == "root_cause")
            .unwrap();
        assert_eq!((root.computed, root.pending), (1, 1));
        assert!((root.percentage - 50.0).abs() < f64::EPSILON);

        let empty = resolver.coverage(Dataset::Controls).await.unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.functions.iter().all(|f| f.percentage == 0.0));
    }

    #[tokio::test]
    async fn clear_cache_rejects_unknown_function() {
        let resolver = resolver_with(ComputeRegistry::with_mock_functions(), true).await;
        let err = resolver
            .clear_cache(Dataset::Issues, Some("nope"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            resolver.clear_cache(Dataset::Issues, None, None).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leave_a_lock_behind() {
        let locks = InflightLocks::default();
        let key = (Dataset::Issues, "root_cause".to_string(), "ISS-1".to_string());

        let holder = locks.acquire(key.clone()).await;
        let mut waiter = Box::pin(locks.acquire(key));
        assert!(
            tokio::time::timeout(Duration::from_millis(5), &mut waiter)
                .await
                .is_err()
        );
        // Released while the waiter is still queued, then the waiter gives up.
        drop(holder);
        drop(waiter);
        assert_eq!(locks.len(), 1);

        let other = locks
            .acquire((Dataset::Controls, "enrichment".to_string(), "CTL-1".to_string()))
            .await;
        assert_eq!(locks.len(), 1);
        drop(other);
        assert_eq!(locks.len(), 0);
    }
}
