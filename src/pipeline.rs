use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::db::{CompanyRecord, RecordStore, SnapshotStore, SourceSnapshot};
use crate::error::PipelineError;
use crate::extractor::Fetcher;
use crate::parser;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cached,
    Accepted,
}

#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub source: Source,
    pub record: Option<CompanyRecord>,
    pub message: &'static str,
}

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Snapshot kept, transform recognised nothing.
    NoData,
    /// Non-2xx response: snapshot kept, not transformed.
    HttpStatus(u16),
    Failed(String),
}

impl RunStatus {
    /// Free-text token written to the status marker.
    pub fn marker(&self) -> String {
        match self {
            RunStatus::Completed => "completed".to_string(),
            RunStatus::NoData => "no_data".to_string(),
            RunStatus::HttpStatus(code) => format!("http_{}", code),
            RunStatus::Failed(_) => "failed".to_string(),
        }
    }
}

pub const IN_PROGRESS: &str = "in_progress";

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub idno: String,
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusView {
    pub marker: Option<String>,
    pub in_flight: bool,
    pub record: Option<CompanyRecord>,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    snapshots: Arc<dyn SnapshotStore>,
    records: Arc<dyn RecordStore>,
    cache: CacheStore,
    in_flight: DashSet<String>,
    permits: Arc<Semaphore>,
    outcomes: broadcast::Sender<RunOutcome>,
}

/// Cache-first entry point. Misses dispatch one background run per identifier.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Holds the single-flight slot for one identifier until dropped.
struct InFlightGuard {
    inner: Arc<Inner>,
    idno: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.idno);
    }
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        snapshots: Arc<dyn SnapshotStore>,
        records: Arc<dyn RecordStore>,
        cache: CacheStore,
        max_concurrent_runs: usize,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                snapshots,
                records,
                cache,
                in_flight: DashSet::new(),
                permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
                outcomes,
            }),
        }
    }

    /// Every finished run is published here.
    pub fn subscribe(&self) -> broadcast::Receiver<RunOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub async fn request(&self, idno: &str, force_refresh: bool) -> Result<RequestOutcome, PipelineError> {
        if !force_refresh {
            if let Some(record) = self.inner.cache.get(idno).await? {
                info!(idno = %idno, "cache hit");
                return Ok(RequestOutcome {
                    source: Source::Cached,
                    record: Some(record),
                    message: "Data retrieved from cache",
                });
            }
        }

        let message = match self.dispatch(idno).await {
            Some(_) => "Scraping started in background",
            None => "Scraping already in progress",
        };
        Ok(RequestOutcome {
            source: Source::Accepted,
            record: None,
            message,
        })
    }

    /// Start a run unless one is already in flight for `idno`.
    pub async fn dispatch(&self, idno: &str) -> Option<JoinHandle<RunOutcome>> {
        if !self.inner.in_flight.insert(idno.to_string()) {
            info!(idno = %idno, "run already in flight, not dispatching");
            return None;
        }
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            idno: idno.to_string(),
        };
        self.mark(idno, IN_PROGRESS).await;

        let this = self.clone();
        let idno = idno.to_string();
        Some(tokio::spawn(async move {
            let status = match Arc::clone(&this.inner.permits).acquire_owned().await {
                Ok(_permit) => this.run(&idno).await,
                Err(e) => RunStatus::Failed(format!("admission closed: {}", e)),
            };
            this.finish(idno, status, guard).await
        }))
    }

    /// Status marker plus the latest record: cache first, then the Record Store.
    pub async fn status(&self, idno: &str) -> Result<StatusView, PipelineError> {
        let marker = self.inner.cache.status(idno).await?;
        let record = match self.inner.cache.get(idno).await? {
            Some(record) => Some(record),
            None => self.inner.records.get(idno).await?,
        };
        Ok(StatusView {
            marker,
            in_flight: self.inner.in_flight.contains(idno),
            record,
        })
    }

    /// Drop the cached record; the next non-forced request dispatches a run.
    pub async fn invalidate(&self, idno: &str) -> Result<(), PipelineError> {
        self.inner.cache.delete(idno).await?;
        info!(idno = %idno, "cache invalidated");
        Ok(())
    }

    /// Fetch → snapshot → transform → record → cache, strictly in that order.
    async fn run(&self, idno: &str) -> RunStatus {
        let page = match self.inner.fetcher.fetch(idno).await {
            Ok(page) => page,
            Err(e) => {
                error!(idno = %idno, error = %e, "extraction failed");
                return RunStatus::Failed(e.to_string());
            }
        };

        let snapshot = SourceSnapshot {
            idno: idno.to_string(),
            url: page.url.clone(),
            raw_html: page.raw_html.clone(),
            status_code: page.status_code,
            fetched_at: Utc::now(),
        };
        if let Err(e) = self.inner.snapshots.append(snapshot).await {
            warn!(idno = %idno, error = %e, "snapshot write failed, continuing");
        }

        if !page.is_success() {
            warn!(idno = %idno, status = page.status_code, "non-success response, not transforming");
            return RunStatus::HttpStatus(page.status_code);
        }

        let owned_idno = idno.to_string();
        let transformed =
            tokio::task::spawn_blocking(move || parser::transform(&page.raw_html, &owned_idno)).await;
        let record = match transformed {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(idno = %idno, "transform recognised nothing");
                return RunStatus::NoData;
            }
            Err(e) => {
                error!(idno = %idno, error = %e, "transform task failed");
                return RunStatus::Failed(format!("transform: {}", e));
            }
        };

        if let Err(e) = self.inner.records.upsert(record.clone()).await {
            error!(idno = %idno, error = %e, "record write failed");
            return RunStatus::Failed(e.to_string());
        }
        if let Err(e) = self.inner.cache.set(&record).await {
            warn!(idno = %idno, error = %e, "cache write failed");
        }
        RunStatus::Completed
    }

    async fn finish(&self, idno: String, status: RunStatus, guard: InFlightGuard) -> RunOutcome {
        self.mark(&idno, &status.marker()).await;
        // Slot is free before anyone hears about the outcome.
        drop(guard);
        info!(idno = %idno, status = ?status, "run finished");
        let outcome = RunOutcome {
            idno,
            status,
            finished_at: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.inner.outcomes.send(outcome.clone());
        outcome
    }

    async fn mark(&self, idno: &str, marker: &str) {
        if let Err(e) = self.inner.cache.set_status(idno, marker).await {
            warn!(idno = %idno, error = %e, "status marker write failed");
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::{KeyValueStore, MemoryStore};
    use crate::db::{count_snapshots, Database};
    use crate::error::{ExtractionError, StoreError};
    use crate::extractor::FetchedPage;

    const ACME: &str = "<html><body><h1>Acme SRL</h1><p>Adresa</p>\
                        <p>mun. Chișinău, str. Ismail 34</p></body></html>";

    struct FakeFetcher {
        html: String,
        status: u16,
        fail: bool,
        gate: Option<Arc<Semaphore>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(html: &str, status: u16) -> Self {
            Self {
                html: html.to_string(),
                status,
                fail: false,
                gate: None,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn gated(html: &str, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(html, 200)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, idno: &str) -> Result<FetchedPage, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExtractionError::Timeout(30));
            }
            Ok(FetchedPage {
                url: format!("https://openmoney.md/companies/{}", idno),
                raw_html: self.html.clone(),
                status_code: self.status,
            })
        }
    }

    struct BrokenSnapshots;

    #[async_trait]
    impl SnapshotStore for BrokenSnapshots {
        async fn append(&self, _: SourceSnapshot) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    struct BrokenRecords;

    #[async_trait]
    impl RecordStore for BrokenRecords {
        async fn upsert(&self, _: CompanyRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<CompanyRecord>, StoreError> {
            Ok(None)
        }
    }

    /// Accepts status markers, refuses company records.
    struct RecordKeysDown(MemoryStore);

    #[async_trait]
    impl KeyValueStore for RecordKeysDown {
        async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            if key.starts_with("company:") {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.0.set_ex(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    fn cache_over(kv: Arc<dyn KeyValueStore>, record_ttl: Duration) -> CacheStore {
        CacheStore::new(kv, record_ttl, Duration::from_secs(30 * 60))
    }

    struct Harness {
        orch: Orchestrator,
        fetcher: Arc<FakeFetcher>,
        db: Database,
    }

    fn harness(fetcher: FakeFetcher, max_runs: usize) -> Harness {
        harness_with(fetcher, max_runs, None)
    }

    fn harness_with(
        fetcher: FakeFetcher,
        max_runs: usize,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Harness {
        let fetcher = Arc::new(fetcher);
        let db = Database::open_in_memory().unwrap();
        let cache = CacheStore::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(30 * 60),
        );
        let snapshots = snapshots.unwrap_or_else(|| Arc::new(db.clone()));
        let orch = Orchestrator::new(
            fetcher.clone(),
            snapshots,
            Arc::new(db.clone()),
            cache,
            max_runs,
        );
        Harness { orch, fetcher, db }
    }

    async fn snapshots_for(db: &Database, idno: &str) -> usize {
        let idno = idno.to_string();
        db.call(move |c| count_snapshots(c, &idno)).await.unwrap()
    }

    #[tokio::test]
    async fn miss_then_cache_hit() {
        let h = harness(FakeFetcher::new(ACME, 200), 4);
        let mut outcomes = h.orch.subscribe();

        let first = h.orch.request("X", false).await.unwrap();
        assert_eq!(first.source, Source::Accepted);
        assert!(first.record.is_none());

        let done = outcomes.recv().await.unwrap();
        assert_eq!(done.idno, "X");
        assert_eq!(done.status, RunStatus::Completed);

        let second = h.orch.request("X", false).await.unwrap();
        assert_eq!(second.source, Source::Cached);
        let record = second.record.unwrap();
        assert_eq!(record.company_name.as_deref(), Some("Acme SRL"));
        assert_eq!(record.address.as_deref(), Some("mun. Chișinău, str. Ismail 34"));
        assert_eq!(h.fetcher.calls(), 1);

        let stored = RecordStore::get(&h.db, "X").await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(snapshots_for(&h.db, "X").await, 1);
        let status = h.orch.status("X").await.unwrap();
        assert_eq!(status.marker.as_deref(), Some("completed"));
        assert!(!status.in_flight);
    }

    #[tokio::test]
    async fn force_refresh_always_dispatches() {
        let h = harness(FakeFetcher::new(ACME, 200), 4);
        h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert!(h.orch.cache().get("X").await.unwrap().is_some());

        let mut outcomes = h.orch.subscribe();
        let forced = h.orch.request("X", true).await.unwrap();
        assert_eq!(forced.source, Source::Accepted);
        assert!(forced.record.is_none());

        outcomes.recv().await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(snapshots_for(&h.db, "X").await, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_miss_but_status_reads_record_store() {
        let h = harness(FakeFetcher::new(ACME, 200), 4);
        h.orch.dispatch("X").await.unwrap().await.unwrap();
        h.orch.invalidate("X").await.unwrap();
        assert!(h.orch.cache().get("X").await.unwrap().is_none());

        let view = h.orch.status("X").await.unwrap();
        assert_eq!(
            view.record.and_then(|r| r.company_name).as_deref(),
            Some("Acme SRL")
        );

        let mut outcomes = h.orch.subscribe();
        assert_eq!(h.orch.request("X", false).await.unwrap().source, Source::Accepted);
        outcomes.recv().await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_dispatches_again() {
        let h = harness(FakeFetcher::new(ACME, 200), 4);
        h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert_eq!(h.orch.request("X", false).await.unwrap().source, Source::Cached);

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert!(h.orch.cache().get("X").await.unwrap().is_none());

        let mut outcomes = h.orch.subscribe();
        let again = h.orch.request("X", false).await.unwrap();
        assert_eq!(again.source, Source::Accepted);
        outcomes.recv().await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn unrecognised_page_keeps_snapshot_only() {
        let h = harness(FakeFetcher::new("<html><body><p>nimic</p></body></html>", 200), 4);
        let outcome = h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert_eq!(outcome.status, RunStatus::NoData);

        assert_eq!(snapshots_for(&h.db, "X").await, 1);
        assert!(RecordStore::get(&h.db, "X").await.unwrap().is_none());
        assert!(h.orch.cache().get("X").await.unwrap().is_none());
        assert_eq!(
            h.orch.status("X").await.unwrap().marker.as_deref(),
            Some("no_data")
        );
        // Still a miss afterwards, never a fabricated record.
        let again = h.orch.request("X", false).await.unwrap();
        assert_eq!(again.source, Source::Accepted);
        assert!(again.record.is_none());
    }

    #[tokio::test]
    async fn non_success_is_snapshotted_not_transformed() {
        let h = harness(FakeFetcher::new(ACME, 404), 4);
        let outcome = h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert_eq!(outcome.status, RunStatus::HttpStatus(404));
        assert_eq!(snapshots_for(&h.db, "X").await, 1);
        assert!(RecordStore::get(&h.db, "X").await.unwrap().is_none());
        assert_eq!(
            h.orch.status("X").await.unwrap().marker.as_deref(),
            Some("http_404")
        );
    }

    #[tokio::test]
    async fn extraction_failure_writes_nothing() {
        let mut fetcher = FakeFetcher::new(ACME, 200);
        fetcher.fail = true;
        let h = harness(fetcher, 4);
        let outcome = h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert!(matches!(outcome.status, RunStatus::Failed(_)));
        assert_eq!(snapshots_for(&h.db, "X").await, 0);
        assert!(h.orch.cache().get("X").await.unwrap().is_none());
        assert_eq!(
            h.orch.status("X").await.unwrap().marker.as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_stop_transform() {
        let h = harness_with(FakeFetcher::new(ACME, 200), 4, Some(Arc::new(BrokenSnapshots)));
        let outcome = h.orch.dispatch("X").await.unwrap().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(RecordStore::get(&h.db, "X").await.unwrap().is_some());
        assert!(h.orch.cache().get("X").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn record_write_failure_skips_cache() {
        let db = Database::open_in_memory().unwrap();
        let orch = Orchestrator::new(
            Arc::new(FakeFetcher::new(ACME, 200)),
            Arc::new(db.clone()),
            Arc::new(BrokenRecords),
            cache_over(Arc::new(MemoryStore::new()), Duration::from_secs(3600)),
            4,
        );
        let outcome = orch.dispatch("X").await.unwrap().await.unwrap();
        assert!(matches!(outcome.status, RunStatus::Failed(_)));
        assert_eq!(snapshots_for(&db, "X").await, 1);
        assert!(orch.cache().get("X").await.unwrap().is_none());
        assert_eq!(orch.status("X").await.unwrap().marker.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn cache_write_failure_still_completes() {
        let db = Database::open_in_memory().unwrap();
        let orch = Orchestrator::new(
            Arc::new(FakeFetcher::new(ACME, 200)),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            cache_over(
                Arc::new(RecordKeysDown(MemoryStore::new())),
                Duration::from_secs(3600),
            ),
            4,
        );
        let outcome = orch.dispatch("X").await.unwrap().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(RecordStore::get(&db, "X").await.unwrap().is_some());
        assert!(orch.cache().get("X").await.unwrap().is_none());
        assert_eq!(orch.status("X").await.unwrap().marker.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_does_not_strand_the_run() {
        let db = Database::open_in_memory().unwrap();
        let orch = Orchestrator::new(
            Arc::new(FakeFetcher::new(ACME, 200)),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            CacheStore::new(
                Arc::new(MemoryStore::new()),
                Duration::from_secs(u64::MAX),
                Duration::from_secs(u64::MAX),
            ),
            4,
        );
        let mut outcomes = orch.subscribe();
        let accepted = orch.request("X", false).await.unwrap();
        assert_eq!(accepted.source, Source::Accepted);

        let done = outcomes.recv().await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(RecordStore::get(&db, "X").await.unwrap().is_some());
        assert!(!orch.status("X").await.unwrap().in_flight);
    }

    #[tokio::test]
    async fn concurrent_requests_single_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeFetcher::gated(ACME, Arc::clone(&gate)), 4);
        let mut outcomes = h.orch.subscribe();

        let (a, b) = tokio::join!(h.orch.request("X", false), h.orch.request("X", false));
        let messages = [a.unwrap().message, b.unwrap().message];
        assert!(messages.contains(&"Scraping started in background"));
        assert!(messages.contains(&"Scraping already in progress"));
        assert!(h.orch.status("X").await.unwrap().in_flight);

        gate.add_permits(1);
        let done = outcomes.recv().await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.fetcher.max_active.load(Ordering::SeqCst), 1);

        // Slot released: the next forced request dispatches again.
        gate.add_permits(1);
        let forced = h.orch.request("X", true).await.unwrap();
        assert_eq!(forced.message, "Scraping started in background");
    }

    #[tokio::test]
    async fn admission_limit_bounds_concurrent_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(FakeFetcher::gated(ACME, Arc::clone(&gate)), 1);
        let mut outcomes = h.orch.subscribe();

        for id in ["A", "B", "C"] {
            assert!(h.orch.dispatch(id).await.is_some());
        }
        gate.add_permits(3);
        for _ in 0..3 {
            assert_eq!(outcomes.recv().await.unwrap().status, RunStatus::Completed);
        }
        assert_eq!(h.fetcher.calls(), 3);
        assert_eq!(h.fetcher.max_active.load(Ordering::SeqCst), 1);
    }
}
