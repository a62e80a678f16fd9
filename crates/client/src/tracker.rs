// crates/client/src/tracker.rs
//! Per-job synchronization controller.
//!
//! A [`JobTracker`] runs two tasks under one cancellation token:
//! - the stream reader follows the job's event stream, reconnecting with
//!   exponential backoff, and degrades to polling-only after
//!   `max_stream_attempts` failures;
//! - the poller folds a snapshot every `poll_interval`.
//!
//! Both feed the same [`JobView`] through the merge rule. The first task to
//! see `ok=true` claims the result fetch; nobody else ever fetches. Any
//! terminal outcome settles the tracker and stops both tasks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docjobs_core::{JobId, LogLevel};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{JobApi, StreamItem, Upload};
use crate::error::{ClientError, ClientResult};
use crate::persist::TrackedJobStore;
use crate::view::{JobView, SyncPhase, DEFAULT_LOG_CAPACITY};

/// Timing knobs for a tracker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Stream connection attempts before giving up on the stream.
    pub max_stream_attempts: u32,
    pub log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_stream_attempts: 5,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Progress of the single result fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    Fetched,
    Failed(String),
}

struct Shared {
    job_id: JobId,
    api: Arc<dyn JobApi>,
    store: Option<Arc<dyn TrackedJobStore>>,
    config: SyncConfig,
    cancel: CancellationToken,
    view: Mutex<JobView>,
    view_tx: watch::Sender<JobView>,
    fetch_claimed: AtomicBool,
    fetch_count: AtomicUsize,
    fetch: Mutex<FetchState>,
    artifact: Mutex<Option<String>>,
}

impl Shared {
    /// Mutate the view under its lock and publish it when `f` reports a
    /// change. Nothing is applied once the tracker is cancelled.
    fn fold(&self, f: impl FnOnce(&mut JobView) -> bool) -> bool {
        let mut view = match self.view.lock() {
            Ok(view) => view,
            Err(e) => {
                tracing::error!("JobView mutex poisoned: {e}");
                return false;
            }
        };
        if self.cancel.is_cancelled() {
            return false;
        }
        let changed = f(&mut view);
        if changed {
            self.view_tx.send_replace(view.clone());
        }
        changed
    }

    fn current_ok(&self) -> Option<bool> {
        match self.view.lock() {
            Ok(view) => view.ok(),
            Err(e) => {
                tracing::error!("JobView mutex poisoned: {e}");
                None
            }
        }
    }

    fn set_fetch(&self, state: FetchState) {
        match self.fetch.lock() {
            Ok(mut fetch) => *fetch = state,
            Err(e) => tracing::error!("fetch state mutex poisoned: {e}"),
        }
    }

    /// Act on the outcome after a fold: fetch on success, settle on failure.
    async fn react(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.current_ok() {
            Some(true) => {
                if self
                    .fetch_claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.fetch_result().await;
                }
            }
            Some(false) => self.settle().await,
            None => {}
        }
    }

    async fn fetch_result(self: &Arc<Self>) {
        self.fetch_count.fetch_add(1, Ordering::AcqRel);
        self.set_fetch(FetchState::Fetching);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.release_claim();
                return;
            }
            outcome = self.api.result(&self.job_id) => outcome,
        };

        match outcome {
            Ok(markdown) => {
                tracing::info!(job_id = %self.job_id, bytes = markdown.len(), "result retrieved");
                match self.artifact.lock() {
                    Ok(mut artifact) => *artifact = Some(markdown),
                    Err(e) => tracing::error!("artifact mutex poisoned: {e}"),
                }
                self.set_fetch(FetchState::Fetched);
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "result fetch failed");
                self.fold(|view| {
                    view.note(LogLevel::Error, format!("result fetch failed: {e}"));
                    true
                });
                self.set_fetch(FetchState::Failed(e.to_string()));
            }
        }
        self.settle().await;
    }

    /// Give the claim back after a fetch interrupted mid-flight. A fetch
    /// that already finished, either way, keeps its claim and its state.
    fn release_claim(&self) {
        let mut fetch = match self.fetch.lock() {
            Ok(fetch) => fetch,
            Err(e) => {
                tracing::error!("fetch state mutex poisoned: {e}");
                return;
            }
        };
        if *fetch == FetchState::Fetching {
            *fetch = FetchState::Idle;
            self.fetch_claimed.store(false, Ordering::Release);
        }
    }

    async fn forget(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear(&self.job_id).await {
                tracing::warn!(job_id = %self.job_id, error = %e, "failed to clear tracked job");
            }
        }
    }

    /// Persistence is cleared before the view reports `Settled`.
    async fn settle(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.forget().await;
        self.fold(|view| view.set_phase(SyncPhase::Settled));
        self.cancel.cancel();
    }

    async fn lose(&self) {
        if self.cancel.is_cancelled() || self.current_ok().is_some() {
            return;
        }
        tracing::info!(job_id = %self.job_id, "job no longer known to the server");
        self.forget().await;
        self.fold(JobView::mark_lost);
        self.cancel.cancel();
    }
}

/// Follow the event stream, reconnecting with backoff.
async fn run_stream(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut backoff = config.initial_backoff;
    let mut failures = 0u32;

    loop {
        let opened = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            opened = shared.api.events(&shared.job_id) => opened,
        };

        match opened {
            Ok(mut stream) => {
                shared.fold(|view| view.set_phase(SyncPhase::Streaming));
                backoff = config.initial_backoff;
                failures = 0;
                loop {
                    let item = tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(StreamItem::Event(event))) => {
                            shared.fold(|view| view.apply_event(&event));
                            if event.is_terminal() {
                                shared.react().await;
                            }
                        }
                        Some(Ok(StreamItem::Malformed(detail))) => {
                            tracing::debug!(job_id = %shared.job_id, detail = %detail, "skipping malformed event");
                            shared.fold(|view| {
                                view.note(LogLevel::Warn, format!("malformed event skipped: {detail}"));
                                true
                            });
                        }
                        Some(Err(e)) => {
                            tracing::debug!(job_id = %shared.job_id, error = %e, "event stream failed");
                            break;
                        }
                        None => break,
                    }
                }
                // A stream that ended after the outcome has nothing left to say.
                if shared.current_ok().is_some() {
                    return;
                }
            }
            Err(ClientError::NotFound(_)) => {
                shared.lose().await;
                return;
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(job_id = %shared.job_id, error = %e, "event stream unavailable");
            }
            Err(e) => {
                tracing::warn!(job_id = %shared.job_id, error = %e, "event stream rejected; polling only");
                shared.fold(|view| view.set_phase(SyncPhase::Polling));
                return;
            }
        }

        failures += 1;
        shared.fold(|view| view.set_phase(SyncPhase::Polling));
        if failures >= config.max_stream_attempts {
            tracing::info!(job_id = %shared.job_id, failures, "giving up on event stream; polling only");
            return;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// Fold a snapshot every poll interval.
async fn run_poller(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let snapshot = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            snapshot = shared.api.snapshot(&shared.job_id) => snapshot,
        };
        match snapshot {
            Ok(record) => {
                shared.fold(|view| view.apply_record(&record));
                shared.react().await;
            }
            Err(ClientError::NotFound(_)) => {
                shared.lose().await;
                return;
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(job_id = %shared.job_id, error = %e, "snapshot poll failed");
            }
            Err(e) => {
                tracing::warn!(job_id = %shared.job_id, error = %e, "snapshot poll rejected");
            }
        }
    }
}

/// Keeps one job's [`JobView`] in sync with the server.
pub struct JobTracker {
    shared: Arc<Shared>,
    view_rx: watch::Receiver<JobView>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobTracker {
    /// Start tracking `job_id` without persistence.
    pub fn attach(api: Arc<dyn JobApi>, job_id: impl Into<JobId>, config: SyncConfig) -> Self {
        Self::spawn(api, job_id.into(), None, config)
    }

    /// Submit an upload, remember the new job id, and start tracking it.
    pub async fn submit(
        api: Arc<dyn JobApi>,
        store: Arc<dyn TrackedJobStore>,
        upload: Upload,
        config: SyncConfig,
    ) -> ClientResult<Self> {
        let submitted = api.submit(upload).await?;
        tracing::info!(job_id = %submitted.job_id, "job submitted");
        store.save(&submitted.job_id).await?;
        Ok(Self::spawn(api, submitted.job_id, Some(store), config))
    }

    /// Remember an existing job id and start tracking it.
    pub async fn track(
        api: Arc<dyn JobApi>,
        store: Arc<dyn TrackedJobStore>,
        job_id: impl Into<JobId>,
        config: SyncConfig,
    ) -> ClientResult<Self> {
        let job_id = job_id.into();
        store.save(&job_id).await?;
        Ok(Self::spawn(api, job_id, Some(store), config))
    }

    /// Re-attach to the job remembered in `store`, if any.
    pub async fn resume(
        api: Arc<dyn JobApi>,
        store: Arc<dyn TrackedJobStore>,
        config: SyncConfig,
    ) -> ClientResult<Option<Self>> {
        let Some(job_id) = store.load().await? else {
            return Ok(None);
        };
        tracing::info!(job_id = %job_id, "resuming tracked job");
        Ok(Some(Self::spawn(api, job_id, Some(store), config)))
    }

    fn spawn(
        api: Arc<dyn JobApi>,
        job_id: JobId,
        store: Option<Arc<dyn TrackedJobStore>>,
        config: SyncConfig,
    ) -> Self {
        let view = JobView::with_log_capacity(job_id.clone(), config.log_capacity);
        let (view_tx, view_rx) = watch::channel(view.clone());
        let shared = Arc::new(Shared {
            job_id,
            api,
            store,
            config,
            cancel: CancellationToken::new(),
            view: Mutex::new(view),
            view_tx,
            fetch_claimed: AtomicBool::new(false),
            fetch_count: AtomicUsize::new(0),
            fetch: Mutex::new(FetchState::Idle),
            artifact: Mutex::new(None),
        });

        let tasks = vec![
            tokio::spawn(run_stream(Arc::clone(&shared))),
            tokio::spawn(run_poller(Arc::clone(&shared))),
        ];
        Self {
            shared,
            view_rx,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.shared.job_id
    }

    /// Latest published view.
    pub fn view(&self) -> JobView {
        self.view_rx.borrow().clone()
    }

    /// Receiver that changes whenever the view does.
    pub fn watch(&self) -> watch::Receiver<JobView> {
        self.view_rx.clone()
    }

    /// Wait until the tracker settles or is detached, and return the view.
    pub async fn settled(&self) -> JobView {
        let mut rx = self.view_rx.clone();
        tokio::select! {
            _ = self.shared.cancel.cancelled() => {}
            _ = rx.wait_for(JobView::is_settled) => {}
        }
        self.view()
    }

    /// The fetched Markdown, once retrieved.
    pub fn artifact(&self) -> Option<String> {
        match self.shared.artifact.lock() {
            Ok(artifact) => artifact.clone(),
            Err(e) => {
                tracing::error!("artifact mutex poisoned: {e}");
                None
            }
        }
    }

    /// How many result fetches were started. Never more than one.
    pub fn fetch_count(&self) -> usize {
        self.shared.fetch_count.load(Ordering::Acquire)
    }

    pub fn fetch_state(&self) -> FetchState {
        match self.shared.fetch.lock() {
            Ok(fetch) => fetch.clone(),
            Err(e) => {
                tracing::error!("fetch state mutex poisoned: {e}");
                FetchState::Idle
            }
        }
    }

    /// Whether the result fetch is currently claimed.
    pub fn fetch_claimed(&self) -> bool {
        self.shared.fetch_claimed.load(Ordering::Acquire)
    }

    /// Stop both tasks and wait for them. The view is left as it was.
    pub async fn detach(&self) {
        self.shared.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(e) => {
                tracing::error!("tracker task list poisoned: {e}");
                return;
            }
        };
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(job_id = %self.shared.job_id, error = %e, "tracker task failed");
                }
            }
        }
        // An aborted fetch never reached its own release.
        self.shared.release_claim();
    }

    /// Detach and forget the persisted job id.
    pub async fn clear(&self) -> ClientResult<()> {
        self.detach().await;
        if let Some(store) = &self.shared.store {
            store.clear(&self.shared.job_id).await?;
        }
        Ok(())
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EventStream, Submitted};
    use crate::persist::MemoryTrackedJobStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use docjobs_core::{
        HistoryQuery, HistoryRow, JobEvent, JobRecord, Stage, StateUpdate,
    };
    use std::collections::VecDeque;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(stage: Stage, percent: u8, ok: Option<bool>) -> JobRecord {
        let mut record = JobRecord::new("j1", "a.pdf", at(0));
        record.stage = stage;
        record.percent = percent;
        record.ok = ok;
        record.updated_at = at(percent as i64);
        match ok {
            Some(true) => record.result_path = Some("/out/j1/a.md".into()),
            Some(false) => record.error = Some("Failed to convert. boom".into()),
            None => {}
        }
        record
    }

    fn progress(stage: Stage, percent: u8, ok: Option<bool>) -> StreamItem {
        StreamItem::Event(JobEvent::Progress(StateUpdate {
            elapsed_ms: None,
            ..record(stage, percent, ok).to_update()
        }))
    }

    /// Scripted server. Each `events` call pops the next script entry;
    /// `snapshot` walks its list and then repeats the last entry.
    struct FakeApi {
        streams: Mutex<VecDeque<ClientResult<Vec<StreamItem>>>>,
        hold_stream_open: bool,
        snapshots: Mutex<VecDeque<ClientResult<JobRecord>>>,
        last_snapshot: Mutex<Option<JobRecord>>,
        result_delay: Duration,
        fail_result: bool,
        result_calls: AtomicUsize,
        stream_calls: AtomicUsize,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                streams: Mutex::new(VecDeque::new()),
                hold_stream_open: false,
                snapshots: Mutex::new(VecDeque::new()),
                last_snapshot: Mutex::new(None),
                result_delay: Duration::ZERO,
                fail_result: false,
                result_calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
            }
        }

        fn with_stream(self, items: Vec<StreamItem>) -> Self {
            self.streams.lock().unwrap().push_back(Ok(items));
            self
        }

        fn with_failing_stream(self) -> Self {
            self.streams
                .lock()
                .unwrap()
                .push_back(Err(ClientError::Status {
                    status: 503,
                    body: "unavailable".into(),
                }));
            self
        }

        fn with_rejected_stream(self) -> Self {
            self.streams
                .lock()
                .unwrap()
                .push_back(Err(ClientError::Status {
                    status: 400,
                    body: "bad request".into(),
                }));
            self
        }

        fn failing_result(mut self) -> Self {
            self.fail_result = true;
            self
        }

        fn with_snapshot(self, snapshot: ClientResult<JobRecord>) -> Self {
            self.snapshots.lock().unwrap().push_back(snapshot);
            self
        }

        fn holding_stream_open(mut self) -> Self {
            self.hold_stream_open = true;
            self
        }

        fn slow_result(mut self, delay: Duration) -> Self {
            self.result_delay = delay;
            self
        }
    }

    #[async_trait]
    impl JobApi for FakeApi {
        async fn submit(&self, upload: Upload) -> ClientResult<Submitted> {
            Ok(Submitted {
                job_id: "j1".into(),
                events_url: "/api/jobs/j1/events".into(),
                result_url: format!("/api/jobs/j1/result?name={}", upload.file_name),
            })
        }

        async fn snapshot(&self, _job_id: &str) -> ClientResult<JobRecord> {
            let next = self.snapshots.lock().unwrap().pop_front();
            match next {
                Some(Ok(record)) => {
                    *self.last_snapshot.lock().unwrap() = Some(record.clone());
                    Ok(record)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last_snapshot
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| ClientError::Status {
                        status: 503,
                        body: "no snapshot scripted".into(),
                    }),
            }
        }

        async fn events(&self, _job_id: &str) -> ClientResult<EventStream> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.streams.lock().unwrap().pop_front();
            let items = match next {
                Some(Ok(items)) => items,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ClientError::Status {
                        status: 503,
                        body: "no stream scripted".into(),
                    })
                }
            };
            let head = futures_util::stream::iter(items.into_iter().map(Ok));
            if self.hold_stream_open {
                Ok(Box::pin(head.chain(futures_util::stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }

        async fn result(&self, _job_id: &str) -> ClientResult<String> {
            self.result_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.result_delay).await;
            if self.fail_result {
                return Err(ClientError::NotFound("j1".into()));
            }
            Ok("# a\n".into())
        }

        async fn history(&self, _query: &HistoryQuery) -> ClientResult<Vec<HistoryRow>> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_stream_attempts: 3,
            log_capacity: 50,
        }
    }

    async fn settle(tracker: &JobTracker) -> JobView {
        tokio::time::timeout(Duration::from_secs(5), tracker.settled())
            .await
            .expect("tracker never settled")
    }

    #[tokio::test]
    async fn test_success_over_stream_fetches_once() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![
                    progress(Stage::Queued, 0, None),
                    progress(Stage::Convert, 40, None),
                    progress(Stage::Done, 100, Some(true)),
                ])
                .with_snapshot(Ok(record(Stage::Convert, 40, None))),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        let view = settle(&tracker).await;
        assert_eq!(view.ok(), Some(true));
        assert_eq!(view.stage(), Stage::Done);
        assert_eq!(view.percent(), 100);
        assert_eq!(tracker.artifact().as_deref(), Some("# a\n"));
        assert_eq!(tracker.fetch_count(), 1);
        assert_eq!(tracker.fetch_state(), FetchState::Fetched);
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_fails_immediately_polling_finishes() {
        let api = Arc::new(
            FakeApi::new()
                .with_failing_stream()
                .with_failing_stream()
                .with_failing_stream()
                .with_snapshot(Ok(record(Stage::Convert, 20, None)))
                .with_snapshot(Ok(record(Stage::CollectOutput, 90, None)))
                .with_snapshot(Ok(record(Stage::Done, 100, Some(true)))),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        let view = settle(&tracker).await;
        assert_eq!(view.ok(), Some(true));
        assert_eq!(tracker.fetch_count(), 1);
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 1);
        assert!(api.stream_calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_terminal_from_both_sources_fetches_once() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![
                    progress(Stage::Done, 100, Some(true)),
                    progress(Stage::Done, 100, Some(true)),
                ])
                .with_snapshot(Ok(record(Stage::Done, 100, Some(true))))
                .slow_result(Duration::from_millis(60)),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        settle(&tracker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.fetch_count(), 1);
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_settles_without_fetch() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![progress(Stage::Error, 100, Some(false))])
                .with_snapshot(Ok(record(Stage::Convert, 10, None))),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        let view = settle(&tracker).await;
        assert_eq!(view.ok(), Some(false));
        assert_eq!(view.error(), Some("Failed to convert. boom"));
        assert_eq!(tracker.fetch_count(), 0);
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_found_settles_as_lost_and_clears_store() {
        let api = Arc::new(
            FakeApi::new()
                .with_failing_stream()
                .with_snapshot(Err(ClientError::NotFound("j1".into()))),
        );
        let store = Arc::new(MemoryTrackedJobStore::with_job("j1"));
        let tracker = JobTracker::resume(api, store.clone(), fast_config())
            .await
            .unwrap()
            .unwrap();

        let view = settle(&tracker).await;
        assert!(view.is_lost());
        assert_eq!(view.phase(), SyncPhase::Settled);
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_submit_persists_until_terminal() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![progress(Stage::Convert, 50, None)])
                .holding_stream_open()
                .with_snapshot(Ok(record(Stage::Convert, 50, None))),
        );
        let store = Arc::new(MemoryTrackedJobStore::new());
        let upload = Upload {
            file_name: "a.pdf".into(),
            ..Upload::default()
        };
        let tracker = JobTracker::submit(api, store.clone(), upload, fast_config())
            .await
            .unwrap();
        assert_eq!(tracker.job_id(), "j1");
        assert_eq!(store.load().await.unwrap().as_deref(), Some("j1"));

        tracker.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_detach_mid_fetch_releases_claim() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![progress(Stage::Done, 100, Some(true))])
                .holding_stream_open()
                .with_snapshot(Ok(record(Stage::Convert, 10, None)))
                .slow_result(Duration::from_secs(10)),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        for _ in 0..200 {
            if tracker.fetch_state() == FetchState::Fetching {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.fetch_state(), FetchState::Fetching);

        let before = tracker.view();
        tracker.detach().await;

        assert!(tracker.artifact().is_none());
        assert!(!tracker.fetch_claimed());
        assert_eq!(tracker.fetch_state(), FetchState::Idle);
        assert_ne!(tracker.view().phase(), SyncPhase::Settled);
        assert!(tracker.view().same_state(&before));
    }

    #[tokio::test]
    async fn test_failed_fetch_survives_detach() {
        let api = Arc::new(
            FakeApi::new()
                .with_failing_stream()
                .with_snapshot(Ok(record(Stage::Done, 100, Some(true))))
                .failing_result(),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        let view = settle(&tracker).await;
        assert_eq!(view.ok(), Some(true));
        assert!(matches!(tracker.fetch_state(), FetchState::Failed(_)));
        assert!(view
            .logs()
            .iter()
            .any(|e| e.message.starts_with("result fetch failed")));

        tracker.detach().await;
        assert!(matches!(tracker.fetch_state(), FetchState::Failed(_)));
        assert!(tracker.fetch_claimed());
        assert_eq!(tracker.fetch_count(), 1);
        assert!(tracker.artifact().is_none());
        assert_eq!(api.result_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_stream_is_not_retried() {
        let api = Arc::new(
            FakeApi::new()
                .with_rejected_stream()
                .with_snapshot(Ok(record(Stage::Convert, 20, None)))
                .with_snapshot(Ok(record(Stage::Done, 100, Some(true)))),
        );
        let tracker = JobTracker::attach(api.clone(), "j1", fast_config());

        let view = settle(&tracker).await;
        assert_eq!(view.ok(), Some(true));
        assert_eq!(tracker.fetch_state(), FetchState::Fetched);
        assert_eq!(api.stream_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_block_lands_in_log_ring() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![
                    StreamItem::Malformed("malformed event payload: eof".into()),
                    progress(Stage::Done, 100, Some(true)),
                ])
                .with_snapshot(Ok(record(Stage::Convert, 10, None))),
        );
        let tracker = JobTracker::attach(api, "j1", fast_config());

        let view = settle(&tracker).await;
        assert!(view
            .logs()
            .iter()
            .any(|e| e.message.starts_with("malformed event skipped")));
        assert_eq!(view.ok(), Some(true));
    }

    #[tokio::test]
    async fn test_streaming_phase_while_stream_is_open() {
        let api = Arc::new(
            FakeApi::new()
                .with_stream(vec![progress(Stage::Convert, 30, None)])
                .holding_stream_open()
                .with_snapshot(Ok(record(Stage::Convert, 30, None))),
        );
        let tracker = JobTracker::attach(api, "j1", fast_config());
        let mut rx = tracker.watch();
        let view = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|v| v.phase() == SyncPhase::Streaming && v.percent() == 30),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(view.stage(), Stage::Convert);
        tracker.detach().await;
    }

    #[tokio::test]
    async fn test_resume_without_stored_job() {
        let api = Arc::new(FakeApi::new());
        let store = Arc::new(MemoryTrackedJobStore::new());
        assert!(JobTracker::resume(api, store, fast_config())
            .await
            .unwrap()
            .is_none());
    }
}
