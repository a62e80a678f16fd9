// crates/server/src/jobs/runner.rs
//! Stage worker: runs one job's pipeline on its own task.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use docjobs_core::{EventLog, HistoryRecord, JobEvent, JobId, JobRecord, LogLevel, LogLine, Stage, TransitionError};

use super::bus::EventBus;
use super::store::JobStore;
use crate::engine::{output, ConversionEngine, ConvertMode, ConvertRequest, ProgressSink};
use crate::metrics;

pub const PREPARE_PERCENT: u8 = 1;
pub const CONVERT_BASE_PERCENT: u8 = 5;
/// Share of the bar the engine's own progress is spread over.
pub const CONVERT_SPAN_PERCENT: u8 = 80;
pub const COLLECT_PERCENT: u8 = 90;

/// Map an engine percent (0-100) into the `convert` band.
pub fn map_engine_percent(engine_percent: u8) -> u8 {
    let scaled = u16::from(engine_percent.min(100)) * u16::from(CONVERT_SPAN_PERCENT) / 100;
    (u16::from(CONVERT_BASE_PERCENT) + scaled).min(99) as u8
}

/// An accepted upload, already on disk.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: JobId,
    pub job_dir: PathBuf,
    pub input: PathBuf,
    pub source_name: String,
    pub backend: Option<String>,
    pub mode: Option<ConvertMode>,
    pub user: Option<String>,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Creates job records and spawns their stage workers.
pub struct JobRunner {
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
    engine: Arc<dyn ConversionEngine>,
    history: Arc<dyn EventLog>,
    progress_step: u8,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<EventBus>,
        engine: Arc<dyn ConversionEngine>,
        history: Arc<dyn EventLog>,
        progress_step: u8,
    ) -> Self {
        Self {
            store,
            bus,
            engine,
            history,
            progress_step,
        }
    }

    pub fn engine(&self) -> &dyn ConversionEngine {
        self.engine.as_ref()
    }

    /// Register the job in `queued` and start its worker. Returns as soon
    /// as the worker is spawned.
    pub async fn submit(&self, submission: Submission) -> JobId {
        let now = Utc::now();
        let Submission {
            job_id,
            job_dir,
            input,
            source_name,
            backend,
            mode,
            user,
            sha256,
            size_bytes,
        } = submission;
        let mode_name = mode.map(|m| m.as_str().to_string());

        let mut record = JobRecord::new(job_id.clone(), source_name.clone(), now)
            .with_backend(backend.clone())
            .with_mode(mode_name.clone());
        if let Some(user) = &user {
            record = record.with_user(user.clone());
        }
        self.store.insert(record, job_dir.clone());
        self.bus.open(&job_id);

        let start = HistoryRecord::start(&job_id, &source_name, now)
            .with_user(user.clone())
            .with_engine(backend.clone(), mode_name)
            .with_digest(sha256, size_bytes);
        if let Err(e) = self.history.append(&start).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to record job start");
        }
        metrics::record_submitted();
        tracing::info!(job_id = %job_id, source = %source_name, engine = self.engine.name(), "job submitted");

        let ctx = Arc::new(JobContext {
            job_id: job_id.clone(),
            source_name,
            user,
            bus: Arc::clone(&self.bus),
            history: Arc::clone(&self.history),
            started: Instant::now(),
            clock: Mutex::new(now),
            stage: Mutex::new(Stage::Queued),
            last_reported: Mutex::new(None),
            progress_step: self.progress_step,
        });
        let request = ConvertRequest {
            job_id: job_id.clone(),
            input,
            job_dir,
            backend,
            mode,
        };
        tokio::spawn(supervise(ctx, Arc::clone(&self.engine), request));
        job_id
    }
}

/// Run the pipeline on its own task so a panic surfaces here as a
/// `JoinError` and still ends the job.
async fn supervise(ctx: Arc<JobContext>, engine: Arc<dyn ConversionEngine>, request: ConvertRequest) {
    let worker = tokio::spawn(run_pipeline(Arc::clone(&ctx), engine, request));
    if let Err(e) = worker.await {
        tracing::error!(job_id = %ctx.job_id, error = %e, "stage worker aborted");
        let message = if e.is_panic() {
            "Conversion worker crashed unexpectedly."
        } else {
            "Conversion worker was cancelled."
        };
        ctx.finish_failed(message, "panicked").await;
    }
}

async fn run_pipeline(ctx: Arc<JobContext>, engine: Arc<dyn ConversionEngine>, request: ConvertRequest) {
    ctx.advance(Stage::Prepare, PREPARE_PERCENT);
    ctx.emit_log(LogLevel::Info, &format!("job started: {}", ctx.source_name), None, None);

    ctx.advance(Stage::Convert, CONVERT_BASE_PERCENT);
    let found = match engine.convert(&request, ctx.as_ref()).await {
        Ok(found) => found,
        Err(e) => {
            ctx.finish_failed(&e.to_string(), "failed").await;
            return;
        }
    };

    ctx.advance(Stage::CollectOutput, COLLECT_PERCENT);
    match output::finalize_output(&found, &request.job_dir, &request.stem()).await {
        Ok(target) => ctx.finish_ok(target).await,
        Err(e) => {
            ctx.finish_failed(&format!("Failed to collect output: {e}"), "failed")
                .await
        }
    }
}

/// Mutation rights over one job, held by its worker.
pub struct JobContext {
    job_id: JobId,
    source_name: String,
    user: Option<String>,
    bus: Arc<EventBus>,
    history: Arc<dyn EventLog>,
    started: Instant,
    /// Latest timestamp handed out; keeps event `ts` non-decreasing.
    clock: Mutex<DateTime<Utc>>,
    stage: Mutex<Stage>,
    last_reported: Mutex<Option<u8>>,
    progress_step: u8,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("job context mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

impl JobContext {
    fn now(&self) -> DateTime<Utc> {
        let mut clock = lock(&self.clock);
        *clock = (*clock).max(Utc::now());
        *clock
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn advance(&self, stage: Stage, percent: u8) {
        let now = self.now();
        match self
            .bus
            .publish_state(&self.job_id, None, |r| r.advance(stage, percent, now))
        {
            Ok(_) => *lock(&self.stage) = stage,
            Err(e) => tracing::warn!(job_id = %self.job_id, error = %e, "stage transition rejected"),
        }
    }

    fn emit_log(&self, level: LogLevel, message: &str, percent: Option<u8>, elapsed_ms: Option<u64>) {
        let stage = *lock(&self.stage);
        let line = LogLine {
            job_id: self.job_id.clone(),
            ts: self.now(),
            level,
            stage,
            message: message.to_string(),
            percent,
            elapsed_ms,
        };
        self.bus.publish(&self.job_id, JobEvent::Log(line));
    }

    /// Whether `mapped` is far enough past the last reported percent.
    fn take_report(&self, mapped: u8) -> bool {
        let mut last = lock(&self.last_reported);
        let due = match *last {
            None => true,
            Some(prev) => mapped >= prev.saturating_add(self.progress_step),
        };
        if due {
            *last = Some(mapped);
        }
        due
    }

    async fn finish_ok(&self, target: PathBuf) {
        let elapsed_ms = self.elapsed_ms();
        let result_path = target.to_string_lossy().into_owned();
        let now = self.now();
        let outcome = self.bus.publish_state(&self.job_id, Some(elapsed_ms), |r| {
            r.succeed(result_path.clone(), now)
        });
        if self.settled(outcome) {
            *lock(&self.stage) = Stage::Done;
            tracing::info!(job_id = %self.job_id, elapsed_ms, "job finished");
            metrics::record_finished("ok", self.started.elapsed());
            let done = HistoryRecord::succeeded(&self.job_id, &result_path, now)
                .with_user(self.user.clone())
                .with_elapsed_ms(elapsed_ms);
            self.append_history(done).await;
        }
    }

    async fn finish_failed(&self, message: &str, outcome_label: &'static str) {
        let elapsed_ms = self.elapsed_ms();
        let now = self.now();
        let outcome = self
            .bus
            .publish_state(&self.job_id, Some(elapsed_ms), |r| r.fail(message, now));
        if self.settled(outcome) {
            *lock(&self.stage) = Stage::Error;
            tracing::warn!(job_id = %self.job_id, error = %message, "job failed");
            metrics::record_finished(outcome_label, self.started.elapsed());
            let done = HistoryRecord::failed(&self.job_id, message, now)
                .with_user(self.user.clone())
                .with_elapsed_ms(elapsed_ms);
            self.append_history(done).await;
        }
    }

    fn settled(&self, outcome: Result<Option<JobRecord>, TransitionError>) -> bool {
        match outcome {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "terminal transition rejected");
                false
            }
        }
    }

    async fn append_history(&self, record: HistoryRecord) {
        if let Err(e) = self.history.append(&record).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to record job outcome");
        }
    }
}

impl ProgressSink for JobContext {
    fn on_line(&self, line: &str, percent: Option<u8>) {
        match percent.map(map_engine_percent) {
            Some(mapped) if self.take_report(mapped) => {
                self.emit_log(LogLevel::Info, line, Some(mapped), Some(self.elapsed_ms()));
                self.advance(Stage::Convert, mapped);
            }
            _ => self.emit_log(LogLevel::Info, line, None, None),
        }
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        self.emit_log(level, message, None, None);
    }
}
