// crates/core/src/event_log.rs
//! Durable, append-only log of job lifecycle records.
//!
//! The live job store forgets a job after its retention window; this log
//! is what survives. Each line is one JSON [`HistoryRecord`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::EventLogError;

/// Record type written when a job is submitted.
pub const START: &str = "convert.start";
/// Record type written when a job reaches a terminal outcome.
pub const DONE: &str = "convert.done";

/// One line of the durable log.
///
/// Fields are optional because the file outlives any one version of the
/// writer; unknown keys are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HistoryRecord {
    fn bare(kind: &str, job_id: &str, ts: DateTime<Utc>) -> Self {
        Self {
            kind: kind.to_string(),
            ts: Some(ts),
            job_id: Some(job_id.to_string()),
            user: None,
            pdf: None,
            backend: None,
            mode: None,
            sha256: None,
            size_bytes: None,
            ok: None,
            md: None,
            error: None,
            elapsed_ms: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A `convert.start` record for a newly submitted job.
    pub fn start(job_id: &str, pdf: &str, ts: DateTime<Utc>) -> Self {
        Self {
            pdf: Some(pdf.to_string()),
            ..Self::bare(START, job_id, ts)
        }
    }

    /// A successful `convert.done` record.
    pub fn succeeded(job_id: &str, md: &str, ts: DateTime<Utc>) -> Self {
        Self {
            ok: Some(true),
            md: Some(md.to_string()),
            ..Self::bare(DONE, job_id, ts)
        }
    }

    /// A failed `convert.done` record.
    pub fn failed(job_id: &str, error: &str, ts: DateTime<Utc>) -> Self {
        Self {
            ok: Some(false),
            error: Some(error.to_string()),
            ..Self::bare(DONE, job_id, ts)
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_engine(mut self, backend: Option<String>, mode: Option<String>) -> Self {
        self.backend = backend;
        self.mode = mode;
        self
    }

    pub fn with_digest(mut self, sha256: impl Into<String>, size_bytes: u64) -> Self {
        self.sha256 = Some(sha256.into());
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn is_start(&self) -> bool {
        self.kind == START
    }

    pub fn is_success(&self) -> bool {
        self.kind == DONE && self.ok == Some(true)
    }
}

/// Append-only store the lifecycle manager writes to and the history view
/// reads from.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> Result<(), EventLogError>;

    /// Every readable record, in the order written.
    async fn read_all(&self) -> Result<Vec<HistoryRecord>, EventLogError>;

    /// The last `limit` records, newest first.
    async fn read_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, EventLogError>;

    /// Confirm records could be appended right now. Writes nothing.
    async fn check_writable(&self) -> Result<(), EventLogError> {
        Ok(())
    }
}

/// JSON-lines file implementation.
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, record: &HistoryRecord) -> Result<(), EventLogError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EventLogError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EventLogError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| EventLogError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| EventLogError::io(&self.path, e))
    }

    async fn read_all(&self) -> Result<Vec<HistoryRecord>, EventLogError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::io(&self.path, e)),
        };
        Ok(parse_lines(text.lines()))
    }

    async fn read_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, EventLogError> {
        let lines = match tail_lines(&self.path, limit).await {
            Ok(lines) => lines,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::io(&self.path, e)),
        };
        let mut records = parse_lines(lines.iter().map(String::as_str));
        records.reverse();
        Ok(records)
    }

    async fn check_writable(&self) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EventLogError::io(parent, e))?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EventLogError::io(&self.path, e))?;
        Ok(())
    }
}

/// In-memory implementation for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<HistoryRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, record: &HistoryRecord) -> Result<(), EventLogError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<HistoryRecord>, EventLogError> {
        Ok(self.snapshot())
    }

    async fn read_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, EventLogError> {
        Ok(self.snapshot().into_iter().rev().take(limit).collect())
    }
}

fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<HistoryRecord> {
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable event log line");
                None
            }
        })
        .collect()
}

/// Backward read size.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Read the last `n` lines of a file without loading all of it.
///
/// Reads 8KB chunks from EOF towards the start until `n + 1` newlines have
/// been seen. Lines come back oldest first; a trailing newline does not
/// produce an empty last line.
async fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    let mut remaining = file.metadata().await?.len();
    let mut collected: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    while remaining > 0 && newlines <= n {
        let chunk_len = remaining.min(CHUNK_SIZE);
        let offset = remaining - chunk_len;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; chunk_len as usize];
        file.read_exact(&mut buf).await?;
        newlines += buf.iter().filter(|&&b| b == b'\n').count();

        buf.append(&mut collected);
        collected = buf;
        remaining = offset;
    }

    let text = String::from_utf8_lossy(&collected);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}
