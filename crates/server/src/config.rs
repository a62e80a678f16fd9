// crates/server/src/config.rs
//! Server settings: CLI flags layered over `DOCJOBS_*` environment variables.
//!
//! `main` loads a `.env` file with `dotenvy` before parsing, so values there
//! behave exactly like exported variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Which conversion engine drives stage `convert`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Spawn the MinerU CLI.
    #[default]
    Mineru,
    /// Built-in engine that fabricates a Markdown file. For demos and tests.
    Scripted,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "docjobs", version, about = "PDF to Markdown conversion job server")]
pub struct Settings {
    #[arg(long, env = "DOCJOBS_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "DOCJOBS_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Root directory holding one sub-directory per job.
    #[arg(long, env = "DOCJOBS_OUTPUT_ROOT", default_value = "output")]
    pub output_root: PathBuf,

    /// Durable event log. Defaults to `<output_root>/history.jsonl`.
    #[arg(long, env = "DOCJOBS_HISTORY_PATH")]
    pub history_path: Option<PathBuf>,

    /// Hours a job record and its directory are kept.
    #[arg(long, env = "DOCJOBS_JOB_TTL_HOURS", default_value_t = 24)]
    pub job_ttl_hours: u64,

    /// Comma-separated allowed origins. Empty allows any origin.
    #[arg(long, env = "DOCJOBS_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Engine executable name or path.
    #[arg(long, env = "DOCJOBS_ENGINE_CLI", default_value = "mineru")]
    pub engine_cli: String,

    /// Minimum percent change between two progress-bearing log lines.
    #[arg(long, env = "DOCJOBS_PROGRESS_STEP", default_value_t = 1)]
    pub progress_step: u8,

    #[arg(long, env = "DOCJOBS_ENGINE", value_enum, default_value_t = EngineKind::Mineru)]
    pub engine: EngineKind,

    /// Upload size limit in megabytes.
    #[arg(long, env = "DOCJOBS_MAX_UPLOAD_MB", default_value_t = 512)]
    pub max_upload_mb: usize,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl Settings {
    /// Defaults rooted at `output_root`, ignoring the environment.
    pub fn with_output_root(output_root: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            output_root: output_root.into(),
            history_path: None,
            job_ttl_hours: 24,
            cors_origins: Vec::new(),
            engine_cli: "mineru".into(),
            progress_step: 1,
            engine: EngineKind::Mineru,
            max_upload_mb: 512,
            log_json: false,
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| self.output_root.join("history.jsonl"))
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_hours.saturating_mul(3600))
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
