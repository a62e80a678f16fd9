// crates/server/src/engine/mod.rs
//! Conversion engines invoked by stage `convert`.
//!
//! - `ConversionEngine` — the seam the stage worker calls through
//! - `MineruEngine` — spawns the MinerU CLI
//! - `ScriptedEngine` — deterministic stand-in for demos and tests

pub mod mineru;
pub mod output;
pub mod scripted;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use docjobs_core::{JobId, LogLevel};
use thiserror::Error;

pub use mineru::MineruEngine;
pub use scripted::ScriptedEngine;

/// Engine parsing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertMode {
    Auto,
    Ocr,
    Txt,
}

impl ConvertMode {
    pub const ALL: [ConvertMode; 3] = [ConvertMode::Auto, ConvertMode::Ocr, ConvertMode::Txt];

    pub fn as_str(self) -> &'static str {
        match self {
            ConvertMode::Auto => "auto",
            ConvertMode::Ocr => "ocr",
            ConvertMode::Txt => "txt",
        }
    }
}

impl fmt::Display for ConvertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConvertMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ConvertMode::Auto),
            "ocr" => Ok(ConvertMode::Ocr),
            "txt" => Ok(ConvertMode::Txt),
            other => Err(format!("invalid mode: {other}")),
        }
    }
}

/// Everything an engine needs to convert one input.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub job_id: JobId,
    pub input: PathBuf,
    /// Directory the engine writes into. Holds the input file too.
    pub job_dir: PathBuf,
    pub backend: Option<String>,
    pub mode: Option<ConvertMode>,
}

impl ConvertRequest {
    /// Input file name without its extension.
    pub fn stem(&self) -> String {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Conversion ran and failed. The message is shown to users verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Receives engine output while a conversion runs.
pub trait ProgressSink: Send + Sync {
    /// One line of engine output, with the engine's own percent (0-100)
    /// when the line carries one.
    fn on_line(&self, line: &str, percent: Option<u8>);

    /// A diagnostic from the adapter itself.
    fn on_log(&self, level: LogLevel, message: &str);
}

#[async_trait]
pub trait ConversionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the engine can run at all on this host.
    fn is_available(&self) -> bool;

    /// Convert `request.input`, returning the Markdown file produced.
    async fn convert(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, EngineError>;
}

/// Resolve an executable name against `PATH`. Paths are returned as-is
/// when they exist.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}
