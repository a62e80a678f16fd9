// crates/server/src/engine/scripted.rs
//! Engine that plays back a fixed script instead of converting anything.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use docjobs_core::LogLevel;

use super::{ConversionEngine, ConvertRequest, EngineError, ProgressSink};

#[derive(Debug, Clone)]
enum Outcome {
    Succeed,
    Fail(String),
    Panic,
}

/// Reports a list of engine percents, pausing between them, then succeeds
/// by writing `<job_dir>/auto/<stem>.md`, or fails with a fixed message.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    steps: Vec<u8>,
    delay: Duration,
    outcome: Outcome,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::succeeding()
    }
}

impl ScriptedEngine {
    pub fn succeeding() -> Self {
        Self {
            steps: vec![0, 25, 50, 75, 100],
            delay: Duration::from_millis(200),
            outcome: Outcome::Succeed,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail(message.into()),
            ..Self::succeeding()
        }
    }

    /// Panics mid-conversion. Exercises worker panic handling.
    pub fn panicking() -> Self {
        Self {
            outcome: Outcome::Panic,
            ..Self::succeeding()
        }
    }

    pub fn with_steps(mut self, steps: impl Into<Vec<u8>>) -> Self {
        self.steps = steps.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ConversionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn convert(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, EngineError> {
        sink.on_log(LogLevel::Info, "scripted conversion started");
        for &pct in &self.steps {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            sink.on_line(&format!("Processing pages: {pct}%"), Some(pct));
        }

        match &self.outcome {
            Outcome::Fail(message) => Err(EngineError::Failed(message.clone())),
            Outcome::Panic => panic!("scripted engine panicked during conversion"),
            Outcome::Succeed => {
                let stem = request.stem();
                let dir = request.job_dir.join(&stem).join("auto");
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| EngineError::io(&dir, e))?;
                let path = dir.join(format!("{stem}.md"));
                let body = format!("# {stem}\n\nConverted by the scripted engine.\n");
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| EngineError::io(&path, e))?;
                Ok(path)
            }
        }
    }
}
