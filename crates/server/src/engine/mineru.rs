// crates/server/src/engine/mineru.rs
//! Adapter for the MinerU command line.
//!
//! Tries a list of candidate command lines in order until one exits cleanly
//! and leaves a Markdown file behind. Output is streamed line by line to the
//! sink; `NN%` markers become progress.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use docjobs_core::LogLevel;
use regex_lite::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::output::{classify_failure, clean_job_dir, find_markdown, is_error_line};
use super::{resolve_executable, ConversionEngine, ConvertMode, ConvertRequest, EngineError, ProgressSink};

/// Error lines quoted in an attempt's failure hint.
const MAX_HINT_LINES: usize = 10;
const CONVERSION_LOG: &str = "conversion.log";

fn percent_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})\s*%").ok()).as_ref()
}

/// Engine percent carried by a line, if any, clamped to 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    let caps = percent_regex()?.captures(line)?;
    let value: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.min(100) as u8)
}

pub struct MineruEngine {
    cli: String,
}

/// Result of running one candidate command.
struct Attempt {
    ok: bool,
    hint: Option<String>,
    output: String,
}

impl MineruEngine {
    pub fn new(cli: impl Into<String>) -> Self {
        Self { cli: cli.into() }
    }

    /// Argument lists to try, in order.
    pub fn candidate_args(&self, request: &ConvertRequest) -> Vec<Vec<String>> {
        let input = request.input.to_string_lossy().into_owned();
        let out = request.job_dir.to_string_lossy().into_owned();
        let base = || vec!["-p".to_string(), input.clone(), "-o".to_string(), out.clone()];
        let mode = request.mode.unwrap_or(ConvertMode::Auto).as_str().to_string();

        let mut candidates = Vec::new();
        if let Some(backend) = request.backend.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            let mut args = base();
            args.extend(["-b".to_string(), backend.to_string()]);
            if backend == "pipeline" {
                args.extend(["-m".to_string(), mode.clone()]);
            }
            candidates.push(args);
        }

        candidates.push(base());
        let mut pipeline = base();
        pipeline.extend(["-b", "pipeline", "-m"].map(String::from));
        pipeline.push(mode);
        candidates.push(pipeline);
        let mut vlm = base();
        vlm.extend(["-b", "vlm-transformers"].map(String::from));
        candidates.push(vlm);
        candidates
    }

    async fn run_attempt(&self, args: &[String], sink: &dyn ProgressSink) -> Attempt {
        let mut child = match Command::new(&self.cli)
            .args(args)
            .env("FITZ_QUIET", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                sink.on_log(LogLevel::Error, &format!("command not found: {}", self.cli));
                return Attempt {
                    ok: false,
                    hint: Some("Command not found".into()),
                    output: String::new(),
                };
            }
            Err(e) => {
                sink.on_log(
                    LogLevel::Error,
                    &format!("failed to start command: {} ({e})", self.cli),
                );
                return Attempt {
                    ok: false,
                    hint: Some(e.to_string()),
                    output: String::new(),
                };
            }
        };

        let mut output = Vec::new();
        let mut error_lines = Vec::new();
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            let line = tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => line,
                line = next_line(&mut stderr), if stderr.is_some() => line,
            };
            let Some(line) = line else { continue };
            let line = line.trim_end_matches(['\r', '\n']).to_string();

            if is_error_line(&line) && error_lines.len() < MAX_HINT_LINES {
                error_lines.push(line.clone());
            }
            if !line.trim().is_empty() {
                sink.on_line(&line, parse_percent(&line));
            }
            output.push(line);
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                sink.on_log(LogLevel::Error, &format!("failed to wait for {}: {e}", self.cli));
                return Attempt {
                    ok: false,
                    hint: Some(e.to_string()),
                    output: output.join("\n"),
                };
            }
        };

        Attempt {
            ok: status.success() && error_lines.is_empty(),
            hint: (!error_lines.is_empty()).then(|| error_lines.join("; ")),
            output: output.join("\n"),
        }
    }
}

/// Read one line from an optional reader; clears it at EOF or on error.
async fn next_line<R>(reader: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let lines = reader.as_mut()?;
    match lines.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            *reader = None;
            None
        }
    }
}

#[async_trait]
impl ConversionEngine for MineruEngine {
    fn name(&self) -> &str {
        "mineru"
    }

    fn is_available(&self) -> bool {
        resolve_executable(&self.cli).is_some()
    }

    async fn convert(
        &self,
        request: &ConvertRequest,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, EngineError> {
        let stem = request.stem();
        let candidates = self.candidate_args(request);
        let total = candidates.len();
        let mut last_output = String::new();

        for (idx, args) in candidates.iter().enumerate() {
            sink.on_log(
                LogLevel::Info,
                &format!("Attempt {}/{}: {} {}", idx + 1, total, self.cli, args.join(" ")),
            );
            clean_job_dir(&request.job_dir, &request.input)
                .await
                .map_err(|e| EngineError::io(&request.job_dir, e))?;

            let attempt = self.run_attempt(args, sink).await;
            let found = find_markdown(&request.job_dir, &stem);
            if let (true, Some(found)) = (attempt.ok, found) {
                write_log(request, &attempt.output).await;
                return Ok(found);
            }
            if let Some(hint) = &attempt.hint {
                tracing::debug!(job_id = %request.job_id, attempt = idx + 1, hint = %hint, "conversion attempt failed");
            }
            last_output = attempt.output;
        }

        write_log(request, &last_output).await;
        Err(EngineError::Failed(classify_failure(&last_output)))
    }
}

async fn write_log(request: &ConvertRequest, output: &str) {
    let path = request.job_dir.join(CONVERSION_LOG);
    if let Err(e) = tokio::fs::write(&path, output).await {
        tracing::warn!(job_id = %request.job_id, path = %path.display(), error = %e, "failed to write conversion log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<(String, Option<u8>)>>,
        logs: Mutex<Vec<(LogLevel, String)>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_line(&self, line: &str, percent: Option<u8>) {
            self.lines.lock().unwrap().push((line.to_string(), percent));
        }

        fn on_log(&self, level: LogLevel, message: &str) {
            self.logs.lock().unwrap().push((level, message.to_string()));
        }
    }

    fn request(dir: &std::path::Path, backend: Option<&str>, mode: Option<ConvertMode>) -> ConvertRequest {
        ConvertRequest {
            job_id: "j1".into(),
            input: dir.join("a.pdf"),
            job_dir: dir.to_path_buf(),
            backend: backend.map(String::from),
            mode,
        }
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Processing pages:  42%|####"), Some(42));
        assert_eq!(parse_percent("done 100 %"), Some(100));
        assert_eq!(parse_percent("weird 250%"), Some(100));
        assert_eq!(parse_percent("no progress here"), None);
    }

    #[test]
    fn test_candidate_args_default() {
        let engine = MineruEngine::new("mineru");
        let req = request(std::path::Path::new("/out/j1"), None, Some(ConvertMode::Ocr));
        let args = engine.candidate_args(&req);
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], vec!["-p", "/out/j1/a.pdf", "-o", "/out/j1"]);
        assert_eq!(args[1][4..], ["-b", "pipeline", "-m", "ocr"]);
        assert_eq!(args[2][4..], ["-b", "vlm-transformers"]);
    }

    #[test]
    fn test_candidate_args_explicit_backend_goes_first() {
        let engine = MineruEngine::new("mineru");
        let dir = std::path::Path::new("/out/j1");

        let args = engine.candidate_args(&request(dir, Some("pipeline"), None));
        assert_eq!(args.len(), 4);
        assert_eq!(args[0][4..], ["-b", "pipeline", "-m", "auto"]);

        let args = engine.candidate_args(&request(dir, Some("vlm-sglang-client"), None));
        assert_eq!(args[0][4..], ["-b", "vlm-sglang-client"]);
    }

    #[tokio::test]
    async fn test_missing_cli_fails_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        let engine = MineruEngine::new("definitely-not-mineru-xyz");
        assert!(!engine.is_available());

        let sink = RecordingSink::default();
        let err = engine
            .convert(&request(dir.path(), None, None), &sink)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to convert. Check logs for detailed traceback."
        );

        let logs = sink.logs.lock().unwrap();
        let not_found = logs
            .iter()
            .filter(|(level, msg)| *level == LogLevel::Error && msg.contains("command not found"))
            .count();
        assert_eq!(not_found, 3);
        assert!(dir.path().join(CONVERSION_LOG).exists());
        assert!(dir.path().join("a.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_output_from_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let bin = bin_dir.path().join("fake-mineru.sh");
        std::fs::write(
            &bin,
            "#!/bin/sh\necho 'Processing pages: 50%'\nmkdir -p \"$4/a/auto\"\necho '# a' > \"$4/a/auto/a.md\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = MineruEngine::new(bin.to_string_lossy());
        let sink = RecordingSink::default();
        let found = engine
            .convert(&request(dir.path(), None, None), &sink)
            .await
            .unwrap();

        assert_eq!(found, dir.path().join("a").join("auto").join("a.md"));
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines[0], ("Processing pages: 50%".to_string(), Some(50)));
    }
}
