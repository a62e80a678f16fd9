// crates/server/src/engine/output.rs
//! Locating engine output and explaining engine failures.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

/// Markers that make an output line worth quoting in a failure hint.
const ERROR_MARKERS: &[&str] = &[
    "Traceback",
    "Error",
    "Exception",
    "RuntimeError",
    "ModelWrapper",
    "ProtocolError",
    "ChunkedEncodingError",
    "IncompleteRead",
];

const NETWORK_MARKERS: &[&str] = &["ProtocolError", "ChunkedEncodingError", "IncompleteRead"];

pub const FAILURE_PREFIX: &str = "Failed to convert. ";

pub fn is_error_line(line: &str) -> bool {
    ERROR_MARKERS.iter().any(|m| line.contains(m))
}

/// User-facing message for a conversion that produced no usable output.
pub fn classify_failure(output: &str) -> String {
    let reason = if output.contains("ModelWrapper") {
        "Detected Layout engine issue."
    } else if NETWORK_MARKERS.iter().any(|m| output.contains(m)) {
        "Model download failed due to network instability. Please run 'mineru-models-download' manually in the environment."
    } else {
        "Check logs for detailed traceback."
    };
    format!("{FAILURE_PREFIX}{reason}")
}

/// Newest `*.md` under `dir` whose file name contains `stem`
/// (case-insensitive), else the newest `*.md` of any name.
pub fn find_markdown(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));

    let needle = stem.to_lowercase();
    let named = files.iter().find(|(_, p)| {
        p.file_name()
            .is_some_and(|n| n.to_string_lossy().to_lowercase().contains(&needle))
    });
    named.or(files.first()).map(|(_, p)| p.clone())
}

/// Copy `found` to `<job_dir>/<stem>.md` unless it already is that file.
pub async fn finalize_output(found: &Path, job_dir: &Path, stem: &str) -> std::io::Result<PathBuf> {
    let target = job_dir.join(format!("{stem}.md"));
    if found != target {
        tokio::fs::create_dir_all(job_dir).await?;
        tokio::fs::copy(found, &target).await?;
    }
    Ok(target)
}

/// Remove everything in `job_dir` except `keep` and other PDFs, so a retry
/// starts from a clean directory.
pub async fn clean_job_dir(job_dir: &Path, keep: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == keep {
            continue;
        }
        let file_type = entry.file_type().await?;
        let result = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        {
            continue;
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "could not clean job dir entry");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("x\nModelWrapper blew up\n"),
            "Failed to convert. Detected Layout engine issue."
        );
        assert!(classify_failure("urllib3 ProtocolError: reset").contains("network instability"));
        assert_eq!(
            classify_failure("segfault"),
            "Failed to convert. Check logs for detailed traceback."
        );
    }

    #[test]
    fn test_error_line_detection() {
        assert!(is_error_line("Traceback (most recent call last):"));
        assert!(is_error_line("ValueError: bad page"));
        assert!(!is_error_line("Processing pages: 40%"));
    }

    #[test]
    fn test_find_markdown_prefers_matching_name() {
        let dir = tempfile::tempdir().unwrap();
        let auto = dir.path().join("report").join("auto");
        fs::create_dir_all(&auto).unwrap();
        fs::write(auto.join("report.md"), "# r").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(auto.join("unrelated.md"), "# u").unwrap();

        let found = find_markdown(dir.path(), "Report").unwrap();
        assert_eq!(found.file_name().unwrap(), "report.md");

        let fallback = find_markdown(dir.path(), "missing").unwrap();
        assert_eq!(fallback.file_name().unwrap(), "unrelated.md");
    }

    #[test]
    fn test_find_markdown_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_markdown(dir.path(), "x").is_none());
    }

    #[tokio::test]
    async fn test_finalize_copies_to_job_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("auto");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("a.md"), "# a").unwrap();

        let target = finalize_output(&nested.join("a.md"), dir.path(), "a").await.unwrap();
        assert_eq!(target, dir.path().join("a.md"));
        assert_eq!(fs::read_to_string(&target).unwrap(), "# a");

        // Already in place: no copy, same path.
        let again = finalize_output(&target, dir.path(), "a").await.unwrap();
        assert_eq!(again, target);
    }

    #[tokio::test]
    async fn test_clean_job_dir_keeps_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pdf");
        fs::write(&input, b"%PDF").unwrap();
        fs::write(dir.path().join("conversion.log"), "old").unwrap();
        fs::create_dir_all(dir.path().join("in").join("auto")).unwrap();

        clean_job_dir(dir.path(), &input).await.unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("in.pdf")]);
    }
}
