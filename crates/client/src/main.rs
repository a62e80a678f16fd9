// crates/client/src/main.rs
//! `docjobs-cli`: submit a PDF and follow it to completion, or inspect
//! history.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docjobs_client::{
    FileTrackedJobStore, HttpJobApi, JobApi, JobTracker, JobView, SyncConfig, TrackedJobStore,
    Upload,
};
use docjobs_core::HistoryQuery;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docjobs-cli", version, about = "Client for the docjobs conversion server")]
struct Cli {
    /// Server base URL.
    #[arg(long, env = "DOCJOBS_SERVER", default_value = "http://127.0.0.1:8000", global = true)]
    server: String,

    /// File remembering the tracked job. Defaults to the user data dir.
    #[arg(long, env = "DOCJOBS_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a PDF and wait for its Markdown.
    Convert {
        file: PathBuf,
        #[arg(long)]
        backend: Option<String>,
        /// auto, ocr or txt.
        #[arg(long)]
        mode: Option<String>,
        #[arg(long, env = "DOCJOBS_USER")]
        user: Option<String>,
        /// Where to write the Markdown. Defaults to `<stem>.md`.
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Follow a job. Without an id, resumes the remembered one.
    Watch {
        job_id: Option<String>,
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// List completed conversions.
    History {
        #[arg(long)]
        limit: Option<usize>,
        /// Case-insensitive filter over id, file name, backend and user.
        #[arg(long, short)]
        q: Option<String>,
    },
    /// Forget the remembered job.
    Clear,
}

fn tracked_store(path: Option<PathBuf>) -> Result<Arc<dyn TrackedJobStore>> {
    let store = match path {
        Some(path) => FileTrackedJobStore::new(path),
        None => FileTrackedJobStore::default_location()
            .context("no user data directory; pass --state-file")?,
    };
    Ok(Arc::new(store))
}

/// Print view changes until the tracker settles.
async fn follow(tracker: &JobTracker) -> JobView {
    let mut rx = tracker.watch();
    let mut shown_logs = 0usize;
    let mut last_line = String::new();
    loop {
        let view = rx.borrow_and_update().clone();
        let total_logs = view.logs().len() + view.logs().dropped() as usize;
        let fresh = total_logs.saturating_sub(shown_logs).min(view.logs().len());
        for entry in view.logs().iter().skip(view.logs().len() - fresh) {
            eprintln!("    {:?} {}", entry.level, entry.message);
        }
        shown_logs = total_logs;

        let line = format!("  {} {:>3}%  [{:?}]", view.stage(), view.percent(), view.phase());
        if line != last_line {
            eprintln!("{line}");
            last_line = line;
        }
        if view.is_settled() || rx.changed().await.is_err() {
            break;
        }
    }
    tracker.settled().await
}

async fn finish(tracker: &JobTracker, out: Option<PathBuf>) -> Result<()> {
    let view = follow(tracker).await;
    if view.is_lost() {
        bail!("job {} is no longer known to the server", view.job_id());
    }
    match view.ok() {
        Some(true) => {
            let markdown = tracker
                .artifact()
                .with_context(|| format!("job {} succeeded but the result could not be fetched", view.job_id()))?;
            let out = out.unwrap_or_else(|| default_output(view.source_name(), view.job_id()));
            tokio::fs::write(&out, markdown)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            eprintln!("  done -> {}", out.display());
            Ok(())
        }
        Some(false) => bail!("{}", view.error().unwrap_or("conversion failed")),
        None => bail!("stopped before job {} finished", view.job_id()),
    }
}

fn default_output(source_name: Option<&str>, job_id: &str) -> PathBuf {
    let stem = source_name
        .and_then(|name| Path::new(name).file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| job_id.to_string());
    PathBuf::from(format!("{stem}.md"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,docjobs_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let api = Arc::new(HttpJobApi::new(cli.server.clone())?);
    let config = SyncConfig::default();

    match cli.command {
        Command::Convert {
            file,
            backend,
            mode,
            user,
            out,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.pdf".to_string());
            let upload = Upload {
                file_name,
                bytes,
                backend,
                mode,
                user,
            };
            let store = tracked_store(cli.state_file)?;
            let tracker = JobTracker::submit(api, store, upload, config).await?;
            eprintln!("  job {}", tracker.job_id());
            finish(&tracker, out).await
        }
        Command::Watch { job_id, out } => {
            let store = tracked_store(cli.state_file)?;
            let tracker = match job_id {
                Some(job_id) => JobTracker::track(api, store, job_id, config).await?,
                None => JobTracker::resume(api, store, config)
                    .await?
                    .context("no tracked job to resume")?,
            };
            finish(&tracker, out).await
        }
        Command::History { limit, q } => {
            let rows = api.history(&HistoryQuery { limit, q }).await?;
            for row in rows {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    row.job_id,
                    row.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    row.source_name.unwrap_or_default(),
                    row.backend.unwrap_or_default(),
                    row.user.unwrap_or_default(),
                );
            }
            Ok(())
        }
        Command::Clear => {
            let store = tracked_store(cli.state_file)?;
            if let Some(job_id) = store.load().await? {
                store.clear(&job_id).await?;
                eprintln!("  forgot job {job_id}");
            }
            Ok(())
        }
    }
}
