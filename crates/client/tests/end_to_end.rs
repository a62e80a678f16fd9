//! Client against a live server on a loopback port, with the scripted
//! engine standing in for the converter.

use std::sync::Arc;
use std::time::Duration;

use docjobs_client::{
    ClientError, HttpJobApi, JobApi, JobTracker, MemoryTrackedJobStore, SyncConfig, SyncPhase,
    TrackedJobStore, Upload,
};
use docjobs_core::{HistoryQuery, MemoryEventLog, Stage};
use docjobs_server::engine::{ConversionEngine, ScriptedEngine};
use docjobs_server::{create_app, AppState, Settings};
use pretty_assertions::assert_eq;

struct Server {
    base_url: String,
    _dir: tempfile::TempDir,
}

async fn start_server(engine: impl ConversionEngine + 'static) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        Settings::with_output_root(dir.path()),
        Arc::new(engine),
        Arc::new(MemoryEventLog::new()),
    );
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server {
        base_url: format!("http://{addr}"),
        _dir: dir,
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(50),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        max_stream_attempts: 3,
        log_capacity: 100,
    }
}

fn upload(name: &str) -> Upload {
    Upload {
        file_name: name.to_string(),
        bytes: b"%PDF-1.4 fake".to_vec(),
        backend: None,
        mode: Some("auto".into()),
        user: Some("ana".into()),
    }
}

#[tokio::test]
async fn test_submit_and_track_to_result() {
    let engine = ScriptedEngine::succeeding()
        .with_steps([0u8, 40, 80, 100])
        .with_delay(Duration::from_millis(20));
    let server = start_server(engine).await;
    let api = Arc::new(HttpJobApi::new(&server.base_url).unwrap());
    let store = Arc::new(MemoryTrackedJobStore::new());

    let tracker = JobTracker::submit(api.clone(), store.clone(), upload("Quarterly.pdf"), config())
        .await
        .unwrap();
    assert_eq!(
        store.load().await.unwrap().as_deref(),
        Some(tracker.job_id())
    );

    let view = tokio::time::timeout(Duration::from_secs(10), tracker.settled())
        .await
        .unwrap();
    assert_eq!(view.phase(), SyncPhase::Settled);
    assert_eq!(view.ok(), Some(true));
    assert_eq!(view.stage(), Stage::Done);
    assert_eq!(view.percent(), 100);
    assert_eq!(view.source_name(), Some("Quarterly.pdf"));
    assert_eq!(tracker.fetch_count(), 1);
    assert!(tracker.artifact().unwrap().starts_with("# Quarterly"));
    assert_eq!(store.load().await.unwrap(), None);

    let rows = api.history(&HistoryQuery::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].job_id, tracker.job_id());
    assert_eq!(rows[0].user.as_deref(), Some("ana"));
    assert_eq!(rows[0].mode.as_deref(), Some("auto"));
}

#[tokio::test]
async fn test_failed_job_surfaces_error_without_fetch() {
    let engine = ScriptedEngine::failing("Failed to convert. Detected Layout engine issue.")
        .with_steps([0u8, 10])
        .with_delay(Duration::from_millis(10));
    let server = start_server(engine).await;
    let api = Arc::new(HttpJobApi::new(&server.base_url).unwrap());
    let store = Arc::new(MemoryTrackedJobStore::new());

    let tracker = JobTracker::submit(api.clone(), store, upload("bad.pdf"), config())
        .await
        .unwrap();
    let view = tokio::time::timeout(Duration::from_secs(10), tracker.settled())
        .await
        .unwrap();

    assert_eq!(view.ok(), Some(false));
    assert_eq!(
        view.error(),
        Some("Failed to convert. Detected Layout engine issue.")
    );
    assert_eq!(tracker.fetch_count(), 0);

    match api.result(tracker.job_id()).await {
        Err(ClientError::JobFailed(message)) => assert!(message.contains("Layout engine")),
        other => panic!("expected JobFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_errors_map_to_client_errors() {
    let slow = ScriptedEngine::succeeding()
        .with_steps([0u8, 100])
        .with_delay(Duration::from_millis(400));
    let server = start_server(slow).await;
    let api = HttpJobApi::new(&server.base_url).unwrap();

    assert!(matches!(
        api.snapshot("missing").await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        api.events("missing").await.err(),
        Some(ClientError::NotFound(_))
    ));

    let submitted = api.submit(upload("slow.pdf")).await.unwrap();
    assert!(matches!(
        api.result(&submitted.job_id).await,
        Err(ClientError::NotReady(_))
    ));

    let mut bad_mode = upload("x.pdf");
    bad_mode.mode = Some("fast".into());
    assert!(matches!(
        api.submit(bad_mode).await,
        Err(ClientError::Status { status: 400, .. })
    ));
}

#[tokio::test]
async fn test_tracking_unknown_job_settles_as_lost() {
    let server = start_server(ScriptedEngine::succeeding()).await;
    let api = Arc::new(HttpJobApi::new(&server.base_url).unwrap());
    let store = Arc::new(MemoryTrackedJobStore::with_job("20240101_000000_00000000"));

    let tracker = JobTracker::resume(api, store.clone(), config())
        .await
        .unwrap()
        .unwrap();
    let view = tokio::time::timeout(Duration::from_secs(10), tracker.settled())
        .await
        .unwrap();
    assert!(view.is_lost());
    assert_eq!(store.load().await.unwrap(), None);
}
