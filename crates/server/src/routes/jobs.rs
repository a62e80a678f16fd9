// crates/server/src/routes/jobs.rs
//! Job submission, snapshot, stream and result endpoints.
//!
//! - POST /convert              — upload a PDF and start a job
//! - GET  /jobs                 — live (non-terminal) jobs, newest first
//! - GET  /jobs/{id}            — snapshot of one job record
//! - GET  /jobs/{id}/events     — SSE stream of the job's events
//! - GET  /jobs/{id}/result     — converted Markdown
//! - GET  /jobs/{id}/input      — the uploaded document

use std::convert::Infallible;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use docjobs_core::{frame, new_job_id, JobRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::engine::ConvertMode;
use crate::error::{ApiError, ApiResult};
use crate::jobs::Submission;
use crate::state::AppState;

/// Header carrying the submitting user's name.
pub const USER_HEADER: &str = "x-docjobs-user";
const UPLOAD_FIELD: &str = "file";
const DEFAULT_UPLOAD_NAME: &str = "upload.pdf";

#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    pub backend: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ConvertResponse {
    pub job_id: String,
    pub events_url: String,
    pub result_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    #[serde(default = "default_download")]
    pub download: bool,
}

fn default_download() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct ResultBody {
    pub job_id: String,
    pub markdown: String,
}

/// An upload written to the job directory.
struct Upload {
    path: PathBuf,
    file_name: String,
    sha256: String,
    size_bytes: u64,
}

/// Strip any directory part a client put in the file name.
fn sanitize_file_name(raw: Option<&str>) -> String {
    raw.and_then(|name| name.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or(DEFAULT_UPLOAD_NAME)
        .to_string()
}

async fn receive_upload(multipart: &mut Multipart, job_dir: &FsPath) -> ApiResult<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = sanitize_file_name(field.file_name());
        let path = job_dir.join(&file_name);

        tokio::fs::create_dir_all(job_dir)
            .await
            .map_err(|e| ApiError::Internal(format!("create {}: {e}", job_dir.display())))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError::Internal(format!("create {}: {e}", path.display())))?;

        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::Internal(format!("write {}: {e}", path.display())))?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::Internal(format!("write {}: {e}", path.display())))?;

        return Ok(Upload {
            path,
            file_name,
            sha256: hex::encode(hasher.finalize()),
            size_bytes,
        });
    }
    Err(ApiError::BadRequest(format!("missing multipart field '{UPLOAD_FIELD}'")))
}

/// POST /api/convert — accept an upload and return the job id immediately.
async fn convert(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConvertQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<ConvertResponse>> {
    let mode = match query.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(raw) => Some(raw.parse::<ConvertMode>().map_err(ApiError::BadRequest)?),
        None => None,
    };
    let backend = query
        .backend
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty());
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(String::from);

    let job_id = new_job_id(Utc::now());
    let job_dir = state.settings.output_root.join(&job_id);
    let upload = match receive_upload(&mut multipart, &job_dir).await {
        Ok(upload) => upload,
        Err(e) => {
            // Nothing was registered yet; drop the partial directory.
            let _ = tokio::fs::remove_dir_all(&job_dir).await;
            return Err(e);
        }
    };

    let job_id = state
        .runner
        .submit(Submission {
            job_id,
            job_dir,
            input: upload.path,
            source_name: upload.file_name,
            backend,
            mode,
            user,
            sha256: upload.sha256,
            size_bytes: upload.size_bytes,
        })
        .await;

    Ok(Json(ConvertResponse {
        events_url: format!("/api/jobs/{job_id}/events"),
        result_url: format!("/api/jobs/{job_id}/result"),
        job_id,
    }))
}

/// GET /api/jobs — live jobs.
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobRecord>> {
    Json(state.store.active())
}

/// GET /api/jobs/{id} — current record.
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state
        .store
        .snapshot(&job_id)
        .map(Json)
        .ok_or(ApiError::JobNotFound(job_id))
}

/// GET /api/jobs/{id}/events — SSE stream.
///
/// Opens with a `snapshot`, replays buffered log lines, then follows live
/// events until the terminal state has been sent.
async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let mut subscription = state
        .bus
        .subscribe(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    let stream = async_stream::stream! {
        while let Some(event) = subscription.next_event().await {
            match frame::encode_data(&event) {
                Ok(data) => yield Ok(Event::default().event(frame::EVENT_NAME).data(data)),
                Err(e) => tracing::warn!(job_id = %subscription.job_id(), error = %e, "failed to encode job event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// GET /api/jobs/{id}/result?download=bool
async fn job_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> ApiResult<Response> {
    let record = state
        .store
        .snapshot(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    let result_path = match record.ok {
        None => return Err(ApiError::NotReady(job_id)),
        Some(false) => {
            return Err(ApiError::JobFailed {
                job_id,
                error: record.error.unwrap_or_default(),
            })
        }
        Some(true) => record
            .result_path
            .ok_or_else(|| ApiError::Internal(format!("job {job_id} succeeded without a result")))?,
    };

    let markdown = match tokio::fs::read_to_string(&result_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::JobNotFound(job_id))
        }
        Err(e) => return Err(ApiError::Internal(format!("read {result_path}: {e}"))),
    };

    if !query.download {
        return Ok(Json(ResultBody { job_id, markdown }).into_response());
    }

    let file_name = FsPath::new(&result_path)
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "_"))
        .unwrap_or_else(|| format!("{job_id}.md"));
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        markdown,
    )
        .into_response())
}

/// GET /api/jobs/{id}/input — stream the stored upload back.
async fn job_input(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let slot = state
        .store
        .get(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;
    let path = slot.input_path();

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::JobNotFound(job_id))
        }
        Err(e) => return Err(ApiError::Internal(format!("open {}: {e}", path.display()))),
    };
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(format!("stat {}: {e}", path.display())))?
        .len();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "_"))
        .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/convert", post(convert))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/events", get(job_events))
        .route("/jobs/{id}/result", get(job_result))
        .route("/jobs/{id}/input", get(job_input))
}
