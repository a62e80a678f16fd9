// crates/client/src/api.rs
//! Transport between a tracker and the docjobs server.
//!
//! [`JobApi`] is the seam the tracker is written against; [`HttpJobApi`]
//! is the real implementation over `reqwest`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use docjobs_core::frame::FrameDecoder;
use docjobs_core::{HistoryQuery, HistoryRow, JobEvent, JobId, JobRecord};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

/// Header carrying the submitting user's name.
pub const USER_HEADER: &str = "x-docjobs-user";

/// One item read from a job's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(JobEvent),
    /// A block that could not be decoded. The stream continues after it.
    Malformed(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = ClientResult<StreamItem>> + Send>>;

/// A document to convert.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub backend: Option<String>,
    pub mode: Option<String>,
    pub user: Option<String>,
}

/// Server reply to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Submitted {
    pub job_id: JobId,
    pub events_url: String,
    pub result_url: String,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    markdown: String,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    items: Vec<HistoryRow>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, upload: Upload) -> ClientResult<Submitted>;

    /// Current record of a job.
    async fn snapshot(&self, job_id: &str) -> ClientResult<JobRecord>;

    /// Open the job's event stream.
    async fn events(&self, job_id: &str) -> ClientResult<EventStream>;

    /// The converted Markdown of a finished job.
    async fn result(&self, job_id: &str) -> ClientResult<String>;

    async fn history(&self, query: &HistoryQuery) -> ClientResult<Vec<HistoryRow>>;
}

/// [`JobApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpJobApi {
    base: String,
    http: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        // No overall timeout: event streams stay open for the life of a job.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self { base, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base, path)
    }
}

/// Turn a non-success response into the matching [`ClientError`].
async fn check(response: reqwest::Response, job_id: &str) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .map(|e| e.details.unwrap_or(e.error));
    Err(match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(job_id.to_string()),
        StatusCode::CONFLICT => ClientError::NotReady(job_id.to_string()),
        StatusCode::UNPROCESSABLE_ENTITY => ClientError::JobFailed(detail.unwrap_or(body)),
        _ => ClientError::Status {
            status: status.as_u16(),
            body: detail.unwrap_or(body),
        },
    })
}

async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

/// Decode SSE blocks from a byte stream. Undecodable blocks become
/// [`StreamItem::Malformed`]; a transport error ends the stream.
pub fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ClientError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut decoder = FrameDecoder::new();
        futures_util::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err::<StreamItem, ClientError>(e.into());
                    return;
                }
            };
            decoder.push(chunk.as_ref());
            while let Some(frame) = decoder.next_frame() {
                let item = match frame.and_then(|f| f.parse_event()) {
                    Ok(event) => StreamItem::Event(event),
                    Err(e) => StreamItem::Malformed(e.to_string()),
                };
                yield Ok::<StreamItem, ClientError>(item);
            }
        }
        if decoder.pending_bytes() > 0 {
            tracing::debug!(pending = decoder.pending_bytes(), "event stream closed mid-block");
        }
    };
    Box::pin(stream)
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn submit(&self, upload: Upload) -> ClientResult<Submitted> {
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut query = Vec::new();
        if let Some(backend) = &upload.backend {
            query.push(("backend", backend.as_str()));
        }
        if let Some(mode) = &upload.mode {
            query.push(("mode", mode.as_str()));
        }

        let mut request = self.http.post(self.url("/convert")).query(&query).multipart(form);
        if let Some(user) = &upload.user {
            request = request.header(USER_HEADER, user);
        }
        let response = check(request.send().await?, &upload.file_name).await?;
        json(response).await
    }

    async fn snapshot(&self, job_id: &str) -> ClientResult<JobRecord> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{job_id}")))
            .send()
            .await?;
        json(check(response, job_id).await?).await
    }

    async fn events(&self, job_id: &str) -> ClientResult<EventStream> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{job_id}/events")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = check(response, job_id).await?;
        Ok(decode_events(response.bytes_stream()))
    }

    async fn result(&self, job_id: &str) -> ClientResult<String> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{job_id}/result")))
            .query(&[("download", "false")])
            .send()
            .await?;
        let body: ResultBody = json(check(response, job_id).await?).await?;
        Ok(body.markdown)
    }

    async fn history(&self, query: &HistoryQuery) -> ClientResult<Vec<HistoryRow>> {
        let mut params = vec![("limit", query.effective_limit().to_string())];
        if let Some(q) = query.q.as_deref().filter(|q| !q.trim().is_empty()) {
            params.push(("q", q.to_string()));
        }
        let response = self
            .http
            .get(self.url("/history"))
            .query(&params)
            .send()
            .await?;
        let body: HistoryBody = json(check(response, "history").await?).await?;
        Ok(body.items)
    }
}
