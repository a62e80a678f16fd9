// crates/client/src/error.rs
use thiserror::Error;

/// Failures seen by the client side of a job.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server does not know the job (never existed or evicted).
    #[error("job not found: {0}")]
    NotFound(String),

    /// The result was requested before the job finished.
    #[error("job not ready: {0}")]
    NotReady(String),

    /// The job finished with `ok=false`.
    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors that a retry against the same server may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Io(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
