use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Error, Debug)]
pub enum PlatformError {
    /// REST call failed after the connection was established. Callers treat
    /// this as transient: log and continue.
    #[error("platform request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("post not found: {0}")]
    PostNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
