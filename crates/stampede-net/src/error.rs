use thiserror::Error;
use url::Url;

pub type NetResult<T> = Result<T, NetError>;

/// Errors produced by the HTTP layer.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    /// Transport-level failure (connect, TLS, reset, ...).
    #[error("http request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// Non-success status on a call that requires one.
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: Url },

    #[error("invalid Content-Range value: {0:?}")]
    InvalidContentRange(String),
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        // Alternate formatting keeps the source chain in the message.
        Self::Transport(format!("{e:#}"))
    }
}
