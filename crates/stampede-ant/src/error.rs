use thiserror::Error;

pub type AntResult<T> = Result<T, AntError>;

/// Errors surfaced by the downloader.
#[derive(Debug, Error)]
pub enum AntError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `start()` on a downloader that already ran.
    #[error("already started")]
    AlreadyStarted,

    /// Lifecycle mis-sequence, e.g. `retry()` while still downloading.
    #[error("bad status for this operation")]
    BadStatus,

    /// The downloader terminated before the requested offset was produced.
    #[error("downloader stopped")]
    Stopped,

    #[error("downloader destroyed")]
    Destroyed,

    /// The caller's cancellation token fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
