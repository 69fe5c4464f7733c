use thiserror::Error;

pub type HlsResult<T> = Result<T, HlsError>;

/// HLS orchestration errors.
#[derive(Debug, Error)]
pub enum HlsError {
    #[error("network error: {0}")]
    Net(#[from] stampede_net::NetError),

    #[error("downloader error: {0}")]
    Ant(#[from] stampede_ant::AntError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// The body does not start with `#EXTM3U`.
    #[error("not an m3u8 manifest")]
    NotManifest,

    /// A media playlist was required but a master arrived.
    #[error("expected a media playlist, got a master playlist")]
    MasterPlaylist,

    /// A playlist mixing zero- and positive-duration entries is meaningless.
    #[error("invalid playlist: mixed nested-playlist and segment entries")]
    MixedManifest,

    #[error("still in use")]
    StillInUse,

    #[error("upstream fetch timed out")]
    FetchTimeout,
}
