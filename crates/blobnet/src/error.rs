use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("torrent not found")]
    TorrentNotFound,
    #[error("tag not found")]
    TagNotFound,
    #[error("blob not cached")]
    NotCached,
    #[error("blob still downloading")]
    StillDownloading,
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("tracker error: {0}")]
    Tracker(#[from] reqwest::Error),
    #[error("wire error: {0}")]
    Wire(#[from] blobnet_proto::WireError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("download deadline exceeded")]
    DownloadTimeout,
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("piece already committed")]
    AlreadyHave,
    #[error("request pipeline full")]
    PipelineFull,
    #[error("overloaded")]
    Overloaded,
    #[error("handshake rejected: {0}")]
    HandshakeReject(String),
    #[error("scheduler is reloading")]
    SchedulerReloading,
    #[error("torrent evicted")]
    TorrentEvicted,
    #[error("cancelled")]
    Cancelled,
    /// The scheduler could not be restarted. The process should exit and
    /// come back up with its original configuration.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn checksum_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Self::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
