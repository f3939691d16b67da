use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("release service rate limit reached: {0}")]
    RateLimited(String),

    #[error("release is incomplete: {0}")]
    Release(String),

    #[error("authentication required: {0}")]
    Auth(String),

    #[error("malformed manifest: {0}")]
    ManifestParse(String),

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("permission denied writing {}", path.display())]
    Permission { path: PathBuf },

    #[error("host process {pid} did not exit within {timeout_secs}s")]
    ProcessTimeout { pid: u32, timeout_secs: u64 },

    #[error("update cancelled")]
    Cancelled,

    #[error("invalid version: {0}")]
    Version(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpdateError {
    /// Transient failures are retried on the next scheduled check, never within a cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited(_))
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
