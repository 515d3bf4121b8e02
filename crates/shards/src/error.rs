use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShardError>;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid shard directory: {0}")]
    InvalidPath(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt shard {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Another merge is already running in {0}")]
    MergeInProgress(String),

    #[error("Shard directory {0} is in use by another process")]
    DirectoryBusy(String),

    #[error("Shard directory {0} was opened read-only")]
    ReadOnly(String),

    #[error("{0}")]
    Other(String),
}

impl ShardError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
