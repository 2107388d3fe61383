use std::path::PathBuf;

/// Errors surfaced by the index, store, watcher and configuration layers.
///
/// Query parsing never fails (malformed syntax degrades to literal terms) and
/// watcher overflow is only logged, so neither has a variant here.
#[derive(Debug, thiserror::Error)]
pub enum SeekrError {
    /// A file could not be read or stat'ed during a walk or extraction.
    #[error("cannot access {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk index is unreadable or inconsistent.
    #[error("index corruption in {path}: {reason}")]
    IndexCorruption { path: PathBuf, reason: String },

    /// Writing a new generation failed; the previous generation is still current.
    #[error("commit of generation {generation} failed: {reason}")]
    CommitFailure { generation: u64, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("index worker is not running")]
    WorkerStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SeekrError>;

impl SeekrError {
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IndexCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::IndexCorruption { .. })
    }
}
