use thiserror::Error;

use crate::layout::ModelRole;

/// Terminal errors surfaced by the acquisition pipeline.
///
/// `ExternalToolUnavailable` is deliberately absent: an unusable external
/// extractor is recovered locally by falling back to the in-process path
/// and never reaches the caller.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("archive incomplete: expected {expected} bytes, got {actual}")]
    ArchiveIncomplete { expected: u64, actual: u64 },

    #[error("extraction I/O failure: {0}")]
    ExtractionIo(#[source] std::io::Error),

    #[error("model layout incomplete after repair, missing roles: {missing:?}")]
    VerificationFailed { missing: Vec<ModelRole> },

    #[error("model '{0}' is not in the catalog")]
    UnknownModel(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("an acquisition for model '{0}' is already in flight")]
    AlreadyInFlight(String),

    #[error("insufficient disk space: {required} bytes required, {available} available")]
    DiskSpace { required: u64, available: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquireError {
    /// True for user-initiated aborts, which callers are expected to treat
    /// differently from genuine failures.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquireError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AcquireError>;
