use thiserror::Error;

/// Errors that abort a run (or a request for one) before or instead of doing work.
///
/// Per-target and per-candidate failures never surface here; they are counted.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no targets found in {0}")]
    NoTargets(String),

    #[error("a {0} run is already in progress")]
    AlreadyRunning(String),

    #[error("no run is in progress")]
    NotRunning,

    #[error("unrecognized result store format: {0}")]
    StoreFormat(String),

    #[error("result store not found: {0}")]
    StoreMissing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
