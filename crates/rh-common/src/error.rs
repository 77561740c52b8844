//! Error types for roguehound.

use thiserror::Error;

/// Result type alias for roguehound operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for roguehound.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown band: {0:?} (valid: low, medium, elevated, high, critical)")]
    UnknownBand(String),

    #[error("retention days must be >= 1, got {days}")]
    InvalidRetention { days: i64 },

    // Collection errors (20-29)
    #[error("process collection failed: {0}")]
    Collection(String),

    // Storage errors (30-39)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database not found at {path}")]
    DatabaseNotFound { path: String },

    // Forensics errors (40-49)
    #[error("trace save failed: {0}")]
    TraceSave(String),

    #[error("trace save refused: privileged invocation denied ({0})")]
    PrivilegedToolDenied(String),

    #[error("trace decode failed: {0}")]
    TraceDecode(String),

    #[error("log query failed: {0}")]
    LogQuery(String),

    // Daemon errors (50-59)
    #[error("daemon is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("boot time unavailable: {0}")]
    BootTime(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in CLI output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::UnknownBand(_) => 11,
            Error::InvalidRetention { .. } => 12,
            Error::Collection(_) => 20,
            Error::Database(_) => 30,
            Error::DatabaseNotFound { .. } => 31,
            Error::TraceSave(_) => 40,
            Error::PrivilegedToolDenied(_) => 41,
            Error::TraceDecode(_) => 42,
            Error::LogQuery(_) => 43,
            Error::AlreadyRunning { .. } => 50,
            Error::BootTime(_) => 51,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }
}
