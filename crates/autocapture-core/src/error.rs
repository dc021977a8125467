//! Error types for autocapture-core
//!
//! Errors are split by concern. Each engine module either returns one of the
//! enums below or its own enum (`LockError`, `ReadError`, `HandoffError`,
//! `MediaError`), and all of them convert into the crate-level [`Error`].
//!
//! "Already done" is never an error: `put_new` on an existing id surfaces as
//! [`StoreError::AlreadyExists`] and every caller in this crate treats that
//! variant as a successful no-op.

use thiserror::Error;

use crate::handoff::HandoffError;
use crate::lock::LockError;
use crate::media::MediaError;
use crate::resilient::ReadError;

/// SQLite error fingerprints that indicate a reader collided with a writer or
/// caught the file mid-commit. Matched case-insensitively against the error
/// text.
pub const TRANSIENT_SQLITE_FINGERPRINTS: &[&str] = &[
    "database is locked",
    "disk i/o error",
    "malformed",
    "busy",
    "readonly",
];

/// Returns true when an error message matches a known-transient SQLite
/// failure.
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_SQLITE_FINGERPRINTS
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for autocapture-core
#[derive(Error, Debug)]
pub enum Error {
    /// Record store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Instance lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Resilient read errors
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// Handoff ingest errors
    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// Media blob errors
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Record decode/validation errors
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable snake_case label used in tool JSON output.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Storage(StoreError::UnsupportedSchema { .. }) => "unsupported_schema",
            Self::Storage(_) => "storage_error",
            Self::Lock(LockError::Held { .. }) => "instance_lock_held",
            Self::Lock(_) => "lock_error",
            Self::Read(ReadError::Exhausted { .. }) => "read_retries_exhausted",
            Self::Read(_) => "read_error",
            Self::Handoff(HandoffError::MissingMedia { .. }) => "handoff_media_missing",
            Self::Handoff(_) => "handoff_error",
            Self::Media(_) => "media_error",
            Self::Config(_) => "config_error",
            Self::Record(_) => "record_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// One-line operator guidance, when there is something actionable.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Lock(LockError::Held { .. }) => {
                Some("Another writer owns this data directory; stop it or retry later.")
            }
            Self::Handoff(HandoffError::MissingMedia { .. }) => Some(
                "The handoff batch references media that is not present; re-export it or rerun without strict mode.",
            ),
            Self::Storage(StoreError::UnsupportedSchema { .. }) => {
                Some("The database has neither a `metadata` nor a `records` table.")
            }
            Self::Read(ReadError::Exhausted { .. }) => {
                Some("The database stayed locked or corrupt across all retries; retry when capture is idle.")
            }
            Self::Config(_) => Some("Fix the configuration file and rerun."),
            _ => None,
        }
    }

    /// Whether the underlying failure matches a transient SQLite signature.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Read(ReadError::Sqlite(message)) => is_transient_message(message),
            _ => false,
        }
    }
}

/// Record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// `put_new` found an existing record. Callers treat this as "already done".
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported record table schema in {path}: {detail}")]
    UnsupportedSchema { path: String, detail: String },

    #[error("Corrupt payload for {id}: {detail}")]
    CorruptPayload { id: String, detail: String },
}

impl StoreError {
    /// Whether this failure is one of the transient SQLite signatures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(message) => is_transient_message(message),
            _ => false,
        }
    }

    /// Whether this is the soft "already exists" outcome of `put_new`.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Record decode/validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record payload is not a JSON object")]
    NotAnObject,

    #[error("record has no record_type")]
    MissingRecordType,

    #[error("{record_type}: required field `{field}` is missing or empty")]
    MissingField {
        record_type: String,
        field: &'static str,
    },

    #[error("{record_type}: {detail}")]
    Decode { record_type: String, detail: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
