//! Error types for working-copy administration

use std::path::PathBuf;

/// Result type for working-copy operations
pub type Result<T> = std::result::Result<T, WcError>;

/// Why an on-disk generation cannot be used as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatProblem {
    /// Older than anything this library can read
    TooOld,
    /// Written by a newer client
    TooNew,
}

impl std::fmt::Display for FormatProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatProblem::TooOld => write!(f, "too old, please check out a fresh working copy"),
            FormatProblem::TooNew => write!(f, "too new, please get a newer client"),
        }
    }
}

/// Errors that can occur while reading or mutating a working copy
#[derive(Debug, thiserror::Error)]
pub enum WcError {
    #[error("'{0}' is not a working copy")]
    NotAWorkingCopy(PathBuf),

    #[error("Working copy format {format} of '{path}' is {problem}")]
    UnsupportedFormat {
        path: PathBuf,
        format: u32,
        problem: FormatProblem,
    },

    #[error("Entry '{name}' not found in '{dir}'")]
    EntryNotFound { dir: PathBuf, name: String },

    #[error("Schedule conflict on '{name}': {reason}")]
    ScheduleConflict { name: String, reason: String },

    #[error("Property conflict: {0}")]
    PropertyConflict(String),

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}; corrupt text base")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Working copy '{0}' locked")]
    WorkingCopyLocked(PathBuf),

    #[error("No write-lock in '{0}'")]
    NotLocked(PathBuf),

    #[error("'{0}' has local modifications")]
    LocalModificationsPresent(PathBuf),

    #[error("Corrupt record in '{path}': {reason}")]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("Inconsistent line ending style in '{0}'")]
    InconsistentEol(String),

    #[error("Path '{0}' ends in '.' or '..', which is unsupported for this operation")]
    BadPath(PathBuf),

    #[error("Obstructed update: '{path}' is not a working copy of '{url}'")]
    ObstructedUpdate { path: PathBuf, url: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl WcError {
    /// Shorthand for a decode failure in a named file
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        WcError::MalformedRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean "no admin area here" rather than a broken one
    pub fn is_not_working_copy(&self) -> bool {
        matches!(self, WcError::NotAWorkingCopy(_))
    }
}
