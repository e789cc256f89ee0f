use thiserror::Error;

/// Main error type for the hypertune system
#[derive(Error, Debug)]
pub enum HtError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Suggestion error: {0}")]
    Suggest(#[from] SuggestError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No complete trials in study {study}")]
    NoCompleteTrials { study: String },

    #[error("Trial {trial} failed: {message}")]
    TrialFailed { trial: u64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Trial {number} already persisted for study {study}")]
    DuplicateTrial { study: String, number: u64 },

    #[error("Journal corrupt at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a parameter suggester
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SuggestError {
    #[error("Invalid domain for parameter {parameter}: {message}")]
    InvalidDomain { parameter: String, message: String },

    #[error("Unknown parameter: {parameter}")]
    UnknownParameter { parameter: String },

    #[error("Suggester state poisoned: {message}")]
    Poisoned { message: String },
}

/// Errors raised while driving the external evaluator process
#[derive(Error, Debug)]
pub enum EvaluatorError {
    #[error("Missing value for parameter {parameter}")]
    MissingParameter { parameter: String },

    #[error("Failed to prepare {path}: {source}")]
    Prepare {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        source: std::io::Error,
    },

    #[error("Failed to wait for evaluator: {0}")]
    Wait(std::io::Error),

    #[error("Timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("Failed to read {path}: {source}")]
    MetaRead {
        path: String,
        source: std::io::Error,
    },
}

/// Result type alias for hypertune operations
pub type HtResult<T> = Result<T, HtError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HtError::Config(format!($($arg)*))
    };
}
