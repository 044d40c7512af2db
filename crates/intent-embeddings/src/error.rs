//! Error type for training, inference, and persistence of the intent classifier.
//!
//! # Error Categories
//!
//! | Category | Variants | Propagation |
//! |----------|----------|-------------|
//! | Data | InsufficientLabels, InvalidInput | Reported to caller, training skipped |
//! | Validation | DimensionMismatch | Hard error, never padded or truncated |
//! | Model | ModelNotFound | Caller degrades to "unknown" predictions |
//! | Configuration | ConfigError | Fix configuration |
//! | Infrastructure | TensorError, IoError | Propagate |
//! | Serialization | SerializationError | Fix artifact |
//!
//! Auto-corrected configuration issues are not errors; see [`ConfigWarning`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Error type for all classifier failures.
#[derive(Debug, Error)]
pub enum ClassifierError {
    // === Data Errors ===
    /// Fewer than two distinct labels were observed; nothing to discriminate.
    #[error("Insufficient labels: need at least 2 distinct labels, found {found}")]
    InsufficientLabels { found: usize },

    /// Training or inference input is malformed (empty set, unknown label, NaN).
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    // === Validation Errors ===
    /// Feature vector dimensionality disagrees with the trained input tower.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // === Model Errors ===
    /// Persisted artifact is missing at the expected path.
    #[error("Model not found at {path}")]
    ModelNotFound { path: PathBuf },

    // === Configuration Errors ===
    /// Configuration file unreadable, unparsable, or out of range.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    // === Infrastructure Errors ===
    /// Tensor backend operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },

    /// File I/O error (artifacts, example files, config files).
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Artifact or example (de)serialization failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for classifier operations.
pub type ClassifierResult<T> = Result<T, ClassifierError>;

/// Configuration issue that was corrected automatically.
///
/// Each warning is logged at the point of correction; callers may also
/// inspect them after [`crate::config::ClassifierConfig::normalized`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// Label tokenization requested without a split symbol; tokenization disabled.
    TokenizationWithoutDelimiter,
    /// Evaluation interval below 1; evaluation runs once on the final epoch.
    EvaluationIntervalClamped { requested: i64, epochs: usize },
    /// `num_neg` exceeds the number of incorrect labels available.
    NegativesClamped { requested: usize, clamped: usize },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenizationWithoutDelimiter => write!(
                f,
                "intent_split_symbol was not specified, so intent tokenization will be ignored"
            ),
            Self::EvaluationIntervalClamped { requested, epochs } => write!(
                f,
                "evaluate_every_num_epochs={} is below 1, evaluating once after epoch {}",
                requested, epochs
            ),
            Self::NegativesClamped { requested, clamped } => write!(
                f,
                "num_neg={} exceeds available incorrect labels, using {}",
                requested, clamped
            ),
        }
    }
}
