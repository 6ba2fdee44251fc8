use thiserror::Error;

use crate::identifiers::ModelIdentifier;

/// Result alias used across the ensemble crate.
pub type Result<T, E = EnsembleError> = std::result::Result<T, E>;

/// Errors raised while combining, storing, or selecting ensemble predictions.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Ensembling is enabled but the run produced no validation predictions.
    #[error("ensemble building requires validation predictions, but none were produced")]
    MissingValidationPredictions,
    /// Prediction arrays of one model disagree in shape.
    #[error("shape mismatch for {identifier}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Offending model.
        identifier: ModelIdentifier,
        /// Shape every array should have.
        expected: (usize, usize),
        /// Shape that was found.
        found: (usize, usize),
    },
    /// Stored prediction artifact is inconsistent.
    #[error(
        "corrupt prediction artifact ({}): {reason}",
        .identifier.map_or_else(|| "header".to_string(), |id| id.to_string())
    )]
    CorruptArtifact {
        /// Model whose record is broken, `None` for the header.
        identifier: Option<ModelIdentifier>,
        /// Human-readable cause.
        reason: String,
    },
    /// No candidate survived filtering.
    #[error("no ensemble candidates left after filtering")]
    EmptyPool,
    /// Selection parameters or pipeline config make no sense.
    #[error("invalid ensemble configuration: {0}")]
    InvalidConfiguration(String),
    /// An ensemble member has no predictions to combine.
    #[error("no predictions available for ensemble member {0}")]
    MissingMember(ModelIdentifier),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnsembleError {
    pub(crate) fn corrupt(identifier: Option<ModelIdentifier>, reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            identifier,
            reason: reason.into(),
        }
    }
}
