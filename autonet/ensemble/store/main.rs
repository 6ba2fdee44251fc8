//! On-disk artifacts: the prediction store and the trial history.

/// Prediction artifact reader/writer.
pub mod artifact;
/// Trial history reader.
pub mod history;

pub use artifact::{PredictionStore, StoredPredictions, ARTIFACT_FILE};
pub use history::{results_path, TrialEntry, TrialHistory, RESULTS_FILE};
