#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Autonet ensemble stack: fold combination, greedy ensemble selection, the prediction store,
//! and the pipeline nodes that tie them into a hyperparameter search.

/// Model identifiers and data splits.
#[path = "../identifiers.rs"]
pub mod identifiers;

/// Error type shared by the ensemble stack.
#[path = "../errors.rs"]
pub mod errors;

/// Scoring metrics.
#[path = "../metrics.rs"]
pub mod metrics;

/// JSON encoding that keeps non-finite floats.
#[path = "../floats.rs"]
pub mod floats;

/// Label and prediction transforms.
#[path = "../transform.rs"]
pub mod transform;

/// Telemetry helpers for structured JSONL logging.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Fold combination.
#[path = "../combining/main.rs"]
pub mod combining;

/// Greedy ensemble selection.
#[path = "../selection/main.rs"]
pub mod selection;

/// Prediction artifact and trial history.
#[path = "../store/main.rs"]
pub mod store;

/// End-to-end ensemble build.
#[path = "../builder.rs"]
pub mod builder;

/// Pipeline nodes.
#[path = "../nodes/main.rs"]
pub mod nodes;

pub use builder::{build_ensemble, EnsembleBuild};
pub use combining::{CombinedPrediction, PredictionCombinator, PredictionRecord};
pub use errors::{EnsembleError, Result};
pub use identifiers::{ModelIdentifier, Split};
pub use metrics::{metric_by_name, Accuracy, FnMetric, LogLoss, MeanSquaredError, Metric};
pub use nodes::{
    AddEnsembleLogger, BuildEnsemble, BuildOutcome, EnableComputePredictionsForEnsemble,
    EnsembleInputs, FitResult, PipelineConfig, SavePredictionsForEnsemble,
};
pub use selection::{Ensemble, EnsembleSelector, EnsembleWeights, SelectionSettings};
pub use store::{PredictionStore, StoredPredictions, TrialHistory};
pub use telemetry::{EnsembleTelemetry, LogLevel};
pub use transform::{IdentityTransform, LabelSet, LabelTransform, OneHotDecoding};
