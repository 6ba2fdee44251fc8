//! Pipeline nodes wiring ensembling into the optimization run, with their options and
//! result loggers.

/// Pipeline options.
pub mod config;
/// The four ensemble nodes and their inputs and outputs.
pub mod gating;
/// Result loggers fed by the optimizer.
pub mod loggers;

pub use config::{PipelineConfig, MASTER_TASK_ID, STANDALONE_TASK_ID};
pub use gating::{
    AddEnsembleLogger, BuildEnsemble, BuildOutcome, EnableComputePredictionsForEnsemble,
    EnsembleInputs, FitResult, OptimizationSummary, PredictionCollector, RunContext,
    SavePredictionsForEnsemble, TrainingInfo,
};
pub use loggers::{EnsembleLogger, ResultLogger, TrialLogger, TrialRecord};
