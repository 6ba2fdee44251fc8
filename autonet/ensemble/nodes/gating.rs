use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    config::PipelineConfig,
    loggers::{EnsembleLogger, ResultLogger},
};
use crate::{
    builder::build_ensemble,
    combining::PredictionRecord,
    errors::{EnsembleError, Result},
    identifiers::{ModelIdentifier, Split},
    metrics::{metric_by_name, Metric},
    selection::Ensemble,
    store::{PredictionStore, TrialHistory},
    telemetry::{self, EnsembleTelemetry, LogLevel},
    transform::{LabelSet, LabelTransform, OneHotDecoding},
};

/// Per-run switches that can veto ensembling regardless of configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunContext {
    /// Final training pass of a chosen configuration on full data.
    pub refit: bool,
    /// Positive when the run violated a constraint.
    pub loss_penalty: f64,
}

impl RunContext {
    /// Ordinary search-time evaluation.
    #[must_use]
    pub const fn search() -> Self {
        Self {
            refit: false,
            loss_penalty: 0.0,
        }
    }

    /// Refit pass.
    #[must_use]
    pub const fn refit() -> Self {
        Self {
            refit: true,
            loss_penalty: 0.0,
        }
    }

    /// Whether this run keeps per-sample predictions for ensembling.
    #[must_use]
    pub fn collects_predictions(&self, config: &PipelineConfig) -> bool {
        !self.refit && config.ensemble_enabled() && self.loss_penalty <= 0.0
    }
}

/// Per-split fold predictions gathered while a configuration trains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionCollector {
    folds: IndexMap<Split, Vec<Array2<f64>>>,
}

impl PredictionCollector {
    /// Records the predictions of one fold for `split`.
    pub fn record(&mut self, split: Split, predictions: Array2<f64>) {
        self.folds.entry(split).or_default().push(predictions);
    }

    /// Folds collected for `split`.
    #[must_use]
    pub fn folds(&self, split: Split) -> &[Array2<f64>] {
        self.folds.get(&split).map(Vec::as_slice).unwrap_or_default()
    }

    fn take(&mut self, split: Split) -> Vec<Array2<f64>> {
        self.folds.shift_remove(&split).unwrap_or_default()
    }
}

/// Outcome of training one configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingInfo {
    /// Named scores reported by training.
    pub metrics: IndexMap<String, f64>,
    /// Collected per-sample predictions, present only when collection was enabled.
    pub predictions: Option<PredictionCollector>,
}

/// Result of [`SavePredictionsForEnsemble::fit`].
#[derive(Debug, Clone, PartialEq)]
pub enum FitResult {
    /// Ensembling is gated off for this run.
    Plain {
        /// Training loss.
        loss: f64,
        /// Training info with predictions stripped.
        info: TrainingInfo,
    },
    /// Validation (and maybe test) folds were kept for the ensemble builder.
    WithPredictions {
        /// Training loss.
        loss: f64,
        /// Training info with predictions stripped.
        info: TrainingInfo,
        /// Folds to hand to the ensemble logger.
        record: PredictionRecord,
    },
}

impl FitResult {
    /// Training loss.
    #[must_use]
    pub const fn loss(&self) -> f64 {
        match self {
            Self::Plain { loss, .. } | Self::WithPredictions { loss, .. } => *loss,
        }
    }

    /// Training info.
    #[must_use]
    pub const fn info(&self) -> &TrainingInfo {
        match self {
            Self::Plain { info, .. } | Self::WithPredictions { info, .. } => info,
        }
    }

    /// Kept predictions, if any.
    #[must_use]
    pub const fn record(&self) -> Option<&PredictionRecord> {
        match self {
            Self::Plain { .. } => None,
            Self::WithPredictions { record, .. } => Some(record),
        }
    }

    /// Keys a dictionary-based caller would see in this result.
    #[must_use]
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = vec!["loss", "info"];
        if let Some(record) = self.record() {
            fields.push("predictions_for_ensemble");
            if !record.test.is_empty() {
                fields.push("test_predictions_for_ensemble");
            }
        }
        fields
    }
}

/// Result of the hyperparameter search handed to [`BuildEnsemble`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSummary {
    /// Best score found by the search.
    pub final_metric_score: f64,
    /// Configuration achieving it.
    pub optimized_hyperparameter_config: Value,
    /// Budget it was evaluated at.
    pub budget: f64,
}

/// Result of [`BuildEnsemble::fit`].
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Ensembling was not run; only the search summary is passed on.
    Skipped(OptimizationSummary),
    /// An ensemble was selected.
    EnsembleBuilt {
        /// Search summary, passed through.
        summary: OptimizationSummary,
        /// Selected ensemble.
        ensemble: Ensemble,
        /// Ensemble validation score.
        ensemble_final_metric_score: f64,
        /// Hyperparameter configs of the members.
        ensemble_configs: IndexMap<ModelIdentifier, Value>,
        /// Ensemble test score, when a test split was stored.
        ensemble_test_score: Option<f64>,
    },
}

impl BuildOutcome {
    /// Search summary.
    #[must_use]
    pub const fn summary(&self) -> &OptimizationSummary {
        match self {
            Self::Skipped(summary) | Self::EnsembleBuilt { summary, .. } => summary,
        }
    }

    /// Built ensemble, if any.
    #[must_use]
    pub const fn ensemble(&self) -> Option<&Ensemble> {
        match self {
            Self::Skipped(_) => None,
            Self::EnsembleBuilt { ensemble, .. } => Some(ensemble),
        }
    }

    /// Keys a dictionary-based caller would see in this outcome.
    #[must_use]
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut fields = vec!["final_metric_score", "optimized_hyperparameter_config", "budget"];
        if let Self::EnsembleBuilt { .. } = self {
            fields.extend(["ensemble", "ensemble_final_metric_score", "ensemble_configs"]);
        }
        fields
    }
}

/// Collaborators the ensemble builder needs, injected instead of looked up by name.
#[derive(Clone)]
pub struct EnsembleInputs {
    /// Metric scoring candidates and ensembles.
    pub metric: Arc<dyn Metric>,
    /// Transform applied to stored labels and predictions.
    pub transform: Arc<dyn LabelTransform>,
}

impl std::fmt::Debug for EnsembleInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleInputs")
            .field("metric", &self.metric.name())
            .finish_non_exhaustive()
    }
}

impl EnsembleInputs {
    /// Bundles a metric and a transform.
    #[must_use]
    pub const fn new(metric: Arc<dyn Metric>, transform: Arc<dyn LabelTransform>) -> Self {
        Self { metric, transform }
    }

    /// Uses the configured train metric and one-hot label decoding.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            metric: metric_by_name(&config.train_metric)?,
            transform: Arc::new(OneHotDecoding),
        })
    }
}

macro_rules! telemetry_node {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone)]
        pub struct $name {
            telemetry: Option<EnsembleTelemetry>,
        }

        impl $name {
            /// Creates the node.
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// Attaches telemetry.
            #[must_use]
            pub fn with_telemetry(mut self, telemetry: EnsembleTelemetry) -> Self {
                self.telemetry = Some(telemetry);
                self
            }

            fn log(&self, level: LogLevel, message: &str, metadata: Value) {
                telemetry::log(self.telemetry.as_ref(), level, message, metadata);
            }
        }
    };
}

telemetry_node!(
    /// Turns on per-sample prediction collection during training. Runs after the metric
    /// selector.
    EnableComputePredictionsForEnsemble
);
telemetry_node!(
    /// Moves collected fold predictions out of the training info. Runs after training.
    SavePredictionsForEnsemble
);
telemetry_node!(
    /// Selects the ensemble once optimization has finished.
    BuildEnsemble
);
telemetry_node!(
    /// Registers the prediction-store logger ahead of the optimizer's result loggers.
    AddEnsembleLogger
);

impl EnableComputePredictionsForEnsemble {
    /// Returns a collector when this run should keep per-sample predictions.
    #[must_use]
    pub fn fit(&self, config: &PipelineConfig, ctx: &RunContext) -> Option<PredictionCollector> {
        let collect = ctx.collects_predictions(config);
        self.log(
            LogLevel::Debug,
            "nodes.collect_predictions",
            json!({ "enabled": collect, "refit": ctx.refit, "loss_penalty": ctx.loss_penalty }),
        );
        collect.then(PredictionCollector::default)
    }
}

impl SavePredictionsForEnsemble {
    /// Splits collected predictions off `info`.
    ///
    /// Fails with [`EnsembleError::MissingValidationPredictions`] when ensembling is on but
    /// training produced no validation folds. Train folds are always discarded.
    pub fn fit(
        &self,
        config: &PipelineConfig,
        ctx: &RunContext,
        identifier: ModelIdentifier,
        loss: f64,
        mut info: TrainingInfo,
    ) -> Result<FitResult> {
        let collected = info.predictions.take();
        if !ctx.collects_predictions(config) {
            return Ok(FitResult::Plain { loss, info });
        }
        let mut collected = collected.unwrap_or_default();
        let validation = collected.take(Split::Validation);
        if validation.is_empty() {
            self.log(
                LogLevel::Error,
                "nodes.missing_validation_predictions",
                json!({ "identifier": identifier.to_string() }),
            );
            return Err(EnsembleError::MissingValidationPredictions);
        }
        let test = collected.take(Split::Test);
        self.log(
            LogLevel::Debug,
            "nodes.predictions_saved",
            json!({
                "identifier": identifier.to_string(),
                "validation_folds": validation.len(),
                "test_folds": test.len(),
            }),
        );
        Ok(FitResult::WithPredictions {
            loss,
            info,
            record: PredictionRecord::new(identifier, validation).with_test(test),
        })
    }
}

impl BuildEnsemble {
    /// Builds the ensemble from the results directory, or passes the summary through when
    /// ensembling does not apply to this run.
    pub fn fit(
        &self,
        config: &PipelineConfig,
        refit: bool,
        summary: OptimizationSummary,
        inputs: &EnsembleInputs,
    ) -> Result<BuildOutcome> {
        if refit || !config.ensemble_enabled() || !config.is_ensemble_builder() {
            self.log(
                LogLevel::Info,
                "nodes.build_skipped",
                json!({
                    "refit": refit,
                    "ensemble_size": config.ensemble_size,
                    "task_id": config.task_id,
                }),
            );
            return Ok(BuildOutcome::Skipped(summary));
        }
        config.validate()?;

        let stored = PredictionStore::read(config.artifact_path(), inputs.transform.as_ref())?;
        let history = TrialHistory::load(&config.result_logger_dir)?;
        self.log(
            LogLevel::Info,
            "nodes.build_start",
            json!({
                "stored_models": stored.predictions.len(),
                "history": history.len(),
                "result_dir": config.result_logger_dir.display().to_string(),
            }),
        );
        let build = build_ensemble(
            &history,
            stored,
            Arc::clone(&inputs.metric),
            config.selection_settings(),
            self.telemetry.as_ref(),
        )?;
        Ok(BuildOutcome::EnsembleBuilt {
            summary,
            ensemble_final_metric_score: build.ensemble.get_validation_performance(),
            ensemble: build.ensemble,
            ensemble_configs: build.configs,
            ensemble_test_score: build.test_score,
        })
    }
}

impl AddEnsembleLogger {
    /// Prepends an [`EnsembleLogger`] to `result_loggers` when ensembling is enabled.
    pub fn fit(
        &self,
        config: &PipelineConfig,
        refit: bool,
        labels: &LabelSet,
        test_labels: Option<&LabelSet>,
        result_loggers: Vec<Box<dyn ResultLogger>>,
    ) -> anyhow::Result<Vec<Box<dyn ResultLogger>>> {
        if refit || !config.ensemble_enabled() {
            return Ok(result_loggers);
        }
        let logger = EnsembleLogger::new(&config.result_logger_dir, labels, test_labels, true)?;
        self.log(
            LogLevel::Info,
            "nodes.ensemble_logger_added",
            json!({ "artifact": logger.path().display().to_string() }),
        );
        let mut loggers: Vec<Box<dyn ResultLogger>> = Vec::with_capacity(result_loggers.len() + 1);
        loggers.push(Box::new(logger));
        loggers.extend(result_loggers);
        Ok(loggers)
    }
}
