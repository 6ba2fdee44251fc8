//! Joins the trial history, the stored predictions, and the selector into one ensemble build.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::{
    combining::{CombinedPrediction, PredictionCombinator},
    errors::{EnsembleError, Result},
    identifiers::{ModelIdentifier, Split},
    metrics::Metric,
    selection::{Ensemble, EnsembleSelector, SelectionSettings},
    store::{StoredPredictions, TrialHistory},
    telemetry::{self, EnsembleTelemetry, LogLevel},
};

/// Output of [`build_ensemble`].
#[derive(Debug, Clone)]
pub struct EnsembleBuild {
    /// Selected ensemble.
    pub ensemble: Ensemble,
    /// Hyperparameter configuration of every member (`null` when the history lacks it).
    pub configs: IndexMap<ModelIdentifier, Value>,
    /// Ensemble score on the test split, when test labels and member test predictions exist.
    pub test_score: Option<f64>,
}

/// Selects an ensemble over every stored model.
///
/// Candidates follow the history's arrival order; stored models the history never saw are
/// appended in store order.
pub fn build_ensemble(
    history: &TrialHistory,
    stored: StoredPredictions,
    metric: Arc<dyn Metric>,
    settings: SelectionSettings,
    telemetry: Option<&EnsembleTelemetry>,
) -> Result<EnsembleBuild> {
    let StoredPredictions {
        predictions,
        labels,
        test_labels,
    } = stored;
    let combined = PredictionCombinator::new().combine_all(predictions.into_values())?;
    let candidates = arrival_order(history, combined, telemetry);

    let mut selector = EnsembleSelector::new(Arc::clone(&metric), settings);
    if let Some(telemetry) = telemetry {
        selector = selector.with_telemetry(telemetry.clone());
    }
    let ensemble = selector.fit(&candidates, &labels)?;

    let configs = ensemble
        .members()
        .into_iter()
        .map(|member| {
            let config = history.config_for(&member).cloned().unwrap_or(Value::Null);
            (member, config)
        })
        .collect();
    let test_score = match test_labels {
        Some(test_labels) => {
            match ensemble.evaluate(&candidates, Split::Test, &test_labels, metric.as_ref()) {
                Ok(score) => Some(score),
                Err(EnsembleError::MissingMember(member)) => {
                    telemetry::log(
                        telemetry,
                        LogLevel::Info,
                        "builder.no_test_score",
                        json!({ "member_without_test_predictions": member.to_string() }),
                    );
                    None
                }
                Err(err) => return Err(err),
            }
        }
        None => None,
    };
    telemetry::log(
        telemetry,
        LogLevel::Info,
        "builder.ensemble_built",
        json!({
            "members": ensemble.weights().len(),
            "validation_score": ensemble.get_validation_performance(),
            "test_score": test_score,
        }),
    );
    Ok(EnsembleBuild {
        ensemble,
        configs,
        test_score,
    })
}

fn arrival_order(
    history: &TrialHistory,
    combined: IndexMap<ModelIdentifier, CombinedPrediction>,
    telemetry: Option<&EnsembleTelemetry>,
) -> IndexMap<ModelIdentifier, CombinedPrediction> {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for (identifier, prediction) in combined {
        match history.position(&identifier) {
            Some(position) => known.push((position, identifier, prediction)),
            None => unknown.push((identifier, prediction)),
        }
    }
    if !unknown.is_empty() {
        telemetry::log(
            telemetry,
            LogLevel::Warn,
            "builder.unknown_identifiers",
            json!({
                "count": unknown.len(),
                "identifiers": unknown.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>(),
            }),
        );
    }
    known.sort_by_key(|(position, _, _)| *position);
    known
        .into_iter()
        .map(|(_, identifier, prediction)| (identifier, prediction))
        .chain(unknown)
        .collect()
}
