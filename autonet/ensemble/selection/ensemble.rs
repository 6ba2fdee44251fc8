use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    combining::CombinedPrediction,
    errors::{EnsembleError, Result},
    identifiers::{ModelIdentifier, Split},
    metrics::Metric,
    transform::LabelSet,
};

/// One ensemble member and its share of the vote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedMember {
    /// Member model.
    pub identifier: ModelIdentifier,
    /// Non-negative weight.
    pub weight: f64,
}

/// Convex combination of member models; weights sum to one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleWeights {
    members: Vec<WeightedMember>,
}

impl EnsembleWeights {
    /// Normalizes selection counts into weights, dropping members never selected.
    #[must_use]
    pub fn from_counts(counts: impl IntoIterator<Item = (ModelIdentifier, usize)>) -> Self {
        let counts = counts
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect::<Vec<_>>();
        let total = counts.iter().map(|(_, count)| count).sum::<usize>().max(1) as f64;
        Self {
            members: counts
                .into_iter()
                .map(|(identifier, count)| WeightedMember {
                    identifier,
                    weight: count as f64 / total,
                })
                .collect(),
        }
    }

    /// Weight of a model, `0.0` if it is not a member.
    #[must_use]
    pub fn get(&self, identifier: &ModelIdentifier) -> f64 {
        self.members
            .iter()
            .find(|member| &member.identifier == identifier)
            .map_or(0.0, |member| member.weight)
    }

    /// Members in candidate arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &WeightedMember> {
        self.members.iter()
    }

    /// Number of distinct members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no member has weight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sum of all weights (1.0 for a fitted ensemble).
    #[must_use]
    pub fn total(&self) -> f64 {
        self.members.iter().map(|member| member.weight).sum()
    }
}

/// Ensemble produced by greedy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ensemble {
    /// Ensemble identifier.
    pub id: Uuid,
    /// Metric the ensemble was selected on.
    pub metric: String,
    /// Whether lower metric values were preferred.
    pub minimize: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    weights: EnsembleWeights,
    selection_order: Vec<ModelIdentifier>,
    trajectory: Vec<f64>,
    seeded: usize,
    validation_score: f64,
}

impl Ensemble {
    pub(crate) fn from_selection(
        metric: &str,
        minimize: bool,
        weights: EnsembleWeights,
        selection_order: Vec<ModelIdentifier>,
        trajectory: Vec<f64>,
        seeded: usize,
        validation_score: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric: metric.to_string(),
            minimize,
            created_at: Utc::now(),
            weights,
            selection_order,
            trajectory,
            seeded,
            validation_score,
        }
    }

    /// Metric score of the weighted ensemble on the validation split.
    #[must_use]
    pub const fn get_validation_performance(&self) -> f64 {
        self.validation_score
    }

    /// Member weights.
    #[must_use]
    pub const fn weights(&self) -> &EnsembleWeights {
        &self.weights
    }

    /// Distinct member identifiers.
    #[must_use]
    pub fn members(&self) -> Vec<ModelIdentifier> {
        self.weights.iter().map(|member| member.identifier).collect()
    }

    /// Every selection in order, repeats included.
    #[must_use]
    pub fn selection_order(&self) -> &[ModelIdentifier] {
        &self.selection_order
    }

    /// Ensemble score after each selection.
    #[must_use]
    pub fn trajectory(&self) -> &[f64] {
        &self.trajectory
    }

    /// How many selections came from sorted initialization.
    #[must_use]
    pub const fn seeded(&self) -> usize {
        self.seeded
    }

    /// Weighted average of member predictions.
    pub fn predict(&self, predictions: &IndexMap<ModelIdentifier, Array2<f64>>) -> Result<Array2<f64>> {
        self.blend(|identifier| predictions.get(identifier))
    }

    /// Weighted average of the members' combined predictions for `split`.
    pub fn predict_split(
        &self,
        candidates: &IndexMap<ModelIdentifier, CombinedPrediction>,
        split: Split,
    ) -> Result<Array2<f64>> {
        match split {
            Split::Validation => self.blend(|id| candidates.get(id).map(|c| &c.validation)),
            Split::Test => self.blend(|id| candidates.get(id).and_then(|c| c.test.as_ref())),
            Split::Train => Err(EnsembleError::InvalidConfiguration(
                "train predictions are not kept for ensembles".into(),
            )),
        }
    }

    /// Scores the ensemble on `split` against `labels`.
    ///
    /// Fails with [`EnsembleError::ShapeMismatch`] when the blended predictions do not have
    /// one row per label.
    pub fn evaluate(
        &self,
        candidates: &IndexMap<ModelIdentifier, CombinedPrediction>,
        split: Split,
        labels: &LabelSet,
        metric: &dyn Metric,
    ) -> Result<f64> {
        let predictions = self.predict_split(candidates, split)?;
        if predictions.nrows() != labels.n_samples() {
            if let Some(first) = self.weights.iter().next() {
                return Err(EnsembleError::ShapeMismatch {
                    identifier: first.identifier,
                    expected: (labels.n_samples(), predictions.ncols()),
                    found: predictions.dim(),
                });
            }
        }
        Ok(metric.score(predictions.view(), labels))
    }

    fn blend<'a>(
        &self,
        lookup: impl Fn(&ModelIdentifier) -> Option<&'a Array2<f64>>,
    ) -> Result<Array2<f64>> {
        let mut blended: Option<Array2<f64>> = None;
        for member in self.weights.iter() {
            let predictions =
                lookup(&member.identifier).ok_or(EnsembleError::MissingMember(member.identifier))?;
            match blended.as_mut() {
                None => blended = Some(predictions * member.weight),
                Some(total) => {
                    if total.dim() != predictions.dim() {
                        return Err(EnsembleError::ShapeMismatch {
                            identifier: member.identifier,
                            expected: total.dim(),
                            found: predictions.dim(),
                        });
                    }
                    total.scaled_add(member.weight, predictions);
                }
            }
        }
        blended.ok_or(EnsembleError::EmptyPool)
    }
}
