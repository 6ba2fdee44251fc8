use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::reviewer::FoldReviewer;
use crate::{
    errors::{EnsembleError, Result},
    identifiers::ModelIdentifier,
};

/// Raw per-fold predictions of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Model the predictions belong to.
    pub identifier: ModelIdentifier,
    /// One `[n_samples, n_outputs]` array per validation fold.
    #[serde(with = "crate::floats::folds")]
    pub validation: Vec<Array2<f64>>,
    /// One array per test evaluation; empty when no test predictions were produced.
    #[serde(default, with = "crate::floats::folds")]
    pub test: Vec<Array2<f64>>,
}

impl PredictionRecord {
    /// Creates a record with validation folds only.
    #[must_use]
    pub const fn new(identifier: ModelIdentifier, validation: Vec<Array2<f64>>) -> Self {
        Self {
            identifier,
            validation,
            test: Vec::new(),
        }
    }

    /// Attaches test folds.
    #[must_use]
    pub fn with_test(mut self, test: Vec<Array2<f64>>) -> Self {
        self.test = test;
        self
    }

    /// Appends the folds of another record for the same model.
    pub fn merge(&mut self, other: Self) {
        self.validation.extend(other.validation);
        self.test.extend(other.test);
    }
}

/// A model's predictions reduced to one array per split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedPrediction {
    /// Model the predictions belong to.
    pub identifier: ModelIdentifier,
    /// Fold-averaged validation predictions.
    pub validation: Array2<f64>,
    /// Fold-averaged test predictions, if any were produced.
    pub test: Option<Array2<f64>>,
}

impl CombinedPrediction {
    /// Creates a combined prediction with validation data only.
    #[must_use]
    pub const fn new(identifier: ModelIdentifier, validation: Array2<f64>) -> Self {
        Self {
            identifier,
            validation,
            test: None,
        }
    }
}

/// Reduces repeated evaluations (folds) of one configuration to a single array per split.
#[derive(Debug, Default, Clone, Copy)]
pub struct PredictionCombinator {
    reviewer: FoldReviewer,
}

impl PredictionCombinator {
    /// Creates a combinator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reviewer: FoldReviewer,
        }
    }

    /// Combines every record of one model into a [`CombinedPrediction`].
    pub fn combine(&self, records: &[PredictionRecord]) -> Result<CombinedPrediction> {
        let Some(first) = records.first() else {
            return Err(EnsembleError::MissingValidationPredictions);
        };
        let identifier = first.identifier;
        if let Some(stray) = records.iter().find(|r| r.identifier != identifier) {
            return Err(EnsembleError::corrupt(
                Some(stray.identifier),
                format!("cannot be combined with records of {identifier}"),
            ));
        }

        let validation = records
            .iter()
            .flat_map(|r| r.validation.iter())
            .collect::<Vec<_>>();
        let test = records
            .iter()
            .flat_map(|r| r.test.iter())
            .collect::<Vec<_>>();

        let validation = self
            .mean(identifier, &validation)?
            .ok_or(EnsembleError::MissingValidationPredictions)?;
        let test = self.mean(identifier, &test)?;
        Ok(CombinedPrediction {
            identifier,
            validation,
            test,
        })
    }

    /// Groups records by model (first-arrival order) and combines each group.
    pub fn combine_all(
        &self,
        records: impl IntoIterator<Item = PredictionRecord>,
    ) -> Result<IndexMap<ModelIdentifier, CombinedPrediction>> {
        let mut grouped: IndexMap<ModelIdentifier, Vec<PredictionRecord>> = IndexMap::new();
        for record in records {
            grouped.entry(record.identifier).or_default().push(record);
        }
        grouped
            .into_iter()
            .map(|(identifier, group)| Ok((identifier, self.combine(&group)?)))
            .collect()
    }

    fn mean(
        &self,
        identifier: ModelIdentifier,
        folds: &[&Array2<f64>],
    ) -> Result<Option<Array2<f64>>> {
        if self
            .reviewer
            .review(identifier, folds.iter().copied())?
            .is_none()
        {
            return Ok(None);
        }
        let mut total = folds[0].clone();
        for fold in &folds[1..] {
            total += *fold;
        }
        if folds.len() > 1 {
            let count = folds.len() as f64;
            total.mapv_inplace(|value| value / count);
        }
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn id(n: i64) -> ModelIdentifier {
        ModelIdentifier::new((0, 0, n), 3.0, 0)
    }

    #[test]
    fn single_fold_is_identity() {
        let fold = array![[0.1, 0.9], [0.7, 0.3]];
        let record = PredictionRecord::new(id(1), vec![fold.clone()]);
        let combined = PredictionCombinator::new().combine(&[record]).unwrap();
        assert_eq!(combined.validation, fold);
        assert!(combined.test.is_none());
    }

    #[test]
    fn folds_are_averaged_per_split() {
        let record = PredictionRecord::new(id(1), vec![array![[0.0], [1.0]], array![[1.0], [0.0]]])
            .with_test(vec![array![[0.2]], array![[0.4]], array![[0.6]]]);
        let combined = PredictionCombinator::new().combine(&[record]).unwrap();
        assert_eq!(combined.validation, array![[0.5], [0.5]]);
        let test = combined.test.unwrap();
        assert!((test[[0, 0]] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn folds_from_several_records_are_pooled() {
        let a = PredictionRecord::new(id(2), vec![array![[2.0]]]);
        let b = PredictionRecord::new(id(2), vec![array![[4.0]]]);
        let combined = PredictionCombinator::new().combine(&[a, b]).unwrap();
        assert_eq!(combined.validation, array![[3.0]]);
    }

    #[test]
    fn mismatched_folds_are_rejected() {
        let record = PredictionRecord::new(id(1), vec![array![[0.0], [1.0]], array![[1.0]]]);
        let err = PredictionCombinator::new().combine(&[record]).unwrap_err();
        assert!(matches!(err, EnsembleError::ShapeMismatch { identifier, .. } if identifier == id(1)));
    }

    #[test]
    fn missing_validation_is_an_error() {
        let record = PredictionRecord::new(id(1), Vec::new()).with_test(vec![array![[1.0]]]);
        assert!(matches!(
            PredictionCombinator::new().combine(&[record]),
            Err(EnsembleError::MissingValidationPredictions)
        ));
    }

    #[test]
    fn combine_all_keeps_arrival_order() {
        let records = vec![
            PredictionRecord::new(id(3), vec![array![[1.0]]]),
            PredictionRecord::new(id(1), vec![array![[1.0]]]),
            PredictionRecord::new(id(3), vec![array![[0.0]]]),
        ];
        let combined = PredictionCombinator::new().combine_all(records).unwrap();
        assert_eq!(combined.keys().copied().collect::<Vec<_>>(), vec![id(3), id(1)]);
        assert_eq!(combined[&id(3)].validation, array![[0.5]]);
    }
}
