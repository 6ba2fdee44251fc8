use ndarray::Array2;

use crate::{
    errors::{EnsembleError, Result},
    identifiers::ModelIdentifier,
};

/// Reviewer that checks fold arrays of one model line up before they are reduced.
#[derive(Debug, Default, Clone, Copy)]
pub struct FoldReviewer;

impl FoldReviewer {
    /// Ensures every fold shares the first fold's shape; returns that shape.
    ///
    /// Returns `None` when there are no folds.
    pub fn review<'a>(
        &self,
        identifier: ModelIdentifier,
        folds: impl IntoIterator<Item = &'a Array2<f64>>,
    ) -> Result<Option<(usize, usize)>> {
        let mut folds = folds.into_iter();
        let Some(first) = folds.next() else {
            return Ok(None);
        };
        let expected = first.dim();
        for fold in folds {
            if fold.dim() != expected {
                return Err(EnsembleError::ShapeMismatch {
                    identifier,
                    expected,
                    found: fold.dim(),
                });
            }
        }
        Ok(Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reviewer_flags_mismatched_folds() {
        let id = ModelIdentifier::new((0, 0, 0), 1.0, 0);
        let folds = vec![Array2::zeros((4, 2)), Array2::zeros((3, 2))];
        let err = FoldReviewer.review(id, &folds).unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::ShapeMismatch {
                expected: (4, 2),
                found: (3, 2),
                ..
            }
        ));
        assert_eq!(FoldReviewer.review(id, &Vec::<Array2<f64>>::new()).unwrap(), None);
    }
}
