use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Ground-truth targets aligned by sample index with every prediction array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSet {
    #[serde(with = "crate::floats::array")]
    values: Array2<f64>,
}

impl LabelSet {
    /// Wraps a `[n_samples, n_targets]` label matrix.
    #[must_use]
    pub const fn new(values: Array2<f64>) -> Self {
        Self { values }
    }

    /// Builds a single-column label set (class indices or regression targets).
    #[must_use]
    pub fn from_column(values: &[f64]) -> Self {
        let column = Array2::from_shape_fn((values.len(), 1), |(row, _)| values[row]);
        Self { values: column }
    }

    /// Number of labelled samples.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    /// Number of target columns (1 unless labels are still one-hot encoded).
    #[must_use]
    pub fn n_targets(&self) -> usize {
        self.values.ncols()
    }

    /// Read-only view of the labels.
    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Consumes the set and returns the raw matrix.
    #[must_use]
    pub fn into_inner(self) -> Array2<f64> {
        self.values
    }

    /// Class index of a sample: the value itself for a single column, the hot column otherwise.
    #[must_use]
    pub fn class_of(&self, sample: usize) -> usize {
        let row = self.values.row(sample);
        if row.len() == 1 {
            row[0].round().max(0.0) as usize
        } else {
            argmax(row)
        }
    }
}

/// Index of the largest entry; first index wins ties.
pub(crate) fn argmax(row: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (idx, value) in row.iter().enumerate() {
        if *value > row[best] {
            best = idx;
        }
    }
    best
}

/// Transformation applied uniformly to loaded labels and prediction arrays.
pub trait LabelTransform: Send + Sync {
    /// Transforms the label matrix.
    fn labels(&self, labels: LabelSet) -> LabelSet;

    /// Transforms one prediction array. Identity unless overridden.
    fn predictions(&self, predictions: Array2<f64>) -> Array2<f64> {
        predictions
    }
}

/// Leaves labels and predictions untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl LabelTransform for IdentityTransform {
    fn labels(&self, labels: LabelSet) -> LabelSet {
        labels
    }
}

/// Inverts a one-hot label encoding back to a single class-index column.
///
/// Prediction arrays keep their per-class probability columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct OneHotDecoding;

impl LabelTransform for OneHotDecoding {
    fn labels(&self, labels: LabelSet) -> LabelSet {
        if labels.n_targets() <= 1 {
            return labels;
        }
        let decoded = labels
            .view()
            .axis_iter(Axis(0))
            .map(|row| argmax(row) as f64)
            .collect::<Vec<f64>>();
        LabelSet::from_column(&decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn one_hot_decoding_collapses_columns() {
        let labels = LabelSet::new(array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
        let decoded = OneHotDecoding.labels(labels);
        assert_eq!(decoded.n_targets(), 1);
        assert_eq!(decoded.view().column(0).to_vec(), vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn one_hot_decoding_keeps_single_column() {
        let labels = LabelSet::from_column(&[1.0, 0.0]);
        assert_eq!(OneHotDecoding.labels(labels.clone()), labels);
    }

    #[test]
    fn class_of_reads_index_or_hot_column() {
        assert_eq!(LabelSet::from_column(&[2.0]).class_of(0), 2);
        assert_eq!(LabelSet::new(array![[0.0, 0.0, 1.0]]).class_of(0), 2);
    }
}
