//! Scoring functions used to rank candidates and ensembles.

use std::{fmt, sync::Arc};

use ndarray::{ArrayView2, Axis};

use crate::{
    errors::{EnsembleError, Result},
    transform::{argmax, LabelSet},
};

const PROBABILITY_EPS: f64 = 1e-15;

/// Opaque scoring function over `(predictions, labels)`.
///
/// Whether lower or higher is better is decided by the caller's `minimize` flag.
pub trait Metric: Send + Sync {
    /// Metric name as it appears in configuration.
    fn name(&self) -> &str;

    /// Scores `[n_samples, n_classes_or_1]` predictions against the labels.
    fn score(&self, predictions: ArrayView2<'_, f64>, labels: &LabelSet) -> f64;
}

/// Fraction of samples whose predicted class matches the label.
///
/// Single-column predictions are thresholded at 0.5.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accuracy;

impl Metric for Accuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn score(&self, predictions: ArrayView2<'_, f64>, labels: &LabelSet) -> f64 {
        let samples = predictions.nrows().min(labels.n_samples());
        if samples == 0 {
            return 0.0;
        }
        let correct = predictions
            .axis_iter(Axis(0))
            .take(samples)
            .enumerate()
            .filter(|(idx, row)| {
                let predicted = if row.len() == 1 {
                    usize::from(row[0] >= 0.5)
                } else {
                    argmax(*row)
                };
                predicted == labels.class_of(*idx)
            })
            .count();
        correct as f64 / samples as f64
    }
}

/// Mean squared error over the overlapping prediction/label columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl Metric for MeanSquaredError {
    fn name(&self) -> &str {
        "mean_squared_error"
    }

    fn score(&self, predictions: ArrayView2<'_, f64>, labels: &LabelSet) -> f64 {
        let samples = predictions.nrows().min(labels.n_samples());
        let columns = predictions.ncols().min(labels.n_targets());
        if samples == 0 || columns == 0 {
            return 0.0;
        }
        let truth = labels.view();
        let mut total = 0.0;
        for row in 0..samples {
            for col in 0..columns {
                total += (predictions[[row, col]] - truth[[row, col]]).powi(2);
            }
        }
        total / (samples * columns) as f64
    }
}

/// Cross-entropy of predicted class probabilities.
///
/// A single column is read as the probability of class 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLoss;

impl Metric for LogLoss {
    fn name(&self) -> &str {
        "log_loss"
    }

    fn score(&self, predictions: ArrayView2<'_, f64>, labels: &LabelSet) -> f64 {
        let samples = predictions.nrows().min(labels.n_samples());
        if samples == 0 {
            return 0.0;
        }
        let clip = |p: f64| p.clamp(PROBABILITY_EPS, 1.0 - PROBABILITY_EPS);
        let total: f64 = predictions
            .axis_iter(Axis(0))
            .take(samples)
            .enumerate()
            .map(|(idx, row)| {
                let class = labels.class_of(idx);
                if row.len() == 1 {
                    let p = clip(row[0]);
                    if class == 1 {
                        -p.ln()
                    } else {
                        -(1.0 - p).ln()
                    }
                } else {
                    -clip(row.get(class).copied().unwrap_or(0.0)).ln()
                }
            })
            .sum();
        total / samples as f64
    }
}

/// Metric backed by a closure; handy for custom objectives and tests.
pub struct FnMetric<F> {
    name: String,
    func: F,
}

impl<F> FnMetric<F>
where
    F: Fn(ArrayView2<'_, f64>, &LabelSet) -> f64 + Send + Sync,
{
    /// Wraps `func` under the given name.
    #[must_use]
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> fmt::Debug for FnMetric<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMetric").field("name", &self.name).finish()
    }
}

impl<F> Metric for FnMetric<F>
where
    F: Fn(ArrayView2<'_, f64>, &LabelSet) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, predictions: ArrayView2<'_, f64>, labels: &LabelSet) -> f64 {
        (self.func)(predictions, labels)
    }
}

/// Looks up a built-in metric by its configuration name.
pub fn metric_by_name(name: &str) -> Result<Arc<dyn Metric>> {
    match name {
        "accuracy" => Ok(Arc::new(Accuracy)),
        "mean_squared_error" | "mse" => Ok(Arc::new(MeanSquaredError)),
        "log_loss" | "cross_entropy" => Ok(Arc::new(LogLoss)),
        other => Err(EnsembleError::InvalidConfiguration(format!(
            "unknown train metric `{other}`"
        ))),
    }
}
