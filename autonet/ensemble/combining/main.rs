//! Fold combination: reduces repeated evaluations of one configuration to one array per split.

/// Mean reduction over folds.
pub mod combinator;
/// Shape checks applied before reduction.
pub mod reviewer;

pub use combinator::{CombinedPrediction, PredictionCombinator, PredictionRecord};
pub use reviewer::FoldReviewer;
