//! Greedy ensemble selection and the fitted ensemble it produces.

/// Fitted ensemble and its weights.
pub mod ensemble;
/// Greedy forward selection.
pub mod selector;

pub use ensemble::{Ensemble, EnsembleWeights, WeightedMember};
pub use selector::{EnsembleSelector, SelectionSettings};
