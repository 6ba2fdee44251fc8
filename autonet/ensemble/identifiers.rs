use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// Identifies one trained configuration evaluated at one budget.
///
/// `config_id` follows the optimizer's `(iteration, bracket, index)` triple. The budget is
/// compared by bit pattern so identifiers can be used as map keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelIdentifier {
    /// Optimizer configuration id.
    pub config_id: (i64, i64, i64),
    /// Budget the configuration was trained with.
    pub budget: f64,
    /// Seed of the training run.
    #[serde(default)]
    pub seed: u64,
}

impl ModelIdentifier {
    /// Creates a new identifier.
    #[must_use]
    pub const fn new(config_id: (i64, i64, i64), budget: f64, seed: u64) -> Self {
        Self {
            config_id,
            budget,
            seed,
        }
    }
}

impl PartialEq for ModelIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.config_id == other.config_id
            && self.budget.to_bits() == other.budget.to_bits()
            && self.seed == other.seed
    }
}

impl Eq for ModelIdentifier {}

impl Hash for ModelIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.config_id.hash(state);
        self.budget.to_bits().hash(state);
        self.seed.hash(state);
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, b, c) = self.config_id;
        write!(f, "({a}, {b}, {c})@{}#{}", self.budget, self.seed)
    }
}

/// Data split a prediction array belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training data; collected but never used for ensembling.
    Train,
    /// Validation data the ensemble is selected on.
    Validation,
    /// Held-out test data.
    Test,
}
