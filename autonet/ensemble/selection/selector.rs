use std::{cmp::Ordering, sync::Arc};

use indexmap::IndexMap;
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ensemble::{Ensemble, EnsembleWeights};
use crate::{
    combining::CombinedPrediction,
    errors::{EnsembleError, Result},
    identifiers::ModelIdentifier,
    metrics::Metric,
    telemetry::{self, EnsembleTelemetry, LogLevel},
    transform::LabelSet,
};

/// Parameters of greedy ensemble selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSettings {
    /// Number of selections (with replacement) to perform.
    pub ensemble_size: usize,
    /// Restrict the pool to the n individually best candidates; 0 keeps all.
    pub only_consider_n_best: usize,
    /// Seed the ensemble with the n individually best candidates; 0 starts empty.
    pub sorted_initialization_n_best: usize,
    /// Prefer lower metric values.
    pub minimize: bool,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            ensemble_size: 3,
            only_consider_n_best: 0,
            sorted_initialization_n_best: 0,
            minimize: false,
        }
    }
}

struct Candidate<'a> {
    identifier: ModelIdentifier,
    predictions: ArrayView2<'a, f64>,
    score: f64,
}

/// Greedy forward selection of a weighted ensemble from a pool of trained models.
pub struct EnsembleSelector {
    metric: Arc<dyn Metric>,
    settings: SelectionSettings,
    telemetry: Option<EnsembleTelemetry>,
}

impl std::fmt::Debug for EnsembleSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleSelector")
            .field("metric", &self.metric.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl EnsembleSelector {
    /// Creates a selector scoring with `metric`.
    #[must_use]
    pub fn new(metric: Arc<dyn Metric>, settings: SelectionSettings) -> Self {
        Self {
            metric,
            settings,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EnsembleTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Selection parameters.
    #[must_use]
    pub const fn settings(&self) -> &SelectionSettings {
        &self.settings
    }

    /// Selects an ensemble from `candidates`, scored on the validation split.
    ///
    /// Candidate order is the arrival order used for every tie-break.
    pub fn fit(
        &self,
        candidates: &IndexMap<ModelIdentifier, CombinedPrediction>,
        labels: &LabelSet,
    ) -> Result<Ensemble> {
        if self.settings.ensemble_size == 0 {
            return Err(EnsembleError::InvalidConfiguration(
                "ensemble_size must be positive".into(),
            ));
        }
        let pool = self.prefilter(self.score_candidates(candidates, labels)?);
        if pool.is_empty() {
            return Err(EnsembleError::EmptyPool);
        }
        self.log(
            LogLevel::Info,
            "selection.start",
            json!({
                "candidates": candidates.len(),
                "pool": pool.len(),
                "metric": self.metric.name(),
                "ensemble_size": self.settings.ensemble_size,
            }),
        );

        let shape = pool[0].predictions.dim();
        let mut sum = Array2::<f64>::zeros(shape);
        let mut scratch = Array2::<f64>::zeros(shape);
        let mut counts = vec![0_usize; pool.len()];
        let mut order = Vec::with_capacity(self.settings.ensemble_size);
        let mut trajectory = Vec::with_capacity(self.settings.ensemble_size);
        let mut current: Option<f64> = None;

        let seeded = self
            .settings
            .sorted_initialization_n_best
            .min(pool.len())
            .min(self.settings.ensemble_size);
        for idx in self.ranking(&pool).into_iter().take(seeded) {
            sum += &pool[idx].predictions;
            counts[idx] += 1;
            order.push(pool[idx].identifier);
            let score = self.score_mean(&sum, order.len(), &mut scratch, labels);
            trajectory.push(score);
            current = Some(score);
        }

        for step in 0..self.settings.ensemble_size - seeded {
            let members = order.len() + 1;
            let mut best: Option<(usize, f64)> = None;
            for (idx, candidate) in pool.iter().enumerate() {
                let inv = 1.0 / members as f64;
                Zip::from(&mut scratch)
                    .and(&sum)
                    .and(&candidate.predictions)
                    .for_each(|out, &acc, &value| *out = (acc + value) * inv);
                let score = self.metric.score(scratch.view(), labels);
                if best.map_or(true, |(_, best_score)| self.is_better(score, best_score)) {
                    best = Some((idx, score));
                }
            }
            let Some((idx, score)) = best else { break };
            if let Some(previous) = current {
                if !self.is_better(score, previous) {
                    self.log(
                        LogLevel::Debug,
                        "selection.converged",
                        json!({ "step": step, "score": previous }),
                    );
                    break;
                }
            }
            sum += &pool[idx].predictions;
            counts[idx] += 1;
            order.push(pool[idx].identifier);
            trajectory.push(score);
            current = Some(score);
            self.log(
                LogLevel::Debug,
                "selection.step",
                json!({ "step": step, "selected": pool[idx].identifier.to_string(), "score": score }),
            );
        }

        let validation_score = current.ok_or(EnsembleError::EmptyPool)?;
        let weights = EnsembleWeights::from_counts(
            pool.iter()
                .zip(counts.iter())
                .map(|(candidate, count)| (candidate.identifier, *count)),
        );
        self.log(
            LogLevel::Info,
            "selection.finished",
            json!({
                "members": weights.len(),
                "selections": order.len(),
                "score": validation_score,
            }),
        );
        Ok(Ensemble::from_selection(
            self.metric.name(),
            self.settings.minimize,
            weights,
            order,
            trajectory,
            seeded,
            validation_score,
        ))
    }

    fn score_candidates<'a>(
        &self,
        candidates: &'a IndexMap<ModelIdentifier, CombinedPrediction>,
        labels: &LabelSet,
    ) -> Result<Vec<Candidate<'a>>> {
        let Some(first) = candidates.values().next() else {
            return Ok(Vec::new());
        };
        let expected = (labels.n_samples(), first.validation.ncols());
        candidates
            .iter()
            .map(|(identifier, combined)| {
                let found = combined.validation.dim();
                if found != expected {
                    return Err(EnsembleError::ShapeMismatch {
                        identifier: *identifier,
                        expected,
                        found,
                    });
                }
                Ok(Candidate {
                    identifier: *identifier,
                    predictions: combined.validation.view(),
                    score: self.metric.score(combined.validation.view(), labels),
                })
            })
            .collect()
    }

    fn prefilter<'a>(&self, pool: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        let keep = self.settings.only_consider_n_best;
        if keep == 0 || keep >= pool.len() {
            return pool;
        }
        let mut survivors = self.ranking(&pool);
        survivors.truncate(keep);
        survivors.sort_unstable();
        let mut survivors = survivors.into_iter().peekable();
        pool.into_iter()
            .enumerate()
            .filter_map(|(idx, candidate)| {
                if survivors.peek() == Some(&idx) {
                    survivors.next();
                    Some(candidate)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Pool indices ordered best-first by individual score; stable on ties.
    fn ranking(&self, pool: &[Candidate<'_>]) -> Vec<usize> {
        let mut ranked = (0..pool.len()).collect::<Vec<_>>();
        ranked.sort_by(|&a, &b| self.compare(pool[a].score, pool[b].score));
        ranked
    }

    fn compare(&self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if self.settings.minimize => a.total_cmp(&b),
            (false, false) => b.total_cmp(&a),
        }
    }

    fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        self.compare(candidate, incumbent) == Ordering::Less
    }

    fn score_mean(
        &self,
        sum: &Array2<f64>,
        members: usize,
        scratch: &mut Array2<f64>,
        labels: &LabelSet,
    ) -> f64 {
        let inv = 1.0 / members as f64;
        Zip::from(&mut *scratch)
            .and(sum)
            .for_each(|out, &acc| *out = acc * inv);
        self.metric.score(scratch.view(), labels)
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        telemetry::log(self.telemetry.as_ref(), level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Accuracy, FnMetric, LogLoss, MeanSquaredError};
    use ndarray::array;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn id(n: i64) -> ModelIdentifier {
        ModelIdentifier::new((0, 0, n), 9.0, 0)
    }

    fn pool(entries: &[(i64, Array2<f64>)]) -> IndexMap<ModelIdentifier, CombinedPrediction> {
        entries
            .iter()
            .map(|(n, predictions)| (id(*n), CombinedPrediction::new(id(*n), predictions.clone())))
            .collect()
    }

    fn mean_metric() -> Arc<dyn Metric> {
        Arc::new(FnMetric::new("mean", |predictions, _labels| {
            predictions.mean().unwrap_or(0.0)
        }))
    }

    fn constant(value: f64) -> Array2<f64> {
        Array2::from_elem((4, 1), value)
    }

    fn scenario_pool() -> IndexMap<ModelIdentifier, CombinedPrediction> {
        // A = 1, B = 2, C = 3
        pool(&[(1, constant(0.9)), (2, constant(0.8)), (3, constant(0.95))])
    }

    #[test]
    fn best_individual_model_is_selected_first() {
        let settings = SelectionSettings {
            ensemble_size: 2,
            ..SelectionSettings::default()
        };
        let labels = LabelSet::from_column(&[0.0; 4]);
        let ensemble = EnsembleSelector::new(mean_metric(), settings)
            .fit(&scenario_pool(), &labels)
            .unwrap();
        assert_eq!(ensemble.selection_order()[0], id(3));
        assert!((ensemble.trajectory()[0] - 0.95).abs() < 1e-12);
        assert!((ensemble.weights().total() - 1.0).abs() < 1e-9);
        assert!((ensemble.get_validation_performance() - 0.95).abs() < 1e-12);
    }

    #[test]
    fn only_consider_n_best_restricts_pool() {
        let settings = SelectionSettings {
            ensemble_size: 2,
            only_consider_n_best: 1,
            ..SelectionSettings::default()
        };
        let labels = LabelSet::from_column(&[0.0; 4]);
        let ensemble = EnsembleSelector::new(mean_metric(), settings)
            .fit(&scenario_pool(), &labels)
            .unwrap();
        assert_eq!(ensemble.members(), vec![id(3)]);
        assert!((ensemble.weights().get(&id(3)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn complementary_models_are_averaged() {
        let candidates = pool(&[
            (1, array![[1.2], [0.8]]),
            (2, array![[0.8], [1.2]]),
            (3, array![[2.0], [2.0]]),
        ]);
        let labels = LabelSet::from_column(&[1.0, 1.0]);
        let settings = SelectionSettings {
            ensemble_size: 5,
            minimize: true,
            ..SelectionSettings::default()
        };
        let ensemble = EnsembleSelector::new(Arc::new(MeanSquaredError), settings)
            .fit(&candidates, &labels)
            .unwrap();
        assert_eq!(ensemble.selection_order(), &[id(1), id(2)]);
        assert!((ensemble.weights().get(&id(1)) - 0.5).abs() < 1e-12);
        assert!((ensemble.weights().get(&id(2)) - 0.5).abs() < 1e-12);
        assert!(ensemble.get_validation_performance().abs() < 1e-12);
        assert_eq!(ensemble.trajectory().len(), 2);
    }

    #[test]
    fn repeated_selection_increases_weight() {
        // Labels sit at 1/3 of the way from A to B, so A twice plus B once is exact.
        let candidates = pool(&[(1, array![[0.0]]), (2, array![[3.0]])]);
        let labels = LabelSet::from_column(&[1.0]);
        let settings = SelectionSettings {
            ensemble_size: 3,
            minimize: true,
            ..SelectionSettings::default()
        };
        let ensemble = EnsembleSelector::new(Arc::new(MeanSquaredError), settings)
            .fit(&candidates, &labels)
            .unwrap();
        assert!((ensemble.weights().get(&id(1)) - 2.0 / 3.0).abs() < 1e-12);
        assert!((ensemble.weights().get(&id(2)) - 1.0 / 3.0).abs() < 1e-12);
        assert!(ensemble.get_validation_performance().abs() < 1e-12);
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let candidates = pool(&[(7, constant(0.5)), (4, constant(0.5))]);
        let labels = LabelSet::from_column(&[0.0; 4]);
        let ensemble = EnsembleSelector::new(mean_metric(), SelectionSettings::default())
            .fit(&candidates, &labels)
            .unwrap();
        assert_eq!(ensemble.members(), vec![id(7)]);
    }

    #[test]
    fn sorted_initialization_seeds_best_models() {
        let candidates = pool(&[
            (1, array![[2.0], [2.0]]),
            (2, array![[1.2], [0.8]]),
            (3, array![[0.8], [1.2]]),
        ]);
        let labels = LabelSet::from_column(&[1.0, 1.0]);
        let settings = SelectionSettings {
            ensemble_size: 2,
            sorted_initialization_n_best: 2,
            minimize: true,
            ..SelectionSettings::default()
        };
        let ensemble = EnsembleSelector::new(Arc::new(MeanSquaredError), settings)
            .fit(&candidates, &labels)
            .unwrap();
        assert_eq!(ensemble.seeded(), 2);
        assert_eq!(ensemble.selection_order(), &[id(2), id(3)]);
        assert_eq!(ensemble.members(), vec![id(2), id(3)]);
        assert!(ensemble.get_validation_performance().abs() < 1e-12);
    }

    #[test]
    fn zero_ensemble_size_is_rejected() {
        let settings = SelectionSettings {
            ensemble_size: 0,
            ..SelectionSettings::default()
        };
        let labels = LabelSet::from_column(&[0.0; 4]);
        let err = EnsembleSelector::new(mean_metric(), settings)
            .fit(&scenario_pool(), &labels)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::InvalidConfiguration(_)));
    }

    #[test]
    fn empty_pool_is_rejected() {
        let labels = LabelSet::from_column(&[0.0; 4]);
        let err = EnsembleSelector::new(mean_metric(), SelectionSettings::default())
            .fit(&IndexMap::new(), &labels)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::EmptyPool));
    }

    #[test]
    fn candidates_must_match_labels() {
        let candidates = pool(&[(1, constant(0.5)), (2, Array2::from_elem((3, 1), 0.5))]);
        let labels = LabelSet::from_column(&[0.0; 4]);
        let err = EnsembleSelector::new(mean_metric(), SelectionSettings::default())
            .fit(&candidates, &labels)
            .unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::ShapeMismatch { identifier, found: (3, 1), .. } if identifier == id(2)
        ));
    }

    fn random_pool(
        rng: &mut SmallRng,
        models: i64,
        samples: usize,
        classes: usize,
    ) -> IndexMap<ModelIdentifier, CombinedPrediction> {
        let entries = (0..models)
            .map(|n| {
                let mut predictions =
                    Array2::from_shape_fn((samples, classes), |_| rng.gen_range(0.01..1.0));
                for mut row in predictions.rows_mut() {
                    let total = row.sum();
                    row.mapv_inplace(|p| p / total);
                }
                (n, predictions)
            })
            .collect::<Vec<_>>();
        pool(&entries)
    }

    #[test]
    fn random_pools_yield_unit_weights_and_non_worsening_scores() {
        let mut rng = SmallRng::seed_from_u64(7);
        for round in 0..20_usize {
            let candidates = random_pool(&mut rng, 6, 12, 3);
            let labels = LabelSet::from_column(
                &(0..12).map(|_| f64::from(rng.gen_range(0_u8..3))).collect::<Vec<_>>(),
            );
            let minimize = round % 2 == 0;
            let metric: Arc<dyn Metric> = if minimize {
                Arc::new(LogLoss)
            } else {
                Arc::new(Accuracy)
            };
            let settings = SelectionSettings {
                ensemble_size: 8,
                only_consider_n_best: round % 4,
                sorted_initialization_n_best: round % 3,
                minimize,
            };
            let ensemble = EnsembleSelector::new(metric, settings)
                .fit(&candidates, &labels)
                .unwrap();
            assert!((ensemble.weights().total() - 1.0).abs() < 1e-9);
            assert!(ensemble.selection_order().len() <= 8);
            let greedy = &ensemble.trajectory()[ensemble.seeded().saturating_sub(1)..];
            for pair in greedy.windows(2) {
                if minimize {
                    assert!(pair[1] < pair[0]);
                } else {
                    assert!(pair[1] > pair[0]);
                }
            }
        }
    }
}
