// src/models/forest.rs
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::tree::{GradientStats, Tree, TreeBuilder, TreeParams};
use super::TrainingView;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Fraction of features examined per split (sqrt(width) when `None`).
    pub feature_fraction: Option<f64>,
    pub bootstrap: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_leaf: 2,
            feature_fraction: None,
            bootstrap: true,
        }
    }
}

/// Bagged regression trees on the default indicator; output is the mean leaf rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub trees: Vec<Tree>,
}

impl RandomForest {
    pub fn fit(view: &TrainingView<'_>, rows: &[usize], params: &ForestParams, seed: u64) -> EngineResult<Self> {
        let n_cols = view.binned.n_cols();
        let max_features = match params.feature_fraction {
            Some(f) => ((n_cols as f64 * f).round() as usize).clamp(1, n_cols.max(1)),
            None => ((n_cols as f64).sqrt().round() as usize).max(1),
        };
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            min_child_weight: 0.0,
            lambda: 0.0,
            min_gain: 1e-12,
            max_features: Some(max_features),
        };

        let n = view.labels.len();
        let grad: Vec<f64> = (0..n).map(|i| -view.weights[i] * f64::from(view.labels[i])).collect();
        let hess: Vec<f64> = view.weights.to_vec();

        let grow_one = |t: usize| -> Tree {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
            let sample: Vec<usize> = if params.bootstrap {
                (0..rows.len()).map(|_| rows[rng.gen_range(0..rows.len())]).collect()
            } else {
                rows.to_vec()
            };
            let stats = GradientStats {
                grad: &grad,
                hess: &hess,
                cover: view.weights,
            };
            TreeBuilder::new(view.binned, stats, &tree_params, &mut rng).grow(sample)
        };

        let n_trees = params.n_trees.max(1);
        let workers = num_cpus::get().clamp(1, n_trees);
        let mut grown: Vec<(usize, Tree)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let grow_one = &grow_one;
                    scope.spawn(move || {
                        (w..n_trees)
                            .step_by(workers)
                            .map(|t| (t, grow_one(t)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| EngineError::Internal("forest worker panicked".into())))
                .collect::<EngineResult<Vec<_>>>()
                .map(|chunks| chunks.into_iter().flatten().collect())
        })?;
        grown.sort_by_key(|(t, _)| *t);
        debug!("Grew {} forest trees on {} rows", grown.len(), rows.len());

        Ok(Self {
            trees: grown.into_iter().map(|(_, tree)| tree).collect(),
        })
    }

    /// Mean default rate over the trees, a probability in [0, 1].
    pub fn predict(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.predict(x)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn expected_value(&self) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(Tree::expected_value).sum::<f64>() / self.trees.len() as f64
    }
}
