// src/models/boosting.rs
use log::debug;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use super::logistic::{logit, sigmoid};
use super::tree::{GradientStats, Tree, TreeBuilder, TreeParams};
use super::TrainingView;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub min_child_weight: f64,
    pub lambda: f64,
    pub min_gain: f64,
    /// Row fraction drawn without replacement for each round.
    pub subsample: f64,
    /// Feature fraction examined per split.
    pub colsample: f64,
}

impl BoostParams {
    /// Deeper trees, modest shrinkage.
    pub fn deep() -> Self {
        Self {
            n_rounds: 150,
            learning_rate: 0.1,
            max_depth: 6,
            min_samples_leaf: 2,
            min_child_weight: 1e-3,
            lambda: 1.0,
            min_gain: 0.0,
            subsample: 0.8,
            colsample: 0.8,
        }
    }

    /// Shallow, heavily regularised trees.
    pub fn regularized() -> Self {
        Self {
            n_rounds: 200,
            learning_rate: 0.05,
            max_depth: 3,
            min_samples_leaf: 5,
            min_child_weight: 1.0,
            lambda: 5.0,
            min_gain: 0.01,
            subsample: 0.7,
            colsample: 0.6,
        }
    }
}

/// Gradient-boosted trees on log-loss. Output is a logit: `base_score + Σ tree(x)`,
/// with the learning rate already folded into the leaf values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl GradientBoosting {
    pub fn fit(
        view: &TrainingView<'_>,
        rows: &[usize],
        params: &BoostParams,
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = view.labels.len();
        let n_cols = view.binned.n_cols();

        let (pos, total) = rows.iter().fold((0.0, 0.0), |(p, t), &i| {
            (p + view.weights[i] * f64::from(view.labels[i]), t + view.weights[i])
        });
        let prior = if total > 0.0 { pos / total } else { 0.5 };
        let base_score = logit(prior.clamp(1e-6, 1.0 - 1e-6));

        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            min_child_weight: params.min_child_weight,
            lambda: params.lambda,
            min_gain: params.min_gain,
            max_features: Some(((n_cols as f64 * params.colsample).round() as usize).clamp(1, n_cols.max(1))),
        };

        let mut margin = vec![base_score; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut trees = Vec::with_capacity(params.n_rounds);
        let draw = ((rows.len() as f64 * params.subsample).round() as usize).clamp(1, rows.len().max(1));

        for round in 0..params.n_rounds {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(EngineError::Cancelled);
            }
            for &i in rows {
                let p = sigmoid(margin[i]);
                let w = view.weights[i];
                grad[i] = w * (p - f64::from(view.labels[i]));
                hess[i] = (w * p * (1.0 - p)).max(1e-12);
            }
            let round_rows: Vec<usize> = if draw < rows.len() {
                let mut picked: Vec<usize> = sample(&mut rng, rows.len(), draw)
                    .into_iter()
                    .map(|k| rows[k])
                    .collect();
                picked.sort_unstable();
                picked
            } else {
                rows.to_vec()
            };
            let stats = GradientStats {
                grad: &grad,
                hess: &hess,
                cover: view.weights,
            };
            let mut tree = TreeBuilder::new(view.binned, stats, &tree_params, &mut rng).grow(round_rows);
            tree.scale_leaves(params.learning_rate);

            for &i in rows {
                margin[i] += tree.predict_with(|j| view.x[[i, j]]);
            }
            trees.push(tree);
            if round % 50 == 0 {
                debug!("Boosting round {}/{}", round + 1, params.n_rounds);
            }
        }

        Ok(Self { base_score, trees })
    }

    pub fn predict_logit(&self, x: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict(x)).sum::<f64>()
    }

    pub fn expected_value(&self) -> f64 {
        self.base_score + self.trees.iter().map(Tree::expected_value).sum::<f64>()
    }
}
