// src/models/mod.rs
pub mod boosting;
pub mod forest;
pub mod logistic;
pub mod tree;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

use crate::errors::EngineResult;
use crate::explain::tree_shap::tree_shap;
use boosting::{BoostParams, GradientBoosting};
use forest::{ForestParams, RandomForest};
use tree::BinnedMatrix;

/// Everything a learner needs to fit on some subset of rows. All slices are indexed
/// by row id of `x`.
pub struct TrainingView<'a> {
    pub x: &'a Array2<f64>,
    pub binned: &'a BinnedMatrix,
    pub labels: &'a [u8],
    pub weights: &'a [f64],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerSpec {
    Forest(ForestParams),
    Boosted(BoostParams),
}

impl LearnerSpec {
    pub fn fit(
        &self,
        view: &TrainingView<'_>,
        rows: &[usize],
        seed: u64,
        cancel: Option<&AtomicBool>,
    ) -> EngineResult<BaseLearner> {
        Ok(match self {
            LearnerSpec::Forest(params) => BaseLearner::Forest(RandomForest::fit(view, rows, params, seed)?),
            LearnerSpec::Boosted(params) => {
                BaseLearner::Boosted(GradientBoosting::fit(view, rows, params, seed, cancel)?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSpec {
    pub name: String,
    pub spec: LearnerSpec,
}

impl NamedSpec {
    pub fn new(name: &str, spec: LearnerSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }
}

/// The default trio: bagging, deep boosting, regularised boosting.
pub fn default_learners() -> Vec<NamedSpec> {
    vec![
        NamedSpec::new("random_forest", LearnerSpec::Forest(ForestParams::default())),
        NamedSpec::new("boosted_deep", LearnerSpec::Boosted(BoostParams::deep())),
        NamedSpec::new("boosted_regularized", LearnerSpec::Boosted(BoostParams::regularized())),
    ]
}

/// A fitted base learner. The forest's raw output is a default rate, the boosted
/// ensemble's is a logit; the combiner is linear in either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseLearner {
    Forest(RandomForest),
    Boosted(GradientBoosting),
}

impl BaseLearner {
    pub fn predict_raw(&self, x: &[f64]) -> f64 {
        match self {
            BaseLearner::Forest(forest) => forest.predict(x),
            BaseLearner::Boosted(boosted) => boosted.predict_logit(x),
        }
    }

    pub fn expected_value(&self) -> f64 {
        match self {
            BaseLearner::Forest(forest) => forest.expected_value(),
            BaseLearner::Boosted(boosted) => boosted.expected_value(),
        }
    }

    /// Adds `scale * φ(x)` into `phi`, so `Σ φ = scale * (raw(x) - expected_value())`.
    pub fn shap_into(&self, x: &[f64], phi: &mut [f64], scale: f64) {
        match self {
            BaseLearner::Forest(forest) => {
                let per_tree = scale / forest.trees.len().max(1) as f64;
                for tree in &forest.trees {
                    tree_shap(tree, x, phi, per_tree);
                }
            }
            BaseLearner::Boosted(boosted) => {
                for tree in &boosted.trees {
                    tree_shap(tree, x, phi, scale);
                }
            }
        }
    }

    pub fn tree_count(&self) -> usize {
        match self {
            BaseLearner::Forest(forest) => forest.trees.len(),
            BaseLearner::Boosted(boosted) => boosted.trees.len(),
        }
    }
}
