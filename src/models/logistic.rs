// src/models/logistic.rs
use log::warn;
use serde::{Deserialize, Serialize};

pub fn sigmoid(logit: f64) -> f64 {
    1.0 / (1.0 + (-logit).exp())
}

/// Natural log-odds, with `p` clamped away from 0 and 1.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-12, 1.0 - 1e-12);
    (p / (1.0 - p)).ln()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 400,
            l2: 1e-3,
        }
    }
}

/// Logistic regression over a small dense input. Serves as the stacking/blending
/// meta-learner and as the Platt scaler.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    /// Input coefficients followed by the intercept.
    weights: Vec<f64>,
}

impl LogisticRegression {
    /// An untrained model: every coefficient and the intercept at zero.
    pub fn new(feature_count: usize) -> Self {
        Self {
            weights: vec![0.0; feature_count + 1],
        }
    }

    pub fn from_parts(coefficients: Vec<f64>, intercept: f64) -> Self {
        let mut weights = coefficients;
        weights.push(intercept);
        Self { weights }
    }

    pub fn feature_count(&self) -> usize {
        self.weights.len() - 1
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.weights[..self.weights.len() - 1]
    }

    pub fn intercept(&self) -> f64 {
        self.weights[self.weights.len() - 1]
    }

    pub fn decision_function(&self, features: &[f64]) -> f64 {
        if features.len() != self.feature_count() {
            warn!(
                "Logistic model takes {} inputs, got {}; scoring as 0.0",
                self.feature_count(),
                features.len()
            );
            return 0.0;
        }
        self.intercept()
            + self
                .coefficients()
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        sigmoid(self.decision_function(features))
    }

    /// Batch gradient descent on weighted log-loss with an L2 penalty.
    ///
    /// Inputs are standardised internally and the fitted weights folded back, so the
    /// model applies directly to raw inputs.
    pub fn fit(samples: &[Vec<f64>], labels: &[u8], sample_weights: &[f64], params: &LogisticParams) -> Self {
        let n_features = samples.first().map(Vec::len).unwrap_or(0);
        let mut model = Self::new(n_features);
        let total_weight: f64 = sample_weights.iter().sum();
        if samples.is_empty() || total_weight <= 0.0 {
            return model;
        }

        let mut mean = vec![0.0; n_features];
        let mut std = vec![0.0; n_features];
        for sample in samples {
            for (m, v) in mean.iter_mut().zip(sample) {
                *m += v / samples.len() as f64;
            }
        }
        for sample in samples {
            for ((s, m), v) in std.iter_mut().zip(&mean).zip(sample) {
                *s += (v - m).powi(2) / samples.len() as f64;
            }
        }
        for s in std.iter_mut() {
            *s = s.sqrt();
            if *s < 1e-12 {
                *s = 1.0;
            }
        }
        let standardized: Vec<Vec<f64>> = samples
            .iter()
            .map(|sample| {
                sample
                    .iter()
                    .zip(mean.iter().zip(&std))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect();

        let mut z_model = Self::new(n_features);
        let mut gradient = vec![0.0; n_features + 1];
        for _ in 0..params.epochs {
            gradient.iter_mut().for_each(|g| *g = 0.0);
            for ((z, &label), &w) in standardized.iter().zip(labels).zip(sample_weights) {
                let error = z_model.predict(z) - f64::from(label);
                for (g, v) in gradient.iter_mut().zip(z) {
                    *g += w * error * v;
                }
                gradient[n_features] += w * error;
            }
            for i in 0..=n_features {
                let penalty = if i < n_features {
                    params.l2 * z_model.weights[i]
                } else {
                    0.0
                };
                z_model.weights[i] -= params.learning_rate * (gradient[i] / total_weight + penalty);
            }
        }

        let mut intercept = z_model.intercept();
        for i in 0..n_features {
            model.weights[i] = z_model.weights[i] / std[i];
            intercept -= z_model.weights[i] * mean[i] / std[i];
        }
        model.weights[n_features] = intercept;
        model
    }
}
