// src/calibration.rs
use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::logistic::{logit, sigmoid, LogisticParams, LogisticRegression};

const PROBABILITY_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    #[default]
    Platt,
    Isotonic,
}

impl std::str::FromStr for CalibrationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "platt" | "sigmoid" => Ok(CalibrationMethod::Platt),
            "isotonic" => Ok(CalibrationMethod::Isotonic),
            other => Err(format!("unknown calibration method '{}'", other)),
        }
    }
}

/// Monotone map from raw ensemble score to probability of default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calibrator {
    /// `sigmoid(slope * raw + intercept)` with `slope > 0`.
    Platt { slope: f64, intercept: f64 },
    /// Piecewise-linear interpolation through non-decreasing knots, flat outside.
    Isotonic { knots_x: Vec<f64>, knots_y: Vec<f64> },
}

impl Calibrator {
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Calibrator::Platt { slope, intercept } => sigmoid(slope * raw + intercept),
            Calibrator::Isotonic { knots_x, knots_y } => interpolate(raw, knots_x, knots_y),
        }
    }

    pub fn method(&self) -> CalibrationMethod {
        match self {
            Calibrator::Platt { .. } => CalibrationMethod::Platt,
            Calibrator::Isotonic { .. } => CalibrationMethod::Isotonic,
        }
    }
}

/// Fits a calibration function on (raw score, label) pairs.
pub fn calibrate(raw_scores: &[f64], labels: &[u8], method: CalibrationMethod) -> Calibrator {
    match method {
        CalibrationMethod::Platt => fit_platt(raw_scores, labels),
        CalibrationMethod::Isotonic => fit_isotonic(raw_scores, labels),
    }
}

fn fit_platt(raw_scores: &[f64], labels: &[u8]) -> Calibrator {
    let samples: Vec<Vec<f64>> = raw_scores.iter().map(|&s| vec![s]).collect();
    let weights = vec![1.0; labels.len()];
    let params = LogisticParams {
        learning_rate: 0.5,
        epochs: 500,
        l2: 0.0,
    };
    let model = LogisticRegression::fit(&samples, labels, &weights, &params);
    let slope = model.coefficients().first().copied().unwrap_or(0.0);
    if slope > 0.0 && slope.is_finite() {
        return Calibrator::Platt {
            slope,
            intercept: model.intercept(),
        };
    }

    // Scores carry no usable ordering signal; stay strictly increasing around the base rate.
    warn!("⚠️ Platt fit produced non-positive slope {:.4}; falling back to base rate", slope);
    let positives = labels.iter().filter(|&&y| y == 1).count() as f64;
    let rate = if labels.is_empty() {
        0.5
    } else {
        positives / labels.len() as f64
    };
    let slope = 1e-6;
    let centre = raw_scores.iter().sum::<f64>() / raw_scores.len().max(1) as f64;
    Calibrator::Platt {
        slope,
        intercept: logit(rate) - slope * centre,
    }
}

fn fit_isotonic(raw_scores: &[f64], labels: &[u8]) -> Calibrator {
    let mut points: Vec<(f64, f64)> = raw_scores
        .iter()
        .zip(labels)
        .map(|(&s, &y)| (s, f64::from(y)))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Equal scores collapse into one weighted point first.
    let mut xs: Vec<f64> = Vec::new();
    let mut ys: Vec<f64> = Vec::new();
    let mut ws: Vec<f64> = Vec::new();
    for (x, y) in points {
        match xs.last() {
            Some(&last) if last == x => {
                let i = ys.len() - 1;
                ys[i] = (ys[i] * ws[i] + y) / (ws[i] + 1.0);
                ws[i] += 1.0;
            }
            _ => {
                xs.push(x);
                ys.push(y);
                ws.push(1.0);
            }
        }
    }

    // Pool adjacent violators; each block keeps its weighted mean x.
    let mut block_x: Vec<f64> = Vec::with_capacity(xs.len());
    let mut block_y: Vec<f64> = Vec::with_capacity(xs.len());
    let mut block_w: Vec<f64> = Vec::with_capacity(xs.len());
    for ((x, y), w) in xs.into_iter().zip(ys).zip(ws) {
        block_x.push(x);
        block_y.push(y);
        block_w.push(w);
        while block_y.len() > 1 && block_y[block_y.len() - 1] < block_y[block_y.len() - 2] {
            let (Some(y2), Some(w2), Some(x2)) = (block_y.pop(), block_w.pop(), block_x.pop()) else {
                break;
            };
            let i = block_y.len() - 1;
            let total = block_w[i] + w2;
            block_y[i] = (block_y[i] * block_w[i] + y2 * w2) / total;
            block_x[i] = (block_x[i] * block_w[i] + x2 * w2) / total;
            block_w[i] = total;
        }
    }

    let knots_y = block_y
        .into_iter()
        .map(|p| p.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR))
        .collect();
    Calibrator::Isotonic {
        knots_x: block_x,
        knots_y,
    }
}

fn interpolate(raw: f64, xs: &[f64], ys: &[f64]) -> f64 {
    match xs.len() {
        0 => 0.5,
        1 => ys[0],
        _ => {
            if raw <= xs[0] {
                return ys[0];
            }
            if raw >= xs[xs.len() - 1] {
                return ys[ys.len() - 1];
            }
            let i = xs.partition_point(|&x| x <= raw);
            let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
            let dx = x1 - x0;
            if dx <= 0.0 {
                return y0;
            }
            y0 + (raw - x0) / dx * (y1 - y0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Deny => write!(f, "deny"),
        }
    }
}

impl Decision {
    /// The outcome this decision bets on: deny ⇔ expected default.
    pub fn predicted_label(&self) -> u8 {
        match self {
            Decision::Approve => 0,
            Decision::Deny => 1,
        }
    }
}

/// `probability >= threshold` denies.
pub fn decide(probability: f64, threshold: f64) -> Decision {
    if probability >= threshold {
        Decision::Deny
    } else {
        Decision::Approve
    }
}
