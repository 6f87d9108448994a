// src/ensemble/metrics.rs
use serde::{Deserialize, Serialize};

/// Area under the ROC curve via the rank-sum statistic; tied scores share their
/// mean rank. Returns 0.5 when either class is absent.
pub fn roc_auc(scores: &[f64], labels: &[u8]) -> f64 {
    let n_pos = labels.iter().filter(|&&y| y == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += order[i..=j].iter().filter(|&&k| labels[k] == 1).count() as f64 * mean_rank;
        i = j + 1;
    }
    let n_pos = n_pos as f64;
    (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// Upper bound on stored ROC points per curve.
pub const MAX_ROC_POINTS: usize = 101;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
}

/// ROC curve from (0, 0) to (1, 1), one point per distinct score, thinned to at
/// most `max_points` with both endpoints kept.
pub fn roc_curve(scores: &[f64], labels: &[u8], max_points: usize) -> Vec<RocPoint> {
    let n_pos = labels.iter().filter(|&&y| y == 1).count() as f64;
    let n_neg = labels.len() as f64 - n_pos;
    let origin = RocPoint { fpr: 0.0, tpr: 0.0 };
    if n_pos == 0.0 || n_neg == 0.0 {
        return vec![origin, RocPoint { fpr: 1.0, tpr: 1.0 }];
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut curve = vec![origin];
    let (mut tp, mut fp) = (0.0, 0.0);
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        for &k in &order[i..=j] {
            if labels[k] == 1 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
        }
        curve.push(RocPoint {
            fpr: fp / n_neg,
            tpr: tp / n_pos,
        });
        i = j + 1;
    }

    let max_points = max_points.max(2);
    if curve.len() <= max_points {
        return curve;
    }
    let last = curve.len() - 1;
    let mut picked: Vec<usize> = (0..max_points)
        .map(|j| ((j * last) as f64 / (max_points - 1) as f64).round() as usize)
        .collect();
    picked.dedup();
    picked.into_iter().map(|k| curve[k]).collect()
}

/// Share of rows where `p >= 0.5` agrees with the label.
pub fn accuracy(probabilities: &[f64], labels: &[u8]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let hits = probabilities
        .iter()
        .zip(labels)
        .filter(|(p, y)| u8::from(**p >= 0.5) == **y)
        .count();
    hits as f64 / labels.len() as f64
}

pub fn brier_score(probabilities: &[f64], labels: &[u8]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    probabilities
        .iter()
        .zip(labels)
        .map(|(p, y)| (p - f64::from(*y)).powi(2))
        .sum::<f64>()
        / labels.len() as f64
}

pub fn log_loss(probabilities: &[f64], labels: &[u8]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    probabilities
        .iter()
        .zip(labels)
        .map(|(p, y)| {
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            if *y == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum::<f64>()
        / labels.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub auc: f64,
    pub accuracy: f64,
    pub brier: f64,
    pub log_loss: f64,
    pub rows: usize,
}

impl Metrics {
    /// AUC from the raw scores, the rest from calibrated probabilities.
    pub fn compute(raw_scores: &[f64], probabilities: &[f64], labels: &[u8]) -> Self {
        Self {
            auc: roc_auc(raw_scores, labels),
            accuracy: accuracy(probabilities, labels),
            brier: brier_score(probabilities, labels),
            log_loss: log_loss(probabilities, labels),
            rows: labels.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auc_perfect_inverse_and_ties() {
        let labels = [0, 0, 1, 1];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), 1.0);
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), 0.0);
        assert_eq!(roc_auc(&[0.5, 0.5, 0.5, 0.5], &labels), 0.5);
        assert_eq!(roc_auc(&[0.1, 0.2], &[1, 1]), 0.5);
    }

    #[test]
    fn test_auc_counts_pairs() {
        // Pairs (pos, neg): (0.4 > 0.3) yes, (0.4 > 0.5) no, (0.7 > both) yes.
        let auc = roc_auc(&[0.3, 0.5, 0.4, 0.7], &[0, 0, 1, 1]);
        assert!((auc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_probability_metrics() {
        let p = [0.9, 0.2, 0.6, 0.4];
        let y = [1, 0, 0, 1];
        assert_eq!(accuracy(&p, &y), 0.5);
        let brier = (0.01 + 0.04 + 0.36 + 0.36) / 4.0;
        assert!((brier_score(&p, &y) - brier).abs() < 1e-12);
        assert!(log_loss(&p, &y) > 0.0);
    }

    #[test]
    fn test_roc_curve_area_matches_auc() {
        let scores = [0.3, 0.5, 0.4, 0.7, 0.5, 0.1, 0.9, 0.2];
        let labels = [0, 0, 1, 1, 1, 0, 1, 0];
        let curve = roc_curve(&scores, &labels, MAX_ROC_POINTS);
        assert_eq!(curve.first(), Some(&RocPoint { fpr: 0.0, tpr: 0.0 }));
        assert_eq!(curve.last(), Some(&RocPoint { fpr: 1.0, tpr: 1.0 }));
        let area: f64 = curve
            .windows(2)
            .map(|w| (w[1].fpr - w[0].fpr) * (w[1].tpr + w[0].tpr) / 2.0)
            .sum();
        assert!((area - roc_auc(&scores, &labels)).abs() < 1e-12);
    }

    #[test]
    fn test_roc_curve_is_thinned_monotonically() {
        let scores: Vec<f64> = (0..500).map(|i| i as f64).collect();
        let labels: Vec<u8> = (0..500).map(|i| u8::from(i % 3 == 0)).collect();
        let curve = roc_curve(&scores, &labels, 11);
        assert_eq!(curve.len(), 11);
        assert!(curve.windows(2).all(|w| w[1].fpr >= w[0].fpr && w[1].tpr >= w[0].tpr));
        assert_eq!(curve[10], RocPoint { fpr: 1.0, tpr: 1.0 });
    }
}
