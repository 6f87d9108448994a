// src/ensemble/mod.rs
pub mod metrics;

use indicatif::ProgressBar;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::calibration::{calibrate, CalibrationMethod, Calibrator};
use crate::dataset::{
    stratified_folds, stratified_holdout, EncodedDataset, RowProvenance, Split, SplitConfig, TrainingDataset,
};
use crate::errors::{EngineError, EngineResult};
use crate::features::FeatureSchema;
use crate::models::logistic::{LogisticParams, LogisticRegression};
use crate::models::tree::{BinnedMatrix, DEFAULT_MAX_BINS};
use crate::models::{default_learners, BaseLearner, NamedSpec, TrainingView};
pub use metrics::{Metrics, RocPoint};
use metrics::{roc_curve, MAX_ROC_POINTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Equal-weight soft vote over the full set of learners.
    Voting,
    Stacking,
    Blending,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "voting" | "vote" | "soft_voting" => Ok(Strategy::Voting),
            "stacking" | "stacked" => Ok(Strategy::Stacking),
            "blending" | "blended" => Ok(Strategy::Blending),
            other => Err(format!("unknown ensemble strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Single,
    Voting,
    Blended,
    Stacked,
}

impl VariantKind {
    /// Lower is simpler; used as the last tie-breaker.
    pub fn simplicity_rank(&self) -> u8 {
        match self {
            VariantKind::Single => 0,
            VariantKind::Voting => 1,
            VariantKind::Blended => 2,
            VariantKind::Stacked => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub seed: u64,
    pub split: SplitConfig,
    pub learners: Vec<NamedSpec>,
    pub strategies: Vec<Strategy>,
    pub stacking_folds: usize,
    /// Share of the train split held back to fit the blending combiner.
    pub blend_fraction: f64,
    pub meta: LogisticParams,
    pub calibration: CalibrationMethod,
    pub max_bins: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            split: SplitConfig::default(),
            learners: default_learners(),
            strategies: vec![Strategy::Voting, Strategy::Stacking, Strategy::Blending],
            stacking_folds: 5,
            blend_fraction: 0.3,
            meta: LogisticParams::default(),
            calibration: CalibrationMethod::Platt,
            max_bins: DEFAULT_MAX_BINS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLearner {
    pub name: String,
    pub learner: BaseLearner,
}

/// Linear map from base-learner raw outputs to the ensemble's raw score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combiner {
    pub intercept: f64,
    pub weights: Vec<f64>,
}

impl Combiner {
    pub fn identity() -> Self {
        Self {
            intercept: 0.0,
            weights: vec![1.0],
        }
    }

    fn from_meta(meta: &LogisticRegression) -> Self {
        Self {
            intercept: meta.intercept(),
            weights: meta.coefficients().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    pub name: String,
    pub kind: VariantKind,
    pub learners: Vec<NamedLearner>,
    pub combiner: Combiner,
}

impl Ensemble {
    pub fn base_outputs(&self, x: &[f64]) -> Vec<f64> {
        self.learners.iter().map(|l| l.learner.predict_raw(x)).collect()
    }

    pub fn raw_score(&self, x: &[f64]) -> f64 {
        self.combiner.intercept
            + self
                .combiner
                .weights
                .iter()
                .zip(&self.learners)
                .map(|(w, l)| w * l.learner.predict_raw(x))
                .sum::<f64>()
    }

    /// The raw score expected over the training population.
    pub fn baseline(&self) -> f64 {
        self.combiner.intercept
            + self
                .combiner
                .weights
                .iter()
                .zip(&self.learners)
                .map(|(w, l)| w * l.learner.expected_value())
                .sum::<f64>()
    }

    /// Per-field additive contributions; they sum to `raw_score(x) - baseline()`.
    pub fn contributions(&self, x: &[f64]) -> Vec<f64> {
        let mut phi = vec![0.0; x.len()];
        for (w, l) in self.combiner.weights.iter().zip(&self.learners) {
            l.learner.shap_into(x, &mut phi, *w);
        }
        phi
    }

    pub fn learner_names(&self) -> Vec<&str> {
        self.learners.iter().map(|l| l.name.as_str()).collect()
    }
}

/// One row of the variant comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantReport {
    pub name: String,
    pub kind: VariantKind,
    pub validation: Metrics,
    pub holdout: Metrics,
    /// Holdout ROC curve of the variant's raw score.
    #[serde(default)]
    pub roc: Vec<RocPoint>,
    pub selected: bool,
}

/// The outcome of one training run, ready to be wrapped into an artifact.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub schema: FeatureSchema,
    pub ensemble: Ensemble,
    pub calibrator: Calibrator,
    pub validation: Metrics,
    pub holdout: Metrics,
    pub comparison: Vec<VariantReport>,
    pub training_rows: usize,
    pub provenance: RowProvenance,
}

struct Candidate {
    ensemble: Ensemble,
    calibrator: Calibrator,
    validation: Metrics,
    holdout: Metrics,
    holdout_roc: Vec<RocPoint>,
}

pub struct Trainer<'a> {
    config: &'a TrainerConfig,
    cancel: Option<&'a AtomicBool>,
    progress: Option<ProgressBar>,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainerConfig) -> Self {
        Self {
            config,
            cancel: None,
            progress: None,
        }
    }

    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Number of learner fits one run performs, for sizing a progress bar.
    pub fn planned_fits(&self) -> u64 {
        let per_round = self.config.learners.len() as u64;
        let mut fits = per_round;
        for strategy in &self.config.strategies {
            fits += match strategy {
                Strategy::Voting => 0,
                Strategy::Stacking => per_round * self.config.stacking_folds.max(2) as u64,
                Strategy::Blending => per_round,
            };
        }
        fits
    }

    /// Fits every configured variant and selects the best by validation AUC, then
    /// validation accuracy, then simplicity. Never touches the registry.
    pub fn fit(&self, dataset: &TrainingDataset) -> EngineResult<TrainedModel> {
        if self.config.learners.is_empty() {
            return Err(EngineError::Internal("no base learners configured".into()));
        }
        let min_rows = self.config.split.min_split_rows;
        dataset.check_split(Split::Train, min_rows)?;
        dataset.check_split(Split::Validation, min_rows)?;
        dataset.check_split(Split::Holdout, min_rows)?;

        let train_apps: Vec<_> = dataset.rows_in(Split::Train).into_iter().map(|r| &r.application).collect();
        let schema = FeatureSchema::fit(&train_apps)?;
        let encoded = dataset.encode(&schema)?;
        let train_rows = encoded.indices(Split::Train);
        let val_rows = encoded.indices(Split::Validation);
        let hold_rows = encoded.indices(Split::Holdout);
        info!(
            "🏋️ Training on {} rows ({} validation, {} holdout), {} features, schema {}",
            train_rows.len(),
            val_rows.len(),
            hold_rows.len(),
            schema.width(),
            schema.version
        );

        let binned = BinnedMatrix::build(&encoded.x, &train_rows, self.config.max_bins);
        let view = TrainingView {
            x: &encoded.x,
            binned: &binned,
            labels: &encoded.labels,
            weights: &encoded.weights,
        };

        let full = self.fit_learners(&view, &train_rows, 0)?;
        let mut ensembles: Vec<Ensemble> = full
            .iter()
            .map(|l| Ensemble {
                name: format!("single:{}", l.name),
                kind: VariantKind::Single,
                learners: vec![l.clone()],
                combiner: Combiner::identity(),
            })
            .collect();

        for strategy in &self.config.strategies {
            let ensemble = match strategy {
                Strategy::Voting => vote(&view, &train_rows, &full),
                Strategy::Stacking => self.stack(&view, &train_rows, &full)?,
                Strategy::Blending => self.blend(&view, &train_rows)?,
            };
            ensembles.push(ensemble);
        }

        let mut candidates: Vec<Candidate> = ensembles
            .into_iter()
            .map(|ensemble| {
                let val_raw = raw_scores(&ensemble, &encoded, &val_rows);
                let val_labels = encoded.labels_of(&val_rows);
                let calibrator = calibrate(&val_raw, &val_labels, self.config.calibration);
                let validation = evaluate_scores(&val_raw, &val_labels, &calibrator);
                let hold_raw = raw_scores(&ensemble, &encoded, &hold_rows);
                let hold_labels = encoded.labels_of(&hold_rows);
                let holdout = evaluate_scores(&hold_raw, &hold_labels, &calibrator);
                let holdout_roc = roc_curve(&hold_raw, &hold_labels, MAX_ROC_POINTS);
                debug!(
                    "Variant {}: validation AUC {:.4}, accuracy {:.4}",
                    ensemble.name, validation.auc, validation.accuracy
                );
                Candidate {
                    ensemble,
                    calibrator,
                    validation,
                    holdout,
                    holdout_roc,
                }
            })
            .collect();

        let best = select_best(&candidates)
            .ok_or_else(|| EngineError::Internal("no ensemble variant was trained".into()))?;
        let comparison = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| VariantReport {
                name: c.ensemble.name.clone(),
                kind: c.ensemble.kind,
                validation: c.validation,
                holdout: c.holdout,
                roc: c.holdout_roc.clone(),
                selected: i == best,
            })
            .collect();
        let chosen = candidates.swap_remove(best);
        if let Some(bar) = &self.progress {
            bar.finish_with_message(format!("selected {}", chosen.ensemble.name));
        }
        info!(
            "🏆 Selected {} (validation AUC {:.4}, holdout AUC {:.4})",
            chosen.ensemble.name, chosen.validation.auc, chosen.holdout.auc
        );

        Ok(TrainedModel {
            schema,
            ensemble: chosen.ensemble,
            calibrator: chosen.calibrator,
            validation: chosen.validation,
            holdout: chosen.holdout,
            comparison,
            training_rows: train_rows.len(),
            provenance: dataset.provenance(),
        })
    }

    fn check_cancel(&self) -> EngineResult<()> {
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn fit_learners(&self, view: &TrainingView<'_>, rows: &[usize], round: u64) -> EngineResult<Vec<NamedLearner>> {
        let mut fitted = Vec::with_capacity(self.config.learners.len());
        for (k, named) in self.config.learners.iter().enumerate() {
            self.check_cancel()?;
            let seed = self
                .config
                .seed
                .wrapping_add(round.wrapping_mul(7919))
                .wrapping_add(k as u64 * 104_729);
            let learner = named.spec.fit(view, rows, seed, self.cancel)?;
            if let Some(bar) = &self.progress {
                bar.inc(1);
                bar.set_message(named.name.clone());
            }
            fitted.push(NamedLearner {
                name: named.name.clone(),
                learner,
            });
        }
        Ok(fitted)
    }

    /// Out-of-fold predictions train the meta-learner; the served learners are the
    /// ones refitted on the full train split.
    fn stack(&self, view: &TrainingView<'_>, train_rows: &[usize], full: &[NamedLearner]) -> EngineResult<Ensemble> {
        let k = self.config.stacking_folds.max(2);
        let folds = stratified_folds(view.labels, train_rows, k, self.config.seed);
        let n = view.labels.len();
        let mut oof: Vec<Option<Vec<f64>>> = vec![None; n];

        for (f, fold) in folds.iter().enumerate() {
            if fold.is_empty() {
                continue;
            }
            let mut in_fold = vec![false; n];
            fold.iter().for_each(|&i| in_fold[i] = true);
            let fit_rows: Vec<usize> = train_rows.iter().copied().filter(|&i| !in_fold[i]).collect();
            let learners = self.fit_learners(view, &fit_rows, f as u64 + 1)?;
            for &i in fold {
                let x = view.x.row(i).to_vec();
                oof[i] = Some(learners.iter().map(|l| l.learner.predict_raw(&x)).collect());
            }
        }

        let (samples, labels, weights) = meta_inputs(train_rows, &oof, view);
        let meta = LogisticRegression::fit(&samples, &labels, &weights, &self.config.meta);
        Ok(Ensemble {
            name: "stacked".to_string(),
            kind: VariantKind::Stacked,
            learners: full.to_vec(),
            combiner: Combiner::from_meta(&meta),
        })
    }

    fn blend(&self, view: &TrainingView<'_>, train_rows: &[usize]) -> EngineResult<Ensemble> {
        let (fit_rows, blend_rows) =
            stratified_holdout(view.labels, train_rows, self.config.blend_fraction, self.config.seed);
        if blend_rows.is_empty() || fit_rows.is_empty() {
            return Err(EngineError::InsufficientData(
                "train split too small to hold out a blending subset".into(),
            ));
        }
        let learners = self.fit_learners(view, &fit_rows, 1_000)?;
        let mut outputs: Vec<Option<Vec<f64>>> = vec![None; view.labels.len()];
        for &i in &blend_rows {
            let x = view.x.row(i).to_vec();
            outputs[i] = Some(learners.iter().map(|l| l.learner.predict_raw(&x)).collect());
        }
        let (samples, labels, weights) = meta_inputs(&blend_rows, &outputs, view);
        let meta = LogisticRegression::fit(&samples, &labels, &weights, &self.config.meta);
        Ok(Ensemble {
            name: "blended".to_string(),
            kind: VariantKind::Blended,
            learners,
            combiner: Combiner::from_meta(&meta),
        })
    }
}

/// Soft vote with equal say per learner: each raw output is standardised over the
/// train split and the standardised outputs are averaged. Calibration then maps the
/// vote to a probability; the combiner stays linear so attributions remain exact.
fn vote(view: &TrainingView<'_>, train_rows: &[usize], full: &[NamedLearner]) -> Ensemble {
    let k = full.len().max(1) as f64;
    let mut intercept = 0.0;
    let mut weights = Vec::with_capacity(full.len());
    for named in full {
        let outputs: Vec<f64> = train_rows
            .iter()
            .map(|&i| named.learner.predict_raw(&view.x.row(i).to_vec()))
            .collect();
        let n = outputs.len().max(1) as f64;
        let mean = outputs.iter().sum::<f64>() / n;
        let std = (outputs.iter().map(|o| (o - mean).powi(2)).sum::<f64>() / n).sqrt();
        let std = if std > 1e-12 { std } else { 1.0 };
        weights.push(1.0 / (k * std));
        intercept -= mean / (k * std);
    }
    Ensemble {
        name: "voting".to_string(),
        kind: VariantKind::Voting,
        learners: full.to_vec(),
        combiner: Combiner { intercept, weights },
    }
}

fn meta_inputs(
    rows: &[usize],
    outputs: &[Option<Vec<f64>>],
    view: &TrainingView<'_>,
) -> (Vec<Vec<f64>>, Vec<u8>, Vec<f64>) {
    let mut samples = Vec::with_capacity(rows.len());
    let mut labels = Vec::with_capacity(rows.len());
    let mut weights = Vec::with_capacity(rows.len());
    for &i in rows {
        if let Some(out) = &outputs[i] {
            samples.push(out.clone());
            labels.push(view.labels[i]);
            weights.push(view.weights[i]);
        }
    }
    (samples, labels, weights)
}

fn raw_scores(ensemble: &Ensemble, encoded: &EncodedDataset, rows: &[usize]) -> Vec<f64> {
    rows.iter().map(|&i| ensemble.raw_score(&encoded.row_vec(i))).collect()
}

pub fn evaluate_scores(raw: &[f64], labels: &[u8], calibrator: &Calibrator) -> Metrics {
    let probabilities: Vec<f64> = raw.iter().map(|&r| calibrator.apply(r)).collect();
    Metrics::compute(raw, &probabilities, labels)
}

fn select_best(candidates: &[Candidate]) -> Option<usize> {
    let better = |a: &Candidate, b: &Candidate| -> CmpOrdering {
        a.validation
            .auc
            .total_cmp(&b.validation.auc)
            .then(a.validation.accuracy.total_cmp(&b.validation.accuracy))
            .then(b.ensemble.kind.simplicity_rank().cmp(&a.ensemble.kind.simplicity_rank()))
    };
    let mut best: Option<usize> = None;
    for (i, c) in candidates.iter().enumerate() {
        match best {
            Some(b) if better(c, &candidates[b]) != CmpOrdering::Greater => {}
            _ => best = Some(i),
        }
    }
    best
}


#[cfg(test)]
mod tests {
    use super::test_support::small_trainer_config;
    use super::*;
    use crate::dataset::LabeledApplication;
    use crate::features::test_support::synthetic_applications;

    fn dataset(n: usize, seed: u64) -> TrainingDataset {
        let rows = synthetic_applications(n, seed)
            .into_iter()
            .map(|(a, y)| LabeledApplication::new(a, y))
            .collect();
        TrainingDataset::split(rows, &SplitConfig::default(), seed)
    }

    #[test]
    fn test_fit_reports_every_variant_and_selects_one() {
        let config = small_trainer_config(11);
        let model = Trainer::new(&config).fit(&dataset(400, 11)).unwrap();

        let names: Vec<&str> = model.comparison.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "single:random_forest",
                "single:boosted_deep",
                "single:boosted_regularized",
                "voting",
                "stacked",
                "blended"
            ]
        );
        for report in &model.comparison {
            assert!(report.roc.len() >= 2 && report.roc.len() <= MAX_ROC_POINTS);
            assert_eq!(report.roc.last(), Some(&RocPoint { fpr: 1.0, tpr: 1.0 }));
        }
        assert_eq!(model.comparison.iter().filter(|r| r.selected).count(), 1);
        let selected = model.comparison.iter().find(|r| r.selected).unwrap();
        for report in &model.comparison {
            assert!(selected.validation.auc >= report.validation.auc);
        }
        assert!(model.validation.auc > 0.6, "validation AUC {}", model.validation.auc);
        assert_eq!(model.ensemble.combiner.weights.len(), model.ensemble.learners.len());
    }

    #[test]
    fn test_fit_is_reproducible() {
        let config = small_trainer_config(5);
        let data = dataset(300, 5);
        let a = Trainer::new(&config).fit(&data).unwrap();
        let b = Trainer::new(&config).fit(&data).unwrap();
        assert_eq!(a.ensemble, b.ensemble);
        assert_eq!(a.calibrator, b.calibrator);
    }

    #[test]
    fn test_contributions_sum_to_raw_minus_baseline() {
        let config = small_trainer_config(3);
        let data = dataset(300, 3);
        let model = Trainer::new(&config).fit(&data).unwrap();
        let x = model.schema.prepare(&data.rows[0].application).unwrap().values;
        let phi: f64 = model.ensemble.contributions(&x).iter().sum();
        let expected = model.ensemble.raw_score(&x) - model.ensemble.baseline();
        assert!((phi - expected).abs() <= 1e-6 * expected.abs().max(1.0));
    }

    #[test]
    fn test_small_split_is_insufficient() {
        let config = small_trainer_config(1);
        assert!(matches!(
            Trainer::new(&config).fit(&dataset(40, 1)),
            Err(EngineError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_cancel_flag_aborts_fit() {
        let config = small_trainer_config(2);
        let flag = AtomicBool::new(true);
        assert!(matches!(
            Trainer::new(&config).with_cancel(&flag).fit(&dataset(300, 2)),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_selection_prefers_simpler_on_tie() {
        let metrics = Metrics {
            auc: 0.8,
            accuracy: 0.7,
            ..Metrics::default()
        };
        let make = |kind| Candidate {
            ensemble: Ensemble {
                name: format!("{:?}", kind),
                kind,
                learners: Vec::new(),
                combiner: Combiner::identity(),
            },
            calibrator: Calibrator::Platt {
                slope: 1.0,
                intercept: 0.0,
            },
            validation: metrics,
            holdout: metrics,
            holdout_roc: Vec::new(),
        };
        let candidates = vec![make(VariantKind::Stacked), make(VariantKind::Single), make(VariantKind::Blended)];
        assert_eq!(select_best(&candidates), Some(1));
        let candidates = vec![make(VariantKind::Blended), make(VariantKind::Voting)];
        assert_eq!(select_best(&candidates), Some(1));
    }

    #[test]
    fn test_voting_gives_each_learner_an_equal_standardised_say() {
        let mut config = small_trainer_config(9);
        config.strategies = vec![Strategy::Voting];
        let data = dataset(300, 9);
        let model = Trainer::new(&config).fit(&data).unwrap();
        let report = model.comparison.iter().find(|r| r.name == "voting").unwrap();
        assert_eq!(report.kind, VariantKind::Voting);
        assert!(report.validation.auc > 0.6, "voting AUC {}", report.validation.auc);

        // Rebuild the vote from freshly fitted learners: on the train split every
        // learner's weighted output has mean 0 and spread 1/k.
        let encoded = data.encode(&model.schema).unwrap();
        let train = encoded.indices(Split::Train);
        let binned = BinnedMatrix::build(&encoded.x, &train, config.max_bins);
        let view = TrainingView {
            x: &encoded.x,
            binned: &binned,
            labels: &encoded.labels,
            weights: &encoded.weights,
        };
        let singles: Vec<NamedLearner> = config
            .learners
            .iter()
            .map(|spec| NamedLearner {
                name: spec.name.clone(),
                learner: spec.spec.fit(&view, &train, 0, None).unwrap(),
            })
            .collect();
        let k = singles.len() as f64;
        let voting = vote(&view, &train, &singles);
        for (w, l) in voting.combiner.weights.iter().zip(&voting.learners) {
            let scaled: Vec<f64> = train.iter().map(|&i| w * l.learner.predict_raw(&encoded.row_vec(i))).collect();
            let mean = scaled.iter().sum::<f64>() / scaled.len() as f64;
            let std = (scaled.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / scaled.len() as f64).sqrt();
            assert!((std - 1.0 / k).abs() < 1e-9, "spread {}", std);
        }
        let centred: f64 = train
            .iter()
            .map(|&i| voting.raw_score(&encoded.row_vec(i)))
            .sum::<f64>()
            / train.len() as f64;
        assert!(centred.abs() < 1e-9);
        assert!("soft_voting".parse::<Strategy>().is_ok());
    }
}
