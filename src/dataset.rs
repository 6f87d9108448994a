// src/dataset.rs
use anyhow::{Context, Result};
use log::{info, warn};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::errors::{EngineError, EngineResult};
use crate::features::{FeatureSchema, RawApplication};

pub const LABEL_COLUMN: &str = "loan_status";

/// One labeled row: 0 = repaid, 1 = default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledApplication {
    pub application: RawApplication,
    pub label: u8,
    /// Per-row importance multiplier (e.g. for corrective feedback).
    pub weight: f64,
}

impl LabeledApplication {
    pub fn new(application: RawApplication, label: u8) -> Self {
        Self {
            application,
            label,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Holdout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub validation_fraction: f64,
    pub holdout_fraction: f64,
    pub min_split_rows: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            holdout_fraction: 0.2,
            min_split_rows: 20,
        }
    }
}

/// Fingerprints of the rows a model was fitted on (train and validation) and of
/// the rows it was held out from. Stored on the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowProvenance {
    pub fitted: Vec<u64>,
    pub holdout: Vec<u64>,
}

impl RowProvenance {
    pub fn new(mut fitted: Vec<u64>, mut holdout: Vec<u64>) -> Self {
        fitted.sort_unstable();
        fitted.dedup();
        holdout.sort_unstable();
        holdout.dedup();
        Self { fitted, holdout }
    }

    pub fn is_empty(&self) -> bool {
        self.fitted.is_empty() && self.holdout.is_empty()
    }

    pub fn was_fitted(&self, fingerprint: u64) -> bool {
        self.fitted.binary_search(&fingerprint).is_ok()
    }

    pub fn was_held_out(&self, fingerprint: u64) -> bool {
        self.holdout.binary_search(&fingerprint).is_ok()
    }
}

/// Labeled rows with their split assignment.
#[derive(Debug, Clone)]
pub struct TrainingDataset {
    pub rows: Vec<LabeledApplication>,
    pub splits: Vec<Split>,
}

impl TrainingDataset {
    /// Stratified, seeded train/validation/holdout assignment.
    pub fn split(rows: Vec<LabeledApplication>, config: &SplitConfig, seed: u64) -> Self {
        Self::split_pinned(rows, config, seed, &RowProvenance::default())
    }

    /// Like `split`, but rows an earlier model was fitted on never reach the holdout
    /// and rows from its holdout always do, so both models can be judged on rows
    /// neither of them trained on.
    pub fn split_pinned(
        rows: Vec<LabeledApplication>,
        config: &SplitConfig,
        seed: u64,
        pins: &RowProvenance,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut splits = vec![Split::Train; rows.len()];
        for class in [0u8, 1u8] {
            let mut members: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, r)| r.label == class)
                .map(|(i, _)| i)
                .collect();
            members.shuffle(&mut rng);
            let n = members.len() as f64;
            let n_holdout = (n * config.holdout_fraction).round() as usize;
            let n_validation = (n * config.validation_fraction).round() as usize;

            let mut forced = Vec::new();
            let mut free = Vec::new();
            let mut barred = Vec::new();
            for idx in members {
                let fp = rows[idx].application.fingerprint();
                if pins.was_fitted(fp) {
                    barred.push(idx);
                } else if pins.was_held_out(fp) {
                    forced.push(idx);
                } else {
                    free.push(idx);
                }
            }

            let extra = n_holdout.saturating_sub(forced.len()).min(free.len());
            let mut pool: Vec<usize> = free.split_off(extra);
            for idx in forced.into_iter().chain(free) {
                splits[idx] = Split::Holdout;
            }
            pool.extend(barred);
            pool.shuffle(&mut rng);
            for (pos, idx) in pool.into_iter().enumerate() {
                splits[idx] = if pos < n_validation {
                    Split::Validation
                } else {
                    Split::Train
                };
            }
        }
        Self { rows, splits }
    }

    pub fn provenance(&self) -> RowProvenance {
        let mut fitted = Vec::new();
        let mut holdout = Vec::new();
        for (row, split) in self.rows.iter().zip(&self.splits) {
            let fp = row.application.fingerprint();
            match split {
                Split::Holdout => holdout.push(fp),
                Split::Train | Split::Validation => fitted.push(fp),
            }
        }
        RowProvenance::new(fitted, holdout)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn indices(&self, split: Split) -> Vec<usize> {
        self.splits
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == split)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn rows_in(&self, split: Split) -> Vec<&LabeledApplication> {
        self.indices(split).into_iter().map(|i| &self.rows[i]).collect()
    }

    /// Fails with `InsufficientData` when a split is too small or single-class.
    pub fn check_split(&self, split: Split, min_rows: usize) -> EngineResult<()> {
        let rows = self.rows_in(split);
        let positives = rows.iter().filter(|r| r.label == 1).count();
        if rows.len() < min_rows {
            return Err(EngineError::InsufficientData(format!(
                "{:?} split has {} rows, minimum is {}",
                split,
                rows.len(),
                min_rows
            )));
        }
        if positives == 0 || positives == rows.len() {
            return Err(EngineError::InsufficientData(format!(
                "{:?} split contains a single class",
                split
            )));
        }
        Ok(())
    }

    /// Encodes every row with a fitted schema.
    pub fn encode(&self, schema: &FeatureSchema) -> EngineResult<EncodedDataset> {
        let width = schema.width();
        let mut flat = Vec::with_capacity(self.rows.len() * width);
        for row in &self.rows {
            flat.extend(schema.prepare(&row.application)?.values);
        }
        let x = Array2::from_shape_vec((self.rows.len(), width), flat)
            .map_err(|e| EngineError::Internal(format!("feature matrix shape: {}", e)))?;
        Ok(EncodedDataset {
            x,
            labels: self.rows.iter().map(|r| r.label).collect(),
            weights: self.rows.iter().map(|r| r.weight).collect(),
            splits: self.splits.clone(),
        })
    }
}

/// Feature matrix for a `TrainingDataset` under one schema.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    pub x: Array2<f64>,
    pub labels: Vec<u8>,
    pub weights: Vec<f64>,
    pub splits: Vec<Split>,
}

impl EncodedDataset {
    pub fn indices(&self, split: Split) -> Vec<usize> {
        self.splits
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == split)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f64> {
        self.x.row(i)
    }

    pub fn row_vec(&self, i: usize) -> Vec<f64> {
        self.x.row(i).to_vec()
    }

    pub fn labels_of(&self, rows: &[usize]) -> Vec<u8> {
        rows.iter().map(|&i| self.labels[i]).collect()
    }
}

/// `n / (2 * n_class)` per class over the given rows; 1.0 for an absent class.
pub fn balanced_class_weights(labels: &[u8], rows: &[usize]) -> [f64; 2] {
    let n = rows.len() as f64;
    let positives = rows.iter().filter(|&&i| labels[i] == 1).count() as f64;
    let negatives = n - positives;
    let weight = |count: f64| if count > 0.0 { n / (2.0 * count) } else { 1.0 };
    [weight(negatives), weight(positives)]
}

/// Splits `rows` into `k` stratified folds.
pub fn stratified_folds(labels: &[u8], rows: &[usize], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k.max(1)];
    let mut cursor = 0usize;
    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = rows.iter().copied().filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        for idx in members {
            let n_folds = folds.len();
            folds[cursor % n_folds].push(idx);
            cursor += 1;
        }
    }
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    folds
}

/// Splits `rows` into a stratified (fit, held-out) pair.
pub fn stratified_holdout(
    labels: &[u8],
    rows: &[usize],
    held_out_fraction: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fit = Vec::new();
    let mut held_out = Vec::new();
    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = rows.iter().copied().filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        let cut = (members.len() as f64 * held_out_fraction).round() as usize;
        held_out.extend_from_slice(&members[..cut]);
        fit.extend_from_slice(&members[cut..]);
    }
    fit.sort_unstable();
    held_out.sort_unstable();
    (fit, held_out)
}

/// Loads the bulk credit dataset (source CSV layout, header row required).
///
/// Rows with an empty or unparsable cell are skipped and counted.
pub fn load_csv(path: &Path) -> Result<(Vec<LabeledApplication>, usize)> {
    info!("📥 Loading bulk dataset from {}", path.display());
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let header = lines
        .next()
        .context("Dataset file is empty")?
        .context("Failed to read dataset header")?;
    let columns: HashMap<String, usize> = header
        .split(',')
        .enumerate()
        .map(|(i, c)| (c.trim().to_string(), i))
        .collect();
    if !columns.contains_key(LABEL_COLUMN) {
        anyhow::bail!("Dataset header has no '{}' column", LABEL_COLUMN);
    }

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in lines.enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_no + 2))?;
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        match parse_row(&columns, &cells) {
            Some(row) => rows.push(row),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            "⚠️ Skipped {} incomplete rows while loading {}",
            skipped,
            path.display()
        );
    }
    info!("✅ Loaded {} labeled rows", rows.len());
    Ok((rows, skipped))
}

fn parse_row(columns: &HashMap<String, usize>, cells: &[&str]) -> Option<LabeledApplication> {
    let cell = |name: &str| -> Option<&str> {
        let value = *cells.get(*columns.get(name)?)?;
        (!value.is_empty()).then_some(value)
    };
    let number = |name: &str| -> Option<f64> { cell(name)?.parse::<f64>().ok().filter(|v| v.is_finite()) };
    let text = |name: &str| -> Option<String> { cell(name).map(str::to_string) };

    let label = match cell(LABEL_COLUMN)? {
        "0" => 0,
        "1" => 1,
        _ => return None,
    };
    let application = RawApplication {
        person_age: Some(number("person_age")?),
        person_income: Some(number("person_income")?),
        person_home_ownership: Some(text("person_home_ownership")?),
        person_emp_length: Some(number("person_emp_length")?),
        loan_intent: Some(text("loan_intent")?),
        loan_grade: Some(text("loan_grade")?),
        loan_amnt: Some(number("loan_amnt")?),
        loan_int_rate: Some(number("loan_int_rate")?),
        loan_percent_income: number("loan_percent_income"),
        cb_person_default_on_file: Some(text("cb_person_default_on_file")?),
        cb_person_cred_hist_length: Some(number("cb_person_cred_hist_length")?),
    };
    Some(LabeledApplication::new(application, label))
}
