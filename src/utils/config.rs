// src/utils/config.rs
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::calibration::CalibrationMethod;
use crate::ensemble::{Strategy, TrainerConfig};
use crate::explain::DEFAULT_SUMMARY_SIZE;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using default", raw, key);
            default
        }),
        Err(_) => default,
    }
}

/// Serving and retraining policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub decision_threshold: f64,
    pub summary_size: usize,
    /// New feedback rows that trigger a background retrain; 0 disables.
    pub auto_retrain_threshold: usize,
    pub min_feedback_samples: usize,
    pub min_class_fraction: f64,
    /// Extra weight on feedback rows whose outcome contradicts the shown decision.
    pub corrective_weight: f64,
    /// How far the candidate's holdout AUC may trail the incumbent's.
    pub retrain_tolerance: f64,
    pub training_timeout_secs: u64,
    pub merge_bulk_dataset: bool,
    pub bulk_dataset_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_threshold: 0.5,
            summary_size: DEFAULT_SUMMARY_SIZE,
            auto_retrain_threshold: 10,
            min_feedback_samples: 10,
            min_class_fraction: 0.1,
            corrective_weight: 2.0,
            retrain_tolerance: 0.02,
            training_timeout_secs: 600,
            merge_bulk_dataset: true,
            bulk_dataset_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            decision_threshold: env_parse("DECISION_THRESHOLD", defaults.decision_threshold),
            summary_size: env_parse("EXPLANATION_TOP_N", defaults.summary_size),
            auto_retrain_threshold: env_parse("AUTO_RETRAIN_THRESHOLD", defaults.auto_retrain_threshold),
            min_feedback_samples: env_parse("MIN_FEEDBACK_SAMPLES", defaults.min_feedback_samples),
            min_class_fraction: env_parse("MIN_CLASS_FRACTION", defaults.min_class_fraction),
            corrective_weight: env_parse("CORRECTIVE_WEIGHT", defaults.corrective_weight),
            retrain_tolerance: env_parse("RETRAIN_TOLERANCE", defaults.retrain_tolerance),
            training_timeout_secs: env_parse("TRAINING_TIMEOUT_SECS", defaults.training_timeout_secs),
            merge_bulk_dataset: env_parse("RETRAIN_MERGE_BULK", defaults.merge_bulk_dataset),
            bulk_dataset_path: env::var("BULK_DATASET_PATH").ok().map(PathBuf::from),
        }
    }

    pub fn log_config(&self) {
        info!("⚖️ Decision threshold: {:.3}", self.decision_threshold);
        info!("🔎 Explanation summary size: {}", self.summary_size);
        if self.auto_retrain_threshold > 0 {
            info!(
                "🔁 Automatic retraining after {} new feedback records",
                self.auto_retrain_threshold
            );
        } else {
            info!("🔁 Automatic retraining DISABLED");
        }
        info!(
            "   Feedback minimums: {} rows, {:.0}% per class; corrective weight {:.1}",
            self.min_feedback_samples,
            self.min_class_fraction * 100.0,
            self.corrective_weight
        );
        info!(
            "   Rollback tolerance: {:.3} AUC, training timeout {}s",
            self.retrain_tolerance, self.training_timeout_secs
        );
        match &self.bulk_dataset_path {
            Some(path) if self.merge_bulk_dataset => info!("   Bulk dataset merged into retraining: {}", path.display()),
            Some(path) => info!("   Bulk dataset (not merged into retraining): {}", path.display()),
            None => warn!("   No bulk dataset configured"),
        }
    }
}

impl TrainerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let strategies = match env::var("ENSEMBLE_STRATEGIES") {
            Ok(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| match Strategy::from_str(s) {
                    Ok(strategy) => Some(strategy),
                    Err(e) => {
                        warn!("{}; ignoring", e);
                        None
                    }
                })
                .collect(),
            Err(_) => defaults.strategies.clone(),
        };
        let mut split = defaults.split.clone();
        split.validation_fraction = env_parse("VALIDATION_FRACTION", split.validation_fraction);
        split.holdout_fraction = env_parse("HOLDOUT_FRACTION", split.holdout_fraction);
        split.min_split_rows = env_parse("MIN_SPLIT_ROWS", split.min_split_rows);

        Self {
            seed: env_parse("TRAINER_SEED", defaults.seed),
            split,
            strategies,
            stacking_folds: env_parse("STACKING_FOLDS", defaults.stacking_folds),
            blend_fraction: env_parse("BLEND_FRACTION", defaults.blend_fraction),
            calibration: env_parse::<CalibrationMethod>("CALIBRATION_METHOD", defaults.calibration),
            max_bins: env_parse("HISTOGRAM_MAX_BINS", defaults.max_bins),
            ..defaults
        }
    }

    pub fn log_config(&self) {
        let learners: Vec<&str> = self.learners.iter().map(|l| l.name.as_str()).collect();
        info!("🌲 Base learners: {}", learners.join(", "));
        if self.strategies.is_empty() {
            info!("🧩 Combiners DISABLED - single learners only");
        } else {
            info!("🧩 Combiners: {:?}", self.strategies);
        }
        info!(
            "   Seed {}, {} stacking folds, {:.0}% blend subset, {:?} calibration, {} bins",
            self.seed,
            self.stacking_folds,
            self.blend_fraction * 100.0,
            self.calibration,
            self.max_bins
        );
        info!(
            "   Splits: {:.0}% validation, {:.0}% holdout, at least {} rows each",
            self.split.validation_fraction * 100.0,
            self.split.holdout_fraction * 100.0,
            self.split.min_split_rows
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Filesystem,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "fs" | "filesystem" | "file" => Ok(StoreBackend::Filesystem),
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub models_dir: PathBuf,
    pub feedback_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Filesystem,
            models_dir: PathBuf::from("models"),
            feedback_path: PathBuf::from("data/feedback.jsonl"),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: env_parse("STORE_BACKEND", defaults.backend),
            models_dir: env::var("MODELS_DIR").map(PathBuf::from).unwrap_or(defaults.models_dir),
            feedback_path: env::var("FEEDBACK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.feedback_path),
        }
    }

    pub fn log_config(&self) {
        match self.backend {
            StoreBackend::Memory => warn!("💾 In-memory store: models and feedback are lost on exit"),
            StoreBackend::Filesystem => info!(
                "💾 Filesystem store: models in {}, feedback in {}",
                self.models_dir.display(),
                self.feedback_path.display()
            ),
            StoreBackend::Postgres => info!("💾 PostgreSQL store (schema credit_scoring)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let engine = EngineConfig::default();
        assert_eq!(engine.decision_threshold, 0.5);
        assert_eq!(engine.auto_retrain_threshold, 10);
        assert_eq!(engine.min_class_fraction, 0.1);
        assert_eq!(engine.retrain_tolerance, 0.02);
        let store = StoreConfig::default();
        assert_eq!(store.backend, StoreBackend::Filesystem);
        assert_eq!(store.feedback_path, PathBuf::from("data/feedback.jsonl"));
    }

    #[test]
    fn test_trainer_env_config() {
        env::set_var("ENSEMBLE_STRATEGIES", "blending, bogus, Voting");
        env::set_var("CALIBRATION_METHOD", "isotonic");
        env::set_var("STACKING_FOLDS", "not-a-number");

        let config = TrainerConfig::from_env();
        assert_eq!(config.strategies, vec![Strategy::Blending, Strategy::Voting]);
        assert_eq!(config.calibration, CalibrationMethod::Isotonic);
        assert_eq!(config.stacking_folds, 5);

        env::remove_var("ENSEMBLE_STRATEGIES");
        env::remove_var("CALIBRATION_METHOD");
        env::remove_var("STACKING_FOLDS");
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("PG".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!("fs".parse::<StoreBackend>(), Ok(StoreBackend::Filesystem));
        assert!("s3".parse::<StoreBackend>().is_err());
    }
}
