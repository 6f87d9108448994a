// src/engine.rs
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::artifact::{ArtifactMeta, ArtifactSummary, ModelArtifact};
use crate::calibration::Decision;
use crate::dataset::{load_csv, LabeledApplication, TrainingDataset};
use crate::ensemble::{TrainerConfig, VariantReport};
use crate::errors::{EngineError, EngineResult};
use crate::explain::{explain, Explanation};
use crate::features::RawApplication;
use crate::feedback::{FeedbackAck, FeedbackRecord, FeedbackStats, Outcome};
use crate::registry::ModelRegistry;
use crate::retrain::{self, RetrainContext, RetrainCoordinator, RetrainOutcome, RetrainPhase};
use crate::store::{FeedbackStore, Stores};
use crate::utils::config::EngineConfig;
use crate::utils::progress::ProgressConfig;

/// What a caller is shown for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub raw_score: f64,
    pub probability_default: f64,
    pub decision: Decision,
    pub model_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainedPrediction {
    pub prediction: Prediction,
    pub explanation: Explanation,
}

/// The scoring engine: serving reads, training, feedback and retraining.
///
/// Scoring calls only read the registry's current artifact; everything that
/// replaces it goes through the retrain permit so at most one training run is
/// ever in flight.
pub struct ScoringEngine {
    config: EngineConfig,
    trainer: TrainerConfig,
    progress: ProgressConfig,
    registry: Arc<ModelRegistry>,
    feedback: Arc<dyn FeedbackStore>,
    coordinator: Arc<RetrainCoordinator>,
    bulk: RwLock<Option<Arc<Vec<LabeledApplication>>>>,
}

impl ScoringEngine {
    pub fn new(config: EngineConfig, trainer: TrainerConfig, progress: ProgressConfig, stores: Stores) -> Self {
        Self {
            config,
            trainer,
            progress,
            registry: Arc::new(ModelRegistry::new(stores.artifacts)),
            feedback: stores.feedback,
            coordinator: Arc::new(RetrainCoordinator::default()),
            bulk: RwLock::new(None),
        }
    }

    /// Builds the engine, serves the active persisted model, reads the feedback log
    /// once for its running totals and loads the configured bulk dataset.
    pub async fn start(
        config: EngineConfig,
        trainer: TrainerConfig,
        progress: ProgressConfig,
        stores: Stores,
    ) -> EngineResult<Self> {
        let engine = Self::new(config, trainer, progress, stores);
        engine.registry.restore().await?;
        engine.seed_feedback_totals().await?;
        if let Some(path) = engine.config.bulk_dataset_path.clone() {
            match engine.load_bulk_dataset(&path).await {
                Ok(rows) => debug!("Bulk dataset ready with {} rows", rows),
                Err(e) => warn!("⚠️ Could not load bulk dataset {}: {}", path.display(), e),
            }
        }
        Ok(engine)
    }

    /// Records newer than the serving model count as pending.
    async fn seed_feedback_totals(&self) -> EngineResult<()> {
        let records = self.feedback.list().await?;
        let stats = FeedbackStats::from_records(&records);
        let pending = match self.registry.current() {
            Some(serving) => records.iter().filter(|r| r.recorded_at > serving.created_at).count(),
            None => records.len(),
        };
        if stats.total > 0 {
            info!(
                "📒 Feedback log holds {} records ({} corrective), {} pending",
                stats.total, stats.corrective, pending
            );
        }
        self.coordinator.seed(stats, pending);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn current(&self) -> EngineResult<Arc<ModelArtifact>> {
        self.registry.current().ok_or(EngineError::ModelNotTrained)
    }

    pub fn current_summary(&self) -> Option<ArtifactSummary> {
        self.registry.current().map(|a| a.summary())
    }

    pub fn retrain_phase(&self) -> RetrainPhase {
        self.coordinator.phase()
    }

    pub fn retrain_running(&self) -> bool {
        self.coordinator.is_running()
    }

    pub fn feedback_stats(&self) -> FeedbackStats {
        self.coordinator.feedback_stats()
    }

    pub fn predict(&self, application: &RawApplication) -> EngineResult<Prediction> {
        self.predict_with_threshold(application, None)
    }

    /// Scores with an optional serving-time threshold in place of the artifact's.
    pub fn predict_with_threshold(
        &self,
        application: &RawApplication,
        threshold: Option<f64>,
    ) -> EngineResult<Prediction> {
        let artifact = self.current()?;
        let scored = artifact.score(application)?;
        Ok(Prediction {
            raw_score: scored.raw_score,
            probability_default: scored.probability,
            decision: artifact.decide(scored.probability, threshold),
            model_version: artifact.version,
        })
    }

    /// Prediction plus its attribution, both from the same artifact snapshot.
    pub fn explain(&self, application: &RawApplication) -> EngineResult<ExplainedPrediction> {
        let artifact = self.current()?;
        let scored = artifact.score(application)?;
        let explanation = explain(&scored.vector, &artifact, self.config.summary_size)?;
        Ok(ExplainedPrediction {
            prediction: Prediction {
                raw_score: scored.raw_score,
                probability_default: scored.probability,
                decision: artifact.decide(scored.probability, None),
                model_version: artifact.version,
            },
            explanation,
        })
    }

    pub fn compare_models(&self) -> EngineResult<Vec<VariantReport>> {
        Ok(self.current()?.comparison.clone())
    }

    pub fn set_bulk_dataset(&self, rows: Vec<LabeledApplication>) {
        let mut guard = self.bulk.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(Arc::new(rows));
    }

    fn bulk_dataset(&self) -> Option<Arc<Vec<LabeledApplication>>> {
        self.bulk.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Loads the bulk CSV off the async runtime; returns the number of usable rows.
    pub async fn load_bulk_dataset(&self, path: &Path) -> EngineResult<usize> {
        let owned = path.to_path_buf();
        let (rows, skipped) = tokio::task::spawn_blocking(move || load_csv(&owned))
            .await
            .map_err(|e| EngineError::Internal(format!("dataset loader failed: {}", e)))??;
        if rows.is_empty() {
            return Err(EngineError::InsufficientData(format!(
                "{} has no usable rows ({} skipped)",
                path.display(),
                skipped
            )));
        }
        let count = rows.len();
        self.set_bulk_dataset(rows);
        Ok(count)
    }

    /// Trains on the bulk dataset and commits the result unconditionally.
    pub async fn train_final(&self, config: Option<TrainerConfig>) -> EngineResult<ArtifactSummary> {
        let permit = self.coordinator.try_acquire()?;
        let rows = self
            .bulk_dataset()
            .ok_or_else(|| EngineError::InsufficientData("no bulk dataset loaded".into()))?;
        let config = config.unwrap_or_else(|| self.trainer.clone());
        config.log_config();
        let dataset = Arc::new(TrainingDataset::split(rows.as_ref().clone(), &config.split, config.seed));
        let trained = retrain::train_blocking(
            config,
            self.progress.clone(),
            dataset,
            self.config.training_timeout_secs,
            permit.clone(),
            "train_final",
        )
        .await?;
        let artifact = ModelArtifact::from_trained(trained, self.config.decision_threshold);
        let committed = self.registry.commit(artifact).await?;
        drop(permit);
        Ok(committed.summary())
    }

    fn retrain_context(&self) -> RetrainContext {
        RetrainContext {
            registry: self.registry.clone(),
            feedback: self.feedback.clone(),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            trainer: self.trainer.clone(),
            progress: self.progress.clone(),
            bulk: self.bulk_dataset(),
        }
    }

    /// Runs one retraining cycle now; `RetrainInProgress` if one is already active.
    pub async fn retrain(&self) -> EngineResult<RetrainOutcome> {
        let permit = self.coordinator.try_acquire()?;
        retrain::run(self.retrain_context(), permit).await
    }

    /// Appends a reviewer outcome and, past the configured count of new records,
    /// starts a background retraining run.
    pub async fn record_feedback(
        &self,
        application: RawApplication,
        shown: Prediction,
        actual: Outcome,
    ) -> EngineResult<FeedbackAck> {
        application.validate()?;
        let record = FeedbackRecord::new(application, shown, actual);
        self.feedback.append(&record).await?;
        let (pending, stats) = self.coordinator.note_feedback(&record);
        if record.is_corrective() {
            info!(
                "📝 Corrective feedback {}: shown {}, actual {:?} ({} corrective so far)",
                record.id, record.shown.decision, record.actual, stats.corrective
            );
        } else {
            debug!("Feedback {} recorded ({} pending)", record.id, pending);
        }

        let threshold = self.config.auto_retrain_threshold;
        let mut retrain_triggered = false;
        if threshold > 0 && pending >= threshold {
            match self.coordinator.try_acquire() {
                Ok(permit) => {
                    info!("🔁 {} new feedback records; starting background retraining", pending);
                    let ctx = self.retrain_context();
                    tokio::spawn(async move {
                        match retrain::run(ctx, permit).await {
                            Ok(outcome) => debug!("Background retraining finished: {:?}", outcome),
                            Err(e) => error!("❌ Background retraining failed: {}", e),
                        }
                    });
                    retrain_triggered = true;
                }
                Err(_) => debug!("Retraining already running; {} records wait for the next cycle", pending),
            }
        }

        Ok(FeedbackAck {
            id: record.id,
            corrective: record.is_corrective(),
            stats,
            pending,
            retrain_triggered,
        })
    }

    pub async fn rollback(&self) -> EngineResult<ArtifactSummary> {
        let _permit = self.coordinator.try_acquire()?;
        Ok(self.registry.rollback().await?.summary())
    }

    pub async fn versions(&self) -> EngineResult<Vec<ArtifactMeta>> {
        self.registry.versions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::labeled_rows;
    use crate::ensemble::test_support::small_trainer_config;
    use crate::features::test_support::example_application;
    use crate::retrain::ComparisonSet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine_with(config: EngineConfig, seed: u64) -> ScoringEngine {
        let progress = ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        };
        let engine = ScoringEngine::new(config, small_trainer_config(seed), progress, Stores::in_memory());
        engine.set_bulk_dataset(labeled_rows(300, seed));
        engine
    }

    fn manual_config() -> EngineConfig {
        EngineConfig {
            auto_retrain_threshold: 0,
            ..EngineConfig::default()
        }
    }

    fn opposite(decision: Decision) -> Outcome {
        match decision {
            Decision::Approve => Outcome::Default,
            Decision::Deny => Outcome::Repaid,
        }
    }

    #[tokio::test]
    async fn test_untrained_engine_refuses_to_score() {
        let engine = engine_with(manual_config(), 3);
        let app = example_application();
        assert!(matches!(engine.predict(&app), Err(EngineError::ModelNotTrained)));
        assert!(matches!(engine.explain(&app), Err(EngineError::ModelNotTrained)));
        assert!(matches!(engine.compare_models(), Err(EngineError::ModelNotTrained)));

        let empty = ScoringEngine::new(manual_config(), small_trainer_config(3), ProgressConfig::default(), Stores::in_memory());
        assert!(matches!(empty.train_final(None).await, Err(EngineError::InsufficientData(_))));
    }

    #[tokio::test]
    async fn test_example_prediction_is_deterministic_and_explained() {
        let first = engine_with(manual_config(), 11);
        let second = engine_with(manual_config(), 11);
        let summary = first.train_final(None).await.unwrap();
        second.train_final(None).await.unwrap();
        assert_eq!(summary.version, 1);

        let app = example_application();
        let a = first.predict(&app).unwrap();
        let b = second.predict(&app).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, first.predict(&app).unwrap());
        assert!((0.0..=1.0).contains(&a.probability_default));
        assert_eq!(a.decision, crate::calibration::decide(a.probability_default, 0.5));

        let explained = first.explain(&app).unwrap();
        assert_eq!(explained.prediction, a);
        let e = &explained.explanation;
        let gap = e.raw_score - e.baseline;
        assert!((e.attribute_total() - gap).abs() <= 1e-6 * gap.abs().max(1.0));
        assert!(e.summary.len() <= 5);

        let table = first.compare_models().unwrap();
        assert_eq!(table.iter().filter(|r| r.selected).count(), 1);
    }

    #[tokio::test]
    async fn test_threshold_override_changes_only_the_decision() {
        let engine = engine_with(manual_config(), 13);
        engine.train_final(None).await.unwrap();
        let app = example_application();
        let strict = engine.predict_with_threshold(&app, Some(0.0)).unwrap();
        let lenient = engine.predict_with_threshold(&app, Some(1.01)).unwrap();
        assert_eq!(strict.probability_default, lenient.probability_default);
        assert_eq!(strict.decision, Decision::Deny);
        assert_eq!(lenient.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_corrective_feedback_then_insufficient_retrain() {
        let engine = engine_with(manual_config(), 17);
        engine.train_final(None).await.unwrap();
        let app = example_application();
        let shown = engine.predict(&app).unwrap();

        let ack = engine
            .record_feedback(app, shown.clone(), opposite(shown.decision))
            .await
            .unwrap();
        assert!(ack.corrective);
        assert_eq!(ack.stats.corrective, 1);
        assert_eq!(ack.pending, 1);
        assert!(!ack.retrain_triggered);

        let outcome = engine.retrain().await.unwrap();
        assert!(matches!(outcome, RetrainOutcome::InsufficientData { .. }));
        assert_eq!(engine.current_summary().map(|s| s.version), Some(1));
        assert_eq!(engine.retrain_phase(), RetrainPhase::Serving);
    }

    #[tokio::test]
    async fn test_invalid_feedback_is_rejected() {
        let engine = engine_with(manual_config(), 19);
        let mut app = example_application();
        app.loan_grade = None;
        let shown = Prediction {
            raw_score: 0.0,
            probability_default: 0.3,
            decision: Decision::Approve,
            model_version: 1,
        };
        assert!(matches!(
            engine.record_feedback(app, shown, Outcome::Repaid).await,
            Err(EngineError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_running() {
        let engine = engine_with(manual_config(), 23);
        let held = engine.coordinator.try_acquire().unwrap();
        assert!(matches!(engine.retrain().await, Err(EngineError::RetrainInProgress)));
        assert!(matches!(engine.train_final(None).await, Err(EngineError::RetrainInProgress)));
        drop(held);
        assert!(matches!(engine.retrain().await, Ok(RetrainOutcome::InsufficientData { .. })));
    }

    async fn feed(engine: &ScoringEngine, n: usize, seed: u64) {
        for row in labeled_rows(n, seed) {
            let shown = engine.predict(&row.application).unwrap();
            engine
                .record_feedback(row.application, shown, Outcome::from_label(row.label).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_candidate_trained_on_flipped_outcomes_is_rolled_back() {
        // Default tolerance; the bulk rows are merged in.
        let engine = engine_with(manual_config(), 29);
        engine.train_final(None).await.unwrap();
        for row in labeled_rows(400, 30) {
            let shown = engine.predict(&row.application).unwrap();
            let flipped = Outcome::from_label(1 - row.label).unwrap();
            engine.record_feedback(row.application, shown, flipped).await.unwrap();
        }

        match engine.retrain().await.unwrap() {
            RetrainOutcome::RolledBack(report) => {
                assert_eq!(report.committed_version, None);
                assert_eq!(report.incumbent_version, Some(1));
                assert_eq!(report.comparison, ComparisonSet::IncumbentHoldout);
                assert!(report.candidate_auc < report.incumbent_auc.unwrap() - 0.02);
                assert_eq!(report.feedback_rows, 400);
                assert_eq!(report.bulk_rows, 300);
            }
            other => panic!("expected a rollback, got {:?}", other),
        }
        assert_eq!(engine.current_summary().map(|s| s.version), Some(1));
        assert_eq!(engine.versions().await.unwrap().len(), 1);
        assert_eq!(engine.retrain_phase(), RetrainPhase::Serving);
    }

    #[tokio::test]
    async fn test_concurrent_retrains_admit_exactly_one() {
        let engine = engine_with(manual_config(), 31);
        engine.train_final(None).await.unwrap();
        feed(&engine, 60, 32).await;

        let (first, second) = tokio::join!(engine.retrain(), engine.retrain());
        let results = [first, second];
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::RetrainInProgress)))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(!engine.retrain_running());
    }

    fn shared(stores: &Stores) -> Stores {
        Stores {
            artifacts: stores.artifacts.clone(),
            feedback: stores.feedback.clone(),
        }
    }

    fn quiet() -> ProgressConfig {
        ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        }
    }

    #[tokio::test]
    async fn test_timed_out_retrain_leaves_registry_untouched() {
        let stores = Stores::in_memory();
        let trained = ScoringEngine::start(manual_config(), small_trainer_config(33), quiet(), shared(&stores))
            .await
            .unwrap();
        trained.set_bulk_dataset(labeled_rows(300, 33));
        trained.train_final(None).await.unwrap();

        let config = EngineConfig {
            training_timeout_secs: 0,
            ..manual_config()
        };
        let engine = ScoringEngine::start(config, small_trainer_config(33), quiet(), shared(&stores))
            .await
            .unwrap();
        engine.set_bulk_dataset(labeled_rows(300, 33));
        assert_eq!(engine.current_summary().map(|s| s.version), Some(1));
        feed(&engine, 60, 34).await;

        match engine.retrain().await {
            Err(e @ EngineError::Timeout { .. }) => assert!(e.is_retryable()),
            other => panic!("expected a timeout, got {:?}", other),
        }
        for _ in 0..400 {
            if !engine.retrain_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert!(!engine.retrain_running());
        assert_eq!(engine.current_summary().map(|s| s.version), Some(1));
        assert_eq!(engine.versions().await.unwrap().len(), 1);
        assert_eq!(engine.retrain_phase(), RetrainPhase::Serving);
    }

    /// Counts full reads of the feedback log.
    #[derive(Default)]
    struct CountingFeedback {
        inner: crate::store::memory::MemoryFeedbackStore,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl FeedbackStore for CountingFeedback {
        async fn append(&self, record: &FeedbackRecord) -> anyhow::Result<()> {
            self.inner.append(record).await
        }

        async fn list(&self) -> anyhow::Result<Vec<FeedbackRecord>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list().await
        }
    }

    fn shown(decision: Decision) -> Prediction {
        Prediction {
            raw_score: 0.0,
            probability_default: 0.4,
            decision,
            model_version: 1,
        }
    }

    #[tokio::test]
    async fn test_feedback_totals_are_seeded_once_and_kept_incrementally() {
        let log = Arc::new(CountingFeedback::default());
        for row in labeled_rows(4, 35) {
            let actual = Outcome::from_label(row.label).unwrap();
            log.append(&FeedbackRecord::new(row.application, shown(Decision::Approve), actual))
                .await
                .unwrap();
        }
        let seeded = FeedbackStats::from_records(&log.inner.list().await.unwrap());
        let stores = Stores {
            artifacts: Arc::new(crate::store::memory::MemoryArtifactStore::default()),
            feedback: log.clone(),
        };
        let engine = ScoringEngine::start(manual_config(), small_trainer_config(35), quiet(), stores)
            .await
            .unwrap();
        assert_eq!(engine.feedback_stats(), seeded);
        assert_eq!(engine.coordinator.pending(), 4);

        let mut last = None;
        for row in labeled_rows(50, 36) {
            let ack = engine
                .record_feedback(row.application, shown(Decision::Deny), Outcome::Repaid)
                .await
                .unwrap();
            last = Some(ack);
        }
        let ack = last.unwrap();
        assert_eq!(log.lists.load(Ordering::SeqCst), 1);
        assert_eq!(ack.pending, 54);
        assert_eq!(ack.stats.total, 54);
        assert_eq!(ack.stats.corrective, seeded.corrective + 50);
        assert_eq!(ack.stats, FeedbackStats::from_records(&log.inner.list().await.unwrap()));
    }

    #[tokio::test]
    async fn test_accepted_candidate_is_committed_and_can_be_rolled_back() {
        let config = EngineConfig {
            retrain_tolerance: 1.0,
            ..manual_config()
        };
        let engine = engine_with(config, 37);
        engine.train_final(None).await.unwrap();
        feed(&engine, 60, 38).await;

        match engine.retrain().await.unwrap() {
            RetrainOutcome::Retrained(report) => {
                assert_eq!(report.committed_version, Some(2));
                assert!((0.0..=1.0).contains(&report.accuracy_on_feedback));
            }
            other => panic!("expected a commit, got {:?}", other),
        }
        assert_eq!(engine.predict(&example_application()).unwrap().model_version, 2);

        let restored = engine.rollback().await.unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(engine.predict(&example_application()).unwrap().model_version, 1);
    }

    #[tokio::test]
    async fn test_rollback_survives_restart() {
        let stores = Stores::in_memory();
        let config = EngineConfig {
            retrain_tolerance: 1.0,
            ..manual_config()
        };
        let engine = ScoringEngine::start(config.clone(), small_trainer_config(39), quiet(), shared(&stores))
            .await
            .unwrap();
        engine.set_bulk_dataset(labeled_rows(300, 39));
        engine.train_final(None).await.unwrap();
        feed(&engine, 60, 40).await;
        assert!(matches!(engine.retrain().await.unwrap(), RetrainOutcome::Retrained(_)));
        assert_eq!(engine.rollback().await.unwrap().version, 1);

        let restarted = ScoringEngine::start(config, small_trainer_config(39), quiet(), shared(&stores))
            .await
            .unwrap();
        assert_eq!(restarted.current_summary().map(|s| s.version), Some(1));
        assert_eq!(restarted.versions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_feedback_threshold_triggers_background_retrain() {
        let config = EngineConfig {
            auto_retrain_threshold: 3,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, 41);
        engine.train_final(None).await.unwrap();
        let mut acks = Vec::new();
        for row in labeled_rows(3, 42) {
            let shown = engine.predict(&row.application).unwrap();
            acks.push(
                engine
                    .record_feedback(row.application, shown, Outcome::from_label(row.label).unwrap())
                    .await
                    .unwrap(),
            );
        }
        assert!(!acks[1].retrain_triggered);
        assert!(acks[2].retrain_triggered);
    }
}
