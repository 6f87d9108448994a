// src/retrain.rs
//
// Feedback-driven retraining: Serving → RetrainTriggered → Validating →
// {Committed | RolledBack} → Serving. One run at a time, guarded by a permit that
// both the async driver and the blocking training thread hold.
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::artifact::ModelArtifact;
use crate::dataset::{balanced_class_weights, LabeledApplication, Split, TrainingDataset};
use crate::ensemble::{TrainedModel, Trainer, TrainerConfig};
use crate::errors::{EngineError, EngineResult};
use crate::feedback::{dedup_first, FeedbackRecord, FeedbackStats};
use crate::registry::ModelRegistry;
use crate::store::FeedbackStore;
use crate::utils::config::EngineConfig;
use crate::utils::progress::ProgressConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainPhase {
    Serving,
    RetrainTriggered,
    Validating,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainReport {
    /// Version of the committed candidate; `None` when it was rolled back.
    pub committed_version: Option<u64>,
    pub incumbent_version: Option<u64>,
    pub candidate_auc: f64,
    pub incumbent_auc: Option<f64>,
    /// Which rows both models were scored on.
    pub comparison: ComparisonSet,
    pub holdout_rows: usize,
    pub feedback_rows: usize,
    pub bulk_rows: usize,
    pub corrective_rows: usize,
    /// Candidate accuracy on the deduplicated feedback rows.
    pub accuracy_on_feedback: f64,
    pub duration_ms: u64,
}

/// Rows the candidate and the incumbent are compared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonSet {
    /// The incumbent's own holdout rows, carried into the candidate's holdout.
    IncumbentHoldout,
    /// Candidate holdout rows the incumbent was never fitted on.
    FreshHoldout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Retrained(RetrainReport),
    /// Not enough (or too unbalanced) data; the incumbent keeps serving.
    InsufficientData { reason: String, stats: FeedbackStats },
    /// The candidate regressed beyond tolerance; the incumbent keeps serving.
    RolledBack(RetrainReport),
}

/// Exclusive right to run one retraining cycle. Released when the last holder drops.
pub struct RetrainPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for RetrainPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Shared retraining state: the permit flag, the current phase, the count of
/// feedback records that arrived since the last run started and running totals
/// over the whole feedback log.
pub struct RetrainCoordinator {
    busy: Arc<AtomicBool>,
    phase: Mutex<RetrainPhase>,
    pending: AtomicUsize,
    stats: Mutex<FeedbackStats>,
}

impl Default for RetrainCoordinator {
    fn default() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            phase: Mutex::new(RetrainPhase::Serving),
            pending: AtomicUsize::new(0),
            stats: Mutex::new(FeedbackStats::default()),
        }
    }
}

impl RetrainCoordinator {
    pub fn try_acquire(&self) -> EngineResult<Arc<RetrainPermit>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::RetrainInProgress)?;
        Ok(Arc::new(RetrainPermit {
            busy: self.busy.clone(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> RetrainPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, to: RetrainPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!("Retrain phase {:?} -> {:?}", *phase, to);
        *phase = to;
    }

    /// Loads the totals of an existing log once, at startup.
    pub fn seed(&self, stats: FeedbackStats, pending: usize) {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = stats;
        self.pending.store(pending, Ordering::Release);
    }

    /// Counts one appended feedback record; returns the pending count and the totals.
    pub fn note_feedback(&self, record: &FeedbackRecord) -> (usize, FeedbackStats) {
        let stats = {
            let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.add(record);
            *stats
        };
        (self.pending.fetch_add(1, Ordering::AcqRel) + 1, stats)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn feedback_stats(&self) -> FeedbackStats {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Zeroes the pending count; records appended afterwards count toward the next run.
    fn take_pending(&self) -> usize {
        self.pending.swap(0, Ordering::AcqRel)
    }

    fn restore_pending(&self, count: usize) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }
}

/// Everything one run needs, detached from the engine so it can move into a task.
#[derive(Clone)]
pub struct RetrainContext {
    pub registry: Arc<ModelRegistry>,
    pub feedback: Arc<dyn FeedbackStore>,
    pub coordinator: Arc<RetrainCoordinator>,
    pub config: EngineConfig,
    pub trainer: TrainerConfig,
    pub progress: ProgressConfig,
    pub bulk: Option<Arc<Vec<LabeledApplication>>>,
}

/// Fails with `InsufficientFeedback` below the sample or class-balance minimums.
pub fn check_feedback(stats: &FeedbackStats, config: &EngineConfig) -> EngineResult<()> {
    if stats.total < config.min_feedback_samples {
        return Err(EngineError::InsufficientFeedback(format!(
            "{} feedback records, minimum is {}",
            stats.total, config.min_feedback_samples
        )));
    }
    if stats.minority_fraction() < config.min_class_fraction {
        return Err(EngineError::InsufficientFeedback(format!(
            "minority class is {:.1}% of feedback ({} defaults, {} repaid), minimum is {:.1}%",
            stats.minority_fraction() * 100.0,
            stats.defaults,
            stats.repaid,
            config.min_class_fraction * 100.0
        )));
    }
    Ok(())
}

/// Feedback rows (corrective ones up-weighted) plus the optional bulk rows, with
/// balanced class weights applied on top.
pub fn assemble_rows(
    records: &[FeedbackRecord],
    bulk: Option<&[LabeledApplication]>,
    config: &EngineConfig,
) -> Vec<LabeledApplication> {
    let mut rows: Vec<LabeledApplication> = Vec::with_capacity(records.len() + bulk.map_or(0, |b| b.len()));
    for record in records {
        if let Err(e) = record.application.validate() {
            warn!("⚠️ Skipping feedback {}: {}", record.id, e);
            continue;
        }
        let mut row = LabeledApplication::new(record.application.clone(), record.actual.label());
        if record.is_corrective() {
            row.weight *= config.corrective_weight;
        }
        rows.push(row);
    }
    if let Some(bulk) = bulk {
        rows.extend(bulk.iter().cloned());
    }

    let labels: Vec<u8> = rows.iter().map(|r| r.label).collect();
    let all: Vec<usize> = (0..rows.len()).collect();
    let class_weights = balanced_class_weights(&labels, &all);
    for row in rows.iter_mut() {
        row.weight *= class_weights[row.label as usize];
    }
    rows
}

/// Fits on a blocking thread under `timeout_secs`. On timeout the cancellation flag
/// is raised and the worker keeps `permit` until it notices and returns.
pub async fn train_blocking(
    config: TrainerConfig,
    progress: ProgressConfig,
    dataset: Arc<TrainingDataset>,
    timeout_secs: u64,
    permit: Arc<RetrainPermit>,
    operation: &'static str,
) -> EngineResult<TrainedModel> {
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let mut trainer = Trainer::new(&config).with_cancel(&worker_cancel);
        if let Some(bar) = progress.training_bar(trainer.planned_fits()) {
            trainer = trainer.with_progress(bar);
        }
        trainer.fit(&dataset)
    });

    match tokio::time::timeout(Duration::from_secs(timeout_secs), handle).await {
        Err(_) => {
            cancel.store(true, Ordering::Release);
            error!("⏱️ {} exceeded {}s; training cancelled, nothing committed", operation, timeout_secs);
            Err(EngineError::Timeout {
                operation,
                seconds: timeout_secs,
            })
        }
        Ok(Err(join_error)) => Err(EngineError::Internal(format!("training task failed: {}", join_error))),
        Ok(Ok(result)) => result,
    }
}

/// Splits retraining rows around the incumbent: rows it was fitted on stay out of
/// the holdout and its holdout rows stay in, so the comparison is fair to both.
pub fn candidate_dataset(
    rows: Vec<LabeledApplication>,
    trainer: &TrainerConfig,
    incumbent: Option<&ModelArtifact>,
) -> TrainingDataset {
    match incumbent {
        Some(inc) => TrainingDataset::split_pinned(rows, &trainer.split, trainer.seed, &inc.provenance),
        None => TrainingDataset::split(rows, &trainer.split, trainer.seed),
    }
}

/// The incumbent's own holdout when enough of it (with both classes) made it into
/// this dataset, else the whole candidate holdout.
pub fn comparison_rows<'a>(
    dataset: &'a TrainingDataset,
    incumbent: Option<&ModelArtifact>,
    min_rows: usize,
) -> (Vec<&'a LabeledApplication>, ComparisonSet) {
    let holdout = dataset.rows_in(Split::Holdout);
    let Some(inc) = incumbent else {
        return (holdout, ComparisonSet::FreshHoldout);
    };
    if inc.provenance.is_empty() {
        warn!(
            "⚠️ Model v{} carries no row provenance; comparing on the new holdout, which may include rows it was fitted on",
            inc.version
        );
        return (holdout, ComparisonSet::FreshHoldout);
    }
    let pinned: Vec<&LabeledApplication> = holdout
        .iter()
        .copied()
        .filter(|row| inc.provenance.was_held_out(row.application.fingerprint()))
        .collect();
    let defaults = pinned.iter().filter(|row| row.label == 1).count();
    if pinned.len() >= min_rows && defaults > 0 && defaults < pinned.len() {
        (pinned, ComparisonSet::IncumbentHoldout)
    } else {
        debug!(
            "Only {} rows of the v{} holdout present; comparing on the fresh holdout",
            pinned.len(),
            inc.version
        );
        (holdout, ComparisonSet::FreshHoldout)
    }
}

fn insufficient(reason: String, stats: FeedbackStats) -> RetrainOutcome {
    info!("📉 Retraining declined: {}", reason);
    RetrainOutcome::InsufficientData { reason, stats }
}

/// Runs one full cycle. The caller must already hold `permit`.
pub async fn run(ctx: RetrainContext, permit: Arc<RetrainPermit>) -> EngineResult<RetrainOutcome> {
    let started = Instant::now();
    let coordinator = ctx.coordinator.clone();
    coordinator.transition(RetrainPhase::RetrainTriggered);
    let result = run_inner(&ctx, permit, started).await;
    let next = match &result {
        Ok(RetrainOutcome::Retrained(_)) => RetrainPhase::Committed,
        Ok(RetrainOutcome::RolledBack(_)) => RetrainPhase::RolledBack,
        _ => RetrainPhase::Serving,
    };
    coordinator.transition(next);
    coordinator.transition(RetrainPhase::Serving);
    result
}

async fn run_inner(ctx: &RetrainContext, permit: Arc<RetrainPermit>, started: Instant) -> EngineResult<RetrainOutcome> {
    // Reset before the snapshot: a record appended while listing counts toward the
    // next cycle even if the listing already includes it.
    let carried = ctx.coordinator.take_pending();
    let snapshot = match ctx.feedback.list().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            ctx.coordinator.restore_pending(carried);
            return Err(e.into());
        }
    };
    let raw_count = snapshot.len();
    let records = dedup_first(snapshot);
    if records.len() < raw_count {
        info!("🧹 Dropped {} duplicate feedback submissions", raw_count - records.len());
    }
    let stats = FeedbackStats::from_records(&records);
    info!(
        "🔁 Retraining on {} feedback records ({} defaults, {} repaid, {} corrective)",
        stats.total, stats.defaults, stats.repaid, stats.corrective
    );
    if let Err(e) = check_feedback(&stats, &ctx.config) {
        return Ok(insufficient(e.to_string(), stats));
    }

    let bulk = if ctx.config.merge_bulk_dataset {
        ctx.bulk.clone()
    } else {
        None
    };
    let bulk_rows = bulk.as_ref().map_or(0, |b| b.len());
    let rows = assemble_rows(&records, bulk.as_deref().map(|b| b.as_slice()), &ctx.config);
    // No commit or rollback can happen while this run holds the permit.
    let incumbent = ctx.registry.current();
    let dataset = Arc::new(candidate_dataset(rows, &ctx.trainer, incumbent.as_deref()));

    let trained = match train_blocking(
        ctx.trainer.clone(),
        ctx.progress.clone(),
        dataset.clone(),
        ctx.config.training_timeout_secs,
        permit.clone(),
        "retrain",
    )
    .await
    {
        Err(EngineError::InsufficientData(reason)) => return Ok(insufficient(reason, stats)),
        result => result?,
    };

    ctx.coordinator.transition(RetrainPhase::Validating);
    let candidate = ModelArtifact::from_trained(trained, ctx.config.decision_threshold);
    let (holdout, comparison) = comparison_rows(&dataset, incumbent.as_deref(), ctx.trainer.split.min_split_rows);
    let candidate_metrics = candidate.evaluate(&holdout)?;
    let incumbent_auc = match &incumbent {
        Some(inc) => Some(inc.evaluate(&holdout)?.auc),
        None => None,
    };

    let feedback_rows: Vec<LabeledApplication> = records
        .iter()
        .filter(|r| r.application.validate().is_ok())
        .map(|r| LabeledApplication::new(r.application.clone(), r.actual.label()))
        .collect();
    let feedback_refs: Vec<&LabeledApplication> = feedback_rows.iter().collect();
    let accuracy_on_feedback = candidate.evaluate(&feedback_refs)?.accuracy;

    let mut report = RetrainReport {
        committed_version: None,
        incumbent_version: incumbent.as_ref().map(|i| i.version),
        candidate_auc: candidate_metrics.auc,
        incumbent_auc,
        comparison,
        holdout_rows: holdout.len(),
        feedback_rows: feedback_rows.len(),
        bulk_rows,
        corrective_rows: stats.corrective,
        accuracy_on_feedback,
        duration_ms: 0,
    };

    if let Some(inc_auc) = incumbent_auc {
        if candidate_metrics.auc < inc_auc - ctx.config.retrain_tolerance {
            report.duration_ms = started.elapsed().as_millis() as u64;
            warn!(
                "↩️ Candidate rolled back: AUC {:.4} vs incumbent v{} {:.4} on {} {:?} rows (tolerance {:.3})",
                candidate_metrics.auc,
                report.incumbent_version.unwrap_or_default(),
                inc_auc,
                report.holdout_rows,
                comparison,
                ctx.config.retrain_tolerance
            );
            return Ok(RetrainOutcome::RolledBack(report));
        }
    }

    let committed = ctx.registry.commit(candidate).await?;
    report.committed_version = Some(committed.version);
    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "🚀 Retrained model v{} committed (holdout AUC {:.4}, accuracy on feedback {:.3})",
        committed.version, report.candidate_auc, report.accuracy_on_feedback
    );
    Ok(RetrainOutcome::Retrained(report))
}
