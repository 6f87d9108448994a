// src/feedback.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::engine::Prediction;
use crate::features::RawApplication;

/// What actually happened to the loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Repaid,
    Default,
}

impl Outcome {
    pub fn label(&self) -> u8 {
        match self {
            Outcome::Repaid => 0,
            Outcome::Default => 1,
        }
    }

    pub fn from_label(label: u8) -> Option<Self> {
        match label {
            0 => Some(Outcome::Repaid),
            1 => Some(Outcome::Default),
            _ => None,
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "repaid" | "0" => Ok(Outcome::Repaid),
            "default" | "defaulted" | "1" => Ok(Outcome::Default),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// One reviewer-supplied outcome. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub application: RawApplication,
    pub shown: Prediction,
    pub actual: Outcome,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(application: RawApplication, shown: Prediction, actual: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            application,
            shown,
            actual,
            recorded_at: Utc::now(),
        }
    }

    /// The shown decision bet on the other outcome.
    pub fn is_corrective(&self) -> bool {
        self.shown.decision.predicted_label() != self.actual.label()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub defaults: usize,
    pub repaid: usize,
    pub corrective: usize,
}

impl FeedbackStats {
    pub fn from_records(records: &[FeedbackRecord]) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.add(record);
        }
        stats
    }

    pub fn add(&mut self, record: &FeedbackRecord) {
        self.total += 1;
        match record.actual {
            Outcome::Default => self.defaults += 1,
            Outcome::Repaid => self.repaid += 1,
        }
        if record.is_corrective() {
            self.corrective += 1;
        }
    }

    /// Share of the rarer class; 0 for an empty log.
    pub fn minority_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.defaults.min(self.repaid) as f64 / self.total as f64
    }
}

/// Returned to the caller of `record_feedback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAck {
    pub id: Uuid,
    pub corrective: bool,
    pub stats: FeedbackStats,
    /// Records appended since the last retraining run started.
    pub pending: usize,
    pub retrain_triggered: bool,
}

/// Drops repeated submissions of the same application: the first record in log
/// order is kept, later resubmissions are ignored.
pub fn dedup_first(records: Vec<FeedbackRecord>) -> Vec<FeedbackRecord> {
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.application.dedup_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Decision;
    use crate::features::test_support::example_application;
    use chrono::Duration;

    fn shown(decision: Decision) -> Prediction {
        Prediction {
            raw_score: 0.0,
            probability_default: if decision == Decision::Deny { 0.8 } else { 0.2 },
            decision,
            model_version: 1,
        }
    }

    #[test]
    fn test_corrective_when_outcome_contradicts_decision() {
        let app = example_application();
        assert!(FeedbackRecord::new(app.clone(), shown(Decision::Approve), Outcome::Default).is_corrective());
        assert!(FeedbackRecord::new(app.clone(), shown(Decision::Deny), Outcome::Repaid).is_corrective());
        assert!(!FeedbackRecord::new(app, shown(Decision::Deny), Outcome::Default).is_corrective());
    }

    #[test]
    fn test_stats_count_classes_and_corrections() {
        let app = example_application();
        let records = vec![
            FeedbackRecord::new(app.clone(), shown(Decision::Approve), Outcome::Default),
            FeedbackRecord::new(app.clone(), shown(Decision::Approve), Outcome::Repaid),
            FeedbackRecord::new(app, shown(Decision::Approve), Outcome::Repaid),
        ];
        let stats = FeedbackStats::from_records(&records);
        assert_eq!(
            stats,
            FeedbackStats {
                total: 3,
                defaults: 1,
                repaid: 2,
                corrective: 1
            }
        );
        assert!((stats.minority_fraction() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_dedup_keeps_first_submission() {
        let app = example_application();
        let mut other = example_application();
        other.person_age = Some(50.0);

        let first = FeedbackRecord::new(app.clone(), shown(Decision::Approve), Outcome::Repaid);
        let second = FeedbackRecord::new(other, shown(Decision::Approve), Outcome::Repaid);
        let mut third = FeedbackRecord::new(app, shown(Decision::Approve), Outcome::Default);
        third.recorded_at = first.recorded_at + Duration::minutes(5);

        let kept = dedup_first(vec![first.clone(), second.clone(), third]);
        assert_eq!(kept, vec![first, second]);
        assert!("defaulted".parse::<Outcome>().is_ok());
        assert_eq!(Outcome::from_label(2), None);
    }

    #[test]
    fn test_incremental_stats_match_full_recount() {
        let app = example_application();
        let records = vec![
            FeedbackRecord::new(app.clone(), shown(Decision::Deny), Outcome::Repaid),
            FeedbackRecord::new(app.clone(), shown(Decision::Deny), Outcome::Default),
            FeedbackRecord::new(app, shown(Decision::Approve), Outcome::Repaid),
        ];
        let mut running = FeedbackStats::default();
        for record in &records {
            running.add(record);
        }
        assert_eq!(running, FeedbackStats::from_records(&records));
        assert_eq!(running.corrective, 1);
    }
}
