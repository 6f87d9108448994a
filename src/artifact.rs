// src/artifact.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::calibration::{decide, Calibrator, Decision};
use crate::dataset::{LabeledApplication, RowProvenance};
use crate::ensemble::{evaluate_scores, Ensemble, Metrics, TrainedModel, VariantReport};
use crate::errors::{EngineError, EngineResult};
use crate::features::{FeatureSchema, FeatureVector, RawApplication};

/// Everything needed to score, decide and explain, frozen at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Assigned by the registry at commit; 0 for an uncommitted candidate.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub schema: FeatureSchema,
    pub ensemble: Ensemble,
    pub calibrator: Calibrator,
    pub threshold: f64,
    pub validation: Metrics,
    pub holdout: Metrics,
    pub comparison: Vec<VariantReport>,
    pub training_rows: usize,
    /// Fingerprints of the rows this artifact was fitted on and held out from.
    #[serde(default)]
    pub provenance: RowProvenance,
}

/// Compact description of an artifact for listings and CLI output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub variant: String,
    pub schema_version: String,
    pub threshold: f64,
    pub validation: Metrics,
    pub holdout: Metrics,
    pub training_rows: usize,
}

/// One scored application under a specific artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub vector: FeatureVector,
    pub raw_score: f64,
    pub probability: f64,
}

impl ModelArtifact {
    pub fn from_trained(trained: TrainedModel, threshold: f64) -> Self {
        Self {
            version: 0,
            created_at: Utc::now(),
            schema: trained.schema,
            ensemble: trained.ensemble,
            calibrator: trained.calibrator,
            threshold,
            validation: trained.validation,
            holdout: trained.holdout,
            comparison: trained.comparison,
            training_rows: trained.training_rows,
            provenance: trained.provenance,
        }
    }

    pub fn score(&self, app: &RawApplication) -> EngineResult<Scored> {
        let vector = self.schema.prepare(app)?;
        let raw_score = self.ensemble.raw_score(&vector.values);
        Ok(Scored {
            probability: self.calibrator.apply(raw_score),
            raw_score,
            vector,
        })
    }

    /// Decision at the artifact's threshold unless the caller overrides it.
    pub fn decide(&self, probability: f64, threshold_override: Option<f64>) -> Decision {
        decide(probability, threshold_override.unwrap_or(self.threshold))
    }

    /// Metrics on labeled raw rows, each prepared with this artifact's own schema.
    pub fn evaluate(&self, rows: &[&LabeledApplication]) -> EngineResult<Metrics> {
        let mut raw = Vec::with_capacity(rows.len());
        let mut labels = Vec::with_capacity(rows.len());
        for row in rows {
            raw.push(self.score(&row.application)?.raw_score);
            labels.push(row.label);
        }
        Ok(evaluate_scores(&raw, &labels, &self.calibrator))
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            version: self.version,
            created_at: self.created_at,
            variant: self.ensemble.name.clone(),
            schema_version: self.schema.version.clone(),
            threshold: self.threshold,
            validation: self.validation,
            holdout: self.holdout,
            training_rows: self.training_rows,
        }
    }
}

/// Header stored next to the serialized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub schema_version: String,
    /// Hex SHA-256 of `bytes`.
    pub checksum: String,
}

/// The persisted form of an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBlob {
    pub meta: ArtifactMeta,
    pub bytes: Vec<u8>,
}

pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ArtifactBlob {
    pub fn seal(artifact: &ModelArtifact) -> EngineResult<Self> {
        let bytes = serde_json::to_vec(artifact)
            .map_err(|e| EngineError::Internal(format!("failed to serialize model v{}: {}", artifact.version, e)))?;
        Ok(Self {
            meta: ArtifactMeta {
                version: artifact.version,
                created_at: artifact.created_at,
                schema_version: artifact.schema.version.clone(),
                checksum: checksum(&bytes),
            },
            bytes,
        })
    }

    /// Verifies the checksum and deserializes the artifact.
    pub fn open(&self) -> EngineResult<ModelArtifact> {
        let actual = checksum(&self.bytes);
        if actual != self.meta.checksum {
            return Err(EngineError::Storage(anyhow::anyhow!(
                "checksum mismatch for model v{}: stored {}, computed {}",
                self.meta.version,
                self.meta.checksum,
                actual
            )));
        }
        let artifact: ModelArtifact = serde_json::from_slice(&self.bytes).map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("failed to deserialize model v{}: {}", self.meta.version, e))
        })?;
        if artifact.version != self.meta.version {
            return Err(EngineError::Storage(anyhow::anyhow!(
                "model header says v{} but payload is v{}",
                self.meta.version,
                artifact.version
            )));
        }
        Ok(artifact)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{labeled_rows, trained_artifact};
    use super::*;
    use crate::features::test_support::example_application;

    #[test]
    fn test_blob_round_trip_is_exact() {
        let artifact = trained_artifact(31);
        let blob = ArtifactBlob::seal(&artifact).unwrap();
        let reopened = blob.open().unwrap();
        assert_eq!(reopened, artifact);
        assert_eq!(ArtifactBlob::seal(&reopened).unwrap().bytes, blob.bytes);
        assert_eq!(blob.meta.schema_version, artifact.schema.version);
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let artifact = trained_artifact(32);
        let mut blob = ArtifactBlob::seal(&artifact).unwrap();
        let last = blob.bytes.len() - 2;
        blob.bytes[last] ^= 0x01;
        assert!(matches!(blob.open(), Err(EngineError::Storage(_))));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let artifact = trained_artifact(33);
        let a = artifact.score(&example_application()).unwrap();
        let b = artifact.score(&example_application()).unwrap();
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a.probability));
        assert_eq!(artifact.decide(a.probability, Some(0.0)), Decision::Deny);
        assert_eq!(artifact.decide(a.probability, Some(1.01)), Decision::Approve);
    }

    #[test]
    fn test_evaluate_on_fresh_rows() {
        let artifact = trained_artifact(34);
        let rows = labeled_rows(120, 99);
        let refs: Vec<&LabeledApplication> = rows.iter().collect();
        let metrics = artifact.evaluate(&refs).unwrap();
        assert_eq!(metrics.rows, 120);
        assert!(metrics.auc > 0.55, "AUC {}", metrics.auc);
    }
}
