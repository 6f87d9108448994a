// src/explain/mod.rs
pub mod tree_shap;

use serde::{Deserialize, Serialize};

use crate::artifact::ModelArtifact;
use crate::errors::{EngineError, EngineResult};
use crate::features::FeatureVector;

pub const DEFAULT_SUMMARY_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskDirection {
    IncreasesRisk,
    DecreasesRisk,
}

impl RiskDirection {
    fn of(contribution: f64) -> Self {
        if contribution > 0.0 {
            RiskDirection::IncreasesRisk
        } else {
            RiskDirection::DecreasesRisk
        }
    }

    fn arrow(&self) -> &'static str {
        match self {
            RiskDirection::IncreasesRisk => "↑ risk",
            RiskDirection::DecreasesRisk => "↓ risk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldContribution {
    pub field: String,
    pub value: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeContribution {
    pub attribute: String,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub attribute: String,
    pub direction: RiskDirection,
    pub magnitude: f64,
    pub text: String,
}

/// Additive decomposition of one raw ensemble score.
///
/// Both `fields` and `attributes` sum to `raw_score - baseline`. Values are on the
/// raw score scale, before calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub model_version: u64,
    pub baseline: f64,
    pub raw_score: f64,
    pub fields: Vec<FieldContribution>,
    pub attributes: Vec<AttributeContribution>,
    /// Attributes ranked by absolute contribution, largest first.
    pub summary: Vec<SummaryItem>,
}

impl Explanation {
    pub fn attribute_total(&self) -> f64 {
        self.attributes.iter().map(|a| a.contribution).sum()
    }
}

/// Explains `vector` under `artifact`. The vector must come from the artifact's schema.
pub fn explain(vector: &FeatureVector, artifact: &ModelArtifact, top_n: usize) -> EngineResult<Explanation> {
    let layout = &artifact.schema.layout;
    if let Some(reason) = layout.grouping_defect() {
        return Err(EngineError::ModelSchemaMissing {
            version: artifact.version,
            reason,
        });
    }
    if vector.schema_version != artifact.schema.version {
        return Err(EngineError::schema_mismatch(
            "schema_version",
            format!(
                "vector encoded by {} but model v{} uses {}",
                vector.schema_version, artifact.version, artifact.schema.version
            ),
        ));
    }
    if vector.values.len() != layout.width() {
        return Err(EngineError::schema_mismatch(
            "values",
            format!("expected {} fields, got {}", layout.width(), vector.values.len()),
        ));
    }

    let ensemble = &artifact.ensemble;
    let phi = ensemble.contributions(&vector.values);
    let fields = layout
        .names
        .iter()
        .zip(&vector.values)
        .zip(&phi)
        .map(|((name, value), contribution)| FieldContribution {
            field: name.clone(),
            value: *value,
            contribution: *contribution,
        })
        .collect();
    let attributes: Vec<AttributeContribution> = layout
        .groups
        .iter()
        .map(|group| AttributeContribution {
            attribute: group.attribute.clone(),
            contribution: group.fields.iter().map(|&f| phi[f]).sum(),
        })
        .collect();

    let mut ranked: Vec<&AttributeContribution> = attributes.iter().collect();
    ranked.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
    let summary = ranked
        .into_iter()
        .take(top_n)
        .map(|a| {
            let direction = RiskDirection::of(a.contribution);
            SummaryItem {
                attribute: a.attribute.clone(),
                direction,
                magnitude: a.contribution.abs(),
                text: format!("{}: {} ({:+.3})", a.attribute, direction.arrow(), a.contribution),
            }
        })
        .collect();

    Ok(Explanation {
        model_version: artifact.version,
        baseline: ensemble.baseline(),
        raw_score: ensemble.raw_score(&vector.values),
        fields,
        attributes,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::trained_artifact;
    use crate::features::test_support::example_application;

    #[test]
    fn test_attribute_contributions_sum_to_raw_minus_baseline() {
        let artifact = trained_artifact(21);
        let vector = artifact.schema.prepare(&example_application()).unwrap();
        let explanation = explain(&vector, &artifact, DEFAULT_SUMMARY_SIZE).unwrap();

        let gap = explanation.raw_score - explanation.baseline;
        let tolerance = 1e-6 * gap.abs().max(1.0);
        assert!((explanation.attribute_total() - gap).abs() <= tolerance);
        let field_total: f64 = explanation.fields.iter().map(|f| f.contribution).sum();
        assert!((field_total - gap).abs() <= tolerance);
        assert_eq!(explanation.attributes.len(), 12);
        assert_eq!(explanation.fields.len(), artifact.schema.width());
    }

    #[test]
    fn test_summary_is_ranked_and_names_attributes() {
        let artifact = trained_artifact(22);
        let vector = artifact.schema.prepare(&example_application()).unwrap();
        let explanation = explain(&vector, &artifact, 3).unwrap();

        assert_eq!(explanation.summary.len(), 3);
        for pair in explanation.summary.windows(2) {
            assert!(pair[0].magnitude >= pair[1].magnitude);
        }
        for item in &explanation.summary {
            assert!(!item.attribute.contains('='));
            assert!(item.text.starts_with(&item.attribute));
        }
    }

    #[test]
    fn test_missing_grouping_map_is_reported() {
        let mut artifact = trained_artifact(23);
        let vector = artifact.schema.prepare(&example_application()).unwrap();
        artifact.schema.layout.groups.clear();
        match explain(&vector, &artifact, 5) {
            Err(EngineError::ModelSchemaMissing { version, .. }) => assert_eq!(version, artifact.version),
            other => panic!("expected ModelSchemaMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_schema_vector_is_rejected() {
        let artifact = trained_artifact(24);
        let mut vector = artifact.schema.prepare(&example_application()).unwrap();
        vector.schema_version = "fs-000000000000".to_string();
        assert!(matches!(
            explain(&vector, &artifact, 5),
            Err(EngineError::SchemaMismatch { .. })
        ));
    }
}
