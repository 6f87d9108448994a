// src/features/schema.rs
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use super::{
    hard_limits, normalize_category, RawApplication, CATEGORICAL_ATTRIBUTES, LOAN_TO_INCOME_RATIO,
    NUMERIC_ATTRIBUTES,
};
use crate::errors::{EngineError, EngineResult};

const LOWER_QUANTILE: f64 = 0.005;
const UPPER_QUANTILE: f64 = 0.995;
pub const UNSEEN_CATEGORY: &str = "<unseen>";

/// Frozen clip bounds and scaler parameters for one numeric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericField {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub mean: f64,
    pub std: f64,
}

impl NumericField {
    fn clip(&self, value: f64) -> (f64, bool) {
        if value < self.lower {
            (self.lower, true)
        } else if value > self.upper {
            (self.upper, true)
        } else {
            (value, false)
        }
    }

    fn scale(&self, value: f64) -> f64 {
        (value - self.mean) / self.std
    }
}

/// Encoding table for one categorical attribute. The unseen bucket always follows
/// the known categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalField {
    pub attribute: String,
    pub categories: Vec<String>,
}

impl CategoricalField {
    fn width(&self) -> usize {
        self.categories.len() + 1
    }

    fn slot(&self, value: &str) -> usize {
        self.categories
            .iter()
            .position(|c| c == value)
            .unwrap_or(self.categories.len())
    }
}

/// Maps encoded fields back to the attribute they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub attribute: String,
    pub fields: Vec<usize>,
}

/// Field names plus the grouping map for a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub names: Vec<String>,
    #[serde(default)]
    pub groups: Vec<FeatureGroup>,
}

impl FeatureLayout {
    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name_index(&self) -> HashMap<&str, usize> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect()
    }

    /// Reports why the grouping map cannot be used to aggregate contributions,
    /// or `None` when every field belongs to exactly one group.
    pub fn grouping_defect(&self) -> Option<String> {
        if self.groups.is_empty() {
            return Some("grouping map is absent".to_string());
        }
        let mut seen = vec![false; self.names.len()];
        for group in &self.groups {
            for &field in &group.fields {
                match seen.get_mut(field) {
                    None => {
                        return Some(format!(
                            "group '{}' references field {} outside width {}",
                            group.attribute,
                            field,
                            self.names.len()
                        ))
                    }
                    Some(flag) if *flag => {
                        return Some(format!("field {} belongs to more than one group", field))
                    }
                    Some(flag) => *flag = true,
                }
            }
        }
        seen.iter()
            .position(|covered| !covered)
            .map(|field| format!("field '{}' is not covered by any group", self.names[field]))
    }
}

/// Numeric encoding of one application under one schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_version: String,
    pub values: Vec<f64>,
    /// Attributes whose raw value fell outside the frozen bounds and was clipped.
    pub clipped: Vec<String>,
}

/// The fitted feature pipeline: bounds, scaler and encoding tables, frozen at
/// training time and carried by every artifact trained against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: String,
    pub numeric: Vec<NumericField>,
    pub categorical: Vec<CategoricalField>,
    pub layout: FeatureLayout,
}

impl FeatureSchema {
    /// Fits bounds, scaler and vocabularies on the training rows.
    pub fn fit(rows: &[&RawApplication]) -> EngineResult<Self> {
        if rows.is_empty() {
            return Err(EngineError::InsufficientData(
                "cannot fit a feature schema on zero rows".to_string(),
            ));
        }
        for row in rows {
            row.validate()?;
        }

        // Bounds for the direct numerics, on hard-limited values.
        let mut numeric: Vec<NumericField> = Vec::with_capacity(NUMERIC_ATTRIBUTES.len() + 1);
        for attribute in NUMERIC_ATTRIBUTES {
            let values: Vec<f64> = if attribute == "loan_percent_income" {
                // Placeholder; derived below once income and amount bounds exist.
                Vec::new()
            } else {
                rows.iter()
                    .map(|r| clamp_hard(attribute, r.numeric(attribute).unwrap_or_default()))
                    .collect()
            };
            numeric.push(bounded_field(attribute, values));
        }

        let income_idx = position(NUMERIC_ATTRIBUTES.as_slice(), "person_income");
        let amount_idx = position(NUMERIC_ATTRIBUTES.as_slice(), "loan_amnt");
        let percent_idx = position(NUMERIC_ATTRIBUTES.as_slice(), "loan_percent_income");

        let ratios: Vec<f64> = rows
            .iter()
            .map(|r| {
                let income = numeric[income_idx].clip(r.person_income.unwrap_or(1.0)).0;
                let amount = numeric[amount_idx].clip(r.loan_amnt.unwrap_or(0.0)).0;
                clamp_hard(LOAN_TO_INCOME_RATIO, amount / income)
            })
            .collect();
        let percents: Vec<f64> = rows
            .iter()
            .zip(ratios.iter())
            .map(|(r, ratio)| clamp_hard("loan_percent_income", r.loan_percent_income.unwrap_or(*ratio)))
            .collect();
        numeric[percent_idx] = bounded_field("loan_percent_income", percents);
        numeric.push(bounded_field(LOAN_TO_INCOME_RATIO, ratios));

        // Scaler on the clipped training values.
        let mut schema = Self {
            version: String::new(),
            numeric,
            categorical: Vec::new(),
            layout: FeatureLayout {
                names: Vec::new(),
                groups: Vec::new(),
            },
        };
        let clipped_rows: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| schema.clipped_numerics(r).map(|(v, _)| v))
            .collect::<EngineResult<_>>()?;
        for (i, field) in schema.numeric.iter_mut().enumerate() {
            let n = clipped_rows.len() as f64;
            let mean = clipped_rows.iter().map(|v| v[i]).sum::<f64>() / n;
            let var = clipped_rows.iter().map(|v| (v[i] - mean).powi(2)).sum::<f64>() / n;
            field.mean = mean;
            field.std = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
        }

        for (attribute, canonical) in CATEGORICAL_ATTRIBUTES {
            let mut vocabulary: BTreeSet<String> = canonical.iter().map(|c| c.to_string()).collect();
            for row in rows {
                vocabulary.insert(row.required_category(attribute)?);
            }
            schema.categorical.push(CategoricalField {
                attribute: attribute.to_string(),
                categories: vocabulary.into_iter().collect(),
            });
        }

        schema.layout = schema.build_layout();
        schema.version = schema.content_hash();
        info!(
            "🧮 Fitted feature schema {} ({} fields from {} rows)",
            schema.version,
            schema.width(),
            rows.len()
        );
        Ok(schema)
    }

    pub fn width(&self) -> usize {
        self.layout.width()
    }

    /// Encodes one application. Pure: identical input yields bit-identical output.
    pub fn prepare(&self, app: &RawApplication) -> EngineResult<FeatureVector> {
        let (numerics, clipped) = self.clipped_numerics(app)?;
        let mut values = Vec::with_capacity(self.width());
        for (field, value) in self.numeric.iter().zip(numerics) {
            values.push(field.scale(value));
        }
        for field in &self.categorical {
            let category = app.required_category(&field.attribute)?;
            let slot = field.slot(&category);
            if slot == field.categories.len() {
                debug!(
                    "Unseen category '{}' for {}, using fallback bucket",
                    category, field.attribute
                );
            }
            values.extend((0..field.width()).map(|i| if i == slot { 1.0 } else { 0.0 }));
        }
        Ok(FeatureVector {
            schema_version: self.version.clone(),
            values,
            clipped,
        })
    }

    /// Raw numerics after clipping, in field order, plus the clipped attribute names.
    fn clipped_numerics(&self, app: &RawApplication) -> EngineResult<(Vec<f64>, Vec<String>)> {
        let mut values = Vec::with_capacity(self.numeric.len());
        let mut clipped = Vec::new();
        let mut clip = |field: &NumericField, raw: f64, values: &mut Vec<f64>| {
            let (v, was_clipped) = field.clip(raw);
            if was_clipped {
                clipped.push(field.name.clone());
            }
            values.push(v);
            v
        };

        let mut income = 1.0;
        let mut amount = 0.0;
        for field in &self.numeric {
            match field.name.as_str() {
                "loan_percent_income" => {
                    let supplied = match app.loan_percent_income {
                        Some(v) if !v.is_finite() => {
                            return Err(EngineError::schema_mismatch(
                                "loan_percent_income",
                                "non-finite value",
                            ))
                        }
                        other => other,
                    };
                    clip(field, supplied.unwrap_or(amount / income), &mut values);
                }
                LOAN_TO_INCOME_RATIO => {
                    clip(field, amount / income, &mut values);
                }
                name => {
                    let v = clip(field, app.required_numeric(name)?, &mut values);
                    match name {
                        "person_income" => income = v,
                        "loan_amnt" => amount = v,
                        _ => {}
                    }
                }
            }
        }
        Ok((values, clipped))
    }

    fn build_layout(&self) -> FeatureLayout {
        let mut names = Vec::new();
        let mut groups = Vec::new();
        for field in &self.numeric {
            groups.push(FeatureGroup {
                attribute: field.name.clone(),
                fields: vec![names.len()],
            });
            names.push(field.name.clone());
        }
        for field in &self.categorical {
            let start = names.len();
            for category in &field.categories {
                names.push(format!("{}={}", field.attribute, category));
            }
            names.push(format!("{}={}", field.attribute, UNSEEN_CATEGORY));
            groups.push(FeatureGroup {
                attribute: field.attribute.clone(),
                fields: (start..names.len()).collect(),
            });
        }
        FeatureLayout { names, groups }
    }

    fn content_hash(&self) -> String {
        let payload = serde_json::to_vec(&(&self.numeric, &self.categorical)).unwrap_or_default();
        let digest = Sha256::digest(&payload);
        format!("fs-{}", &hex::encode(digest)[..12])
    }
}

fn position(names: &[&str], name: &str) -> usize {
    names.iter().position(|n| *n == name).unwrap_or(0)
}

fn clamp_hard(attribute: &str, value: f64) -> f64 {
    let (lo, hi) = hard_limits(attribute);
    value.clamp(lo, hi)
}

fn bounded_field(attribute: &str, mut values: Vec<f64>) -> NumericField {
    let (hard_lo, hard_hi) = hard_limits(attribute);
    let (lower, upper) = if values.is_empty() {
        (hard_lo, hard_hi)
    } else {
        values.sort_by(|a, b| a.total_cmp(b));
        let lower = quantile(&values, LOWER_QUANTILE).clamp(hard_lo, hard_hi);
        let upper = quantile(&values, UPPER_QUANTILE).clamp(hard_lo, hard_hi);
        (lower, upper.max(lower))
    };
    NumericField {
        name: attribute.to_string(),
        lower,
        upper,
        mean: 0.0,
        std: 1.0,
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
