// src/features/mod.rs
pub mod schema;

pub use schema::{CategoricalField, FeatureGroup, FeatureLayout, FeatureSchema, FeatureVector, NumericField};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{EngineError, EngineResult};

/// Numeric attributes taken directly from the application, in encoding order.
pub const NUMERIC_ATTRIBUTES: [&str; 7] = [
    "person_age",
    "person_income",
    "person_emp_length",
    "loan_amnt",
    "loan_int_rate",
    "loan_percent_income",
    "cb_person_cred_hist_length",
];

/// Engineered ratio appended after the raw numerics.
pub const LOAN_TO_INCOME_RATIO: &str = "loan_to_income_ratio";

/// Categorical attributes and the categories every schema knows about, even when
/// a training set happens not to contain them.
pub const CATEGORICAL_ATTRIBUTES: [(&str, &[&str]); 4] = [
    ("person_home_ownership", &["MORTGAGE", "OTHER", "OWN", "RENT"]),
    (
        "loan_intent",
        &[
            "DEBTCONSOLIDATION",
            "EDUCATION",
            "HOMEIMPROVEMENT",
            "MEDICAL",
            "PERSONAL",
            "VENTURE",
        ],
    ),
    ("loan_grade", &["A", "B", "C", "D", "E", "F", "G"]),
    ("cb_person_default_on_file", &["N", "Y"]),
];

/// Plausibility limits applied before the data-driven bounds.
pub(crate) fn hard_limits(attribute: &str) -> (f64, f64) {
    match attribute {
        "person_age" => (18.0, 100.0),
        "person_income" => (1.0, 1.0e9),
        "person_emp_length" => (0.0, 60.0),
        "loan_amnt" => (0.0, 1.0e7),
        "loan_int_rate" => (0.0, 100.0),
        "loan_percent_income" => (0.0, 10.0),
        "cb_person_cred_hist_length" => (0.0, 80.0),
        LOAN_TO_INCOME_RATIO => (0.0, 10.0),
        _ => (f64::MIN, f64::MAX),
    }
}

/// One applicant's submitted attributes.
///
/// Every attribute is optional at the type level so that a missing one is reported
/// as `SchemaMismatch` by the pipeline instead of failing deserialization upstream.
/// `loan_percent_income` may be omitted; it is then derived from amount and income.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawApplication {
    pub person_age: Option<f64>,
    pub person_income: Option<f64>,
    pub person_home_ownership: Option<String>,
    pub person_emp_length: Option<f64>,
    pub loan_intent: Option<String>,
    pub loan_grade: Option<String>,
    pub loan_amnt: Option<f64>,
    pub loan_int_rate: Option<f64>,
    pub loan_percent_income: Option<f64>,
    pub cb_person_default_on_file: Option<String>,
    pub cb_person_cred_hist_length: Option<f64>,
}

impl RawApplication {
    pub fn numeric(&self, attribute: &str) -> Option<f64> {
        match attribute {
            "person_age" => self.person_age,
            "person_income" => self.person_income,
            "person_emp_length" => self.person_emp_length,
            "loan_amnt" => self.loan_amnt,
            "loan_int_rate" => self.loan_int_rate,
            "loan_percent_income" => self.loan_percent_income,
            "cb_person_cred_hist_length" => self.cb_person_cred_hist_length,
            _ => None,
        }
    }

    pub fn categorical(&self, attribute: &str) -> Option<&str> {
        match attribute {
            "person_home_ownership" => self.person_home_ownership.as_deref(),
            "loan_intent" => self.loan_intent.as_deref(),
            "loan_grade" => self.loan_grade.as_deref(),
            "cb_person_default_on_file" => self.cb_person_default_on_file.as_deref(),
            _ => None,
        }
    }

    /// Reads a required numeric attribute, rejecting absent or non-finite values.
    pub(crate) fn required_numeric(&self, attribute: &str) -> EngineResult<f64> {
        match self.numeric(attribute) {
            None => Err(EngineError::schema_mismatch(attribute, "missing attribute")),
            Some(v) if !v.is_finite() => {
                Err(EngineError::schema_mismatch(attribute, format!("non-finite value {}", v)))
            }
            Some(v) => Ok(v),
        }
    }

    /// Reads a required categorical attribute in its normalised form.
    pub(crate) fn required_category(&self, attribute: &str) -> EngineResult<String> {
        let value = self
            .categorical(attribute)
            .map(normalize_category)
            .ok_or_else(|| EngineError::schema_mismatch(attribute, "missing attribute"))?;
        if value.is_empty() {
            return Err(EngineError::schema_mismatch(attribute, "empty category"));
        }
        Ok(value)
    }

    /// Checks that every attribute the pipeline needs is present and encodable.
    pub fn validate(&self) -> EngineResult<()> {
        for attribute in NUMERIC_ATTRIBUTES {
            if attribute == "loan_percent_income" {
                if let Some(v) = self.loan_percent_income {
                    if !v.is_finite() {
                        return Err(EngineError::schema_mismatch(attribute, "non-finite value"));
                    }
                }
                continue;
            }
            self.required_numeric(attribute)?;
        }
        for (attribute, _) in CATEGORICAL_ATTRIBUTES {
            self.required_category(attribute)?;
        }
        Ok(())
    }

    /// Stable identity used to drop duplicate submissions from feedback.
    pub fn dedup_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Compact row identity: the first 8 bytes of the SHA-256 of `dedup_key`.
    pub fn fingerprint(&self) -> u64 {
        let digest = Sha256::digest(self.dedup_key().as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

pub(crate) fn normalize_category(value: &str) -> String {
    value.trim().to_uppercase()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::RawApplication;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// The reference applicant used across the engine tests.
    pub fn example_application() -> RawApplication {
        RawApplication {
            person_age: Some(35.0),
            person_income: Some(75000.0),
            person_home_ownership: Some("RENT".to_string()),
            person_emp_length: Some(5.0),
            loan_intent: Some("DEBTCONSOLIDATION".to_string()),
            loan_grade: Some("B".to_string()),
            loan_amnt: Some(20000.0),
            loan_int_rate: Some(9.5),
            loan_percent_income: Some(0.27),
            cb_person_default_on_file: Some("N".to_string()),
            cb_person_cred_hist_length: Some(4.0),
        }
    }

    /// Synthetic applicants whose default risk rises with grade, burden and prior default.
    pub fn synthetic_applications(n: usize, seed: u64) -> Vec<(RawApplication, u8)> {
        let mut rng = StdRng::seed_from_u64(seed);
        let homes = ["RENT", "OWN", "MORTGAGE", "OTHER"];
        let intents = [
            "DEBTCONSOLIDATION",
            "EDUCATION",
            "HOMEIMPROVEMENT",
            "MEDICAL",
            "PERSONAL",
            "VENTURE",
        ];
        let grades = ["A", "B", "C", "D", "E", "F", "G"];
        (0..n)
            .map(|_| {
                let income: f64 = rng.gen_range(15_000.0..150_000.0);
                let amount: f64 = rng.gen_range(1_000.0..35_000.0);
                let grade_idx = rng.gen_range(0..grades.len());
                let prior_default = rng.gen_bool(0.2);
                let home = homes[rng.gen_range(0..homes.len())];
                let burden = amount / income;
                let rate = 6.0 + grade_idx as f64 * 2.5 + rng.gen_range(-1.0..1.0);
                let logit = -3.0
                    + 0.6 * grade_idx as f64
                    + 5.0 * burden
                    + if prior_default { 0.8 } else { 0.0 }
                    + if home == "RENT" { 0.4 } else { 0.0 };
                let p = 1.0 / (1.0 + (-logit).exp());
                let label = u8::from(rng.gen_bool(p));
                let app = RawApplication {
                    person_age: Some(rng.gen_range(20.0..70.0f64).round()),
                    person_income: Some(income.round()),
                    person_home_ownership: Some(home.to_string()),
                    person_emp_length: Some(rng.gen_range(0.0..20.0f64).round()),
                    loan_intent: Some(intents[rng.gen_range(0..intents.len())].to_string()),
                    loan_grade: Some(grades[grade_idx].to_string()),
                    loan_amnt: Some(amount.round()),
                    loan_int_rate: Some((rate * 100.0).round() / 100.0),
                    loan_percent_income: Some((burden * 100.0).round() / 100.0),
                    cb_person_default_on_file: Some(if prior_default { "Y" } else { "N" }.to_string()),
                    cb_person_cred_hist_length: Some(rng.gen_range(2.0..20.0f64).round()),
                };
                (app, label)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::example_application;
    use super::*;

    #[test]
    fn test_validate_accepts_complete_application() {
        assert!(example_application().validate().is_ok());
    }

    #[test]
    fn test_validate_allows_missing_percent_income() {
        let mut app = example_application();
        app.loan_percent_income = None;
        assert!(app.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_grade() {
        let mut app = example_application();
        app.loan_grade = None;
        match app.validate() {
            Err(EngineError::SchemaMismatch { field, .. }) => assert_eq!(field, "loan_grade"),
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_nan_income() {
        let mut app = example_application();
        app.person_income = Some(f64::NAN);
        assert!(matches!(
            app.validate(),
            Err(EngineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_fields_deserialize_as_none() {
        let app: RawApplication =
            serde_json::from_str(r#"{"person_age": 40, "loan_grade": " b "}"#).unwrap();
        assert_eq!(app.person_age, Some(40.0));
        assert!(app.person_income.is_none());
        assert_eq!(app.required_category("loan_grade").unwrap(), "B");
    }
}
