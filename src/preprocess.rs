//! Claim preprocessing into typed model input.
//!
//! The preprocessing schema is written by the trainer next to the model and
//! fixes which claim fields are read, in which order, and how each is typed.

use crate::error::{PipelineError, PipelineResult};
use crate::types::claim::Claim;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Current schema artifact version
pub const SCHEMA_VERSION: u32 = 1;

/// How a feature column is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

/// What to do when a claim lacks a field the schema declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFieldPolicy {
    /// Fail the claim with `MissingClaimField`
    #[default]
    Reject,
    /// Numeric fields take the training median, categorical fields are missing
    Impute,
}

/// Preprocessing schema persisted alongside the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSchema {
    pub version: u32,
    /// Label column the model was trained against
    pub target: String,
    /// Training column order
    pub feature_names: Vec<String>,
    pub numeric_cols: Vec<String>,
    pub categorical_cols: Vec<String>,
    /// Sorted category levels; a value's code is its index here
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    /// Training medians, used for imputation
    #[serde(default)]
    pub numeric_medians: BTreeMap<String, f64>,
    /// Digest of the ordered feature names and kinds
    pub fingerprint: String,
}

impl PreprocessSchema {
    /// Create a schema; every feature not listed as numeric is categorical
    pub fn new(target: &str, feature_names: Vec<String>, numeric_cols: Vec<String>) -> Self {
        let categorical_cols: Vec<String> = feature_names
            .iter()
            .filter(|name| !numeric_cols.contains(name))
            .cloned()
            .collect();
        let fingerprint = compute_fingerprint(&feature_names, &numeric_cols);

        Self {
            version: SCHEMA_VERSION,
            target: target.to_string(),
            feature_names,
            numeric_cols,
            categorical_cols,
            categories: BTreeMap::new(),
            numeric_medians: BTreeMap::new(),
            fingerprint,
        }
    }

    /// Attach category levels (sorted on insert)
    pub fn with_categories(mut self, categories: BTreeMap<String, Vec<String>>) -> Self {
        self.categories = categories
            .into_iter()
            .map(|(col, mut levels)| {
                levels.sort();
                levels.dedup();
                (col, levels)
            })
            .collect();
        self
    }

    /// Attach training medians
    pub fn with_medians(mut self, medians: BTreeMap<String, f64>) -> Self {
        self.numeric_medians = medians;
        self
    }

    /// Load and validate a schema artifact
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ModelLoad(format!("cannot read schema {}: {}", path.display(), e))
        })?;
        let schema: Self = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::ModelLoad(format!("corrupt schema {}: {}", path.display(), e))
        })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Persist the schema as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Check internal consistency of the artifact
    pub fn validate(&self) -> PipelineResult<()> {
        if self.version != SCHEMA_VERSION {
            return Err(PipelineError::ModelLoad(format!(
                "unsupported schema version {} (expected {})",
                self.version, SCHEMA_VERSION
            )));
        }

        for name in &self.feature_names {
            let numeric = self.numeric_cols.contains(name);
            let categorical = self.categorical_cols.contains(name);
            if numeric == categorical {
                return Err(PipelineError::ModelLoad(format!(
                    "feature '{}' must be exactly one of numeric or categorical",
                    name
                )));
            }
        }
        if self.numeric_cols.len() + self.categorical_cols.len() != self.feature_names.len() {
            return Err(PipelineError::ModelLoad(
                "column lists do not cover the feature order".to_string(),
            ));
        }

        let expected = compute_fingerprint(&self.feature_names, &self.numeric_cols);
        if expected != self.fingerprint {
            return Err(PipelineError::ModelLoad(format!(
                "schema fingerprint {} does not match its columns ({})",
                self.fingerprint, expected
            )));
        }
        Ok(())
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    /// Kind of a feature, if the schema declares it
    pub fn kind_of(&self, name: &str) -> Option<FeatureKind> {
        if self.numeric_cols.iter().any(|c| c == name) {
            Some(FeatureKind::Numeric)
        } else if self.categorical_cols.iter().any(|c| c == name) {
            Some(FeatureKind::Categorical)
        } else {
            None
        }
    }

    /// Category code of a level, if it was seen during training
    pub fn category_code(&self, column: &str, level: &str) -> Option<usize> {
        self.categories
            .get(column)
            .and_then(|levels| levels.binary_search_by(|l| l.as_str().cmp(level)).ok())
    }

    /// Encode a typed row into the dense vector the classifiers consume.
    ///
    /// Numeric values pass through, categorical values become their level
    /// code, anything missing or unseen becomes NaN.
    pub fn encode(&self, row: &TypedRow) -> PipelineResult<Vec<f64>> {
        self.check_row(row)?;

        Ok(row
            .columns
            .iter()
            .map(|column| match &column.value {
                FeatureValue::Numeric(Some(v)) => *v,
                FeatureValue::Categorical(Some(level)) => self
                    .category_code(&column.name, level)
                    .map(|code| code as f64)
                    .unwrap_or(f64::NAN),
                _ => f64::NAN,
            })
            .collect())
    }

    /// Row columns must match the training order and kinds exactly
    pub fn check_row(&self, row: &TypedRow) -> PipelineResult<()> {
        if row.columns.len() != self.feature_names.len() {
            return Err(PipelineError::SchemaMismatch(format!(
                "row has {} columns, model expects {}",
                row.columns.len(),
                self.feature_names.len()
            )));
        }
        for (column, expected) in row.columns.iter().zip(&self.feature_names) {
            if &column.name != expected {
                return Err(PipelineError::SchemaMismatch(format!(
                    "column '{}' found where '{}' was expected",
                    column.name, expected
                )));
            }
            if self.kind_of(&column.name) != Some(column.value.kind()) {
                return Err(PipelineError::SchemaMismatch(format!(
                    "column '{}' has the wrong kind",
                    column.name
                )));
            }
        }
        Ok(())
    }
}

/// SHA-256 over "name:kind" lines in feature order
pub fn compute_fingerprint(feature_names: &[String], numeric_cols: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in feature_names {
        let kind = if numeric_cols.contains(name) {
            "numeric"
        } else {
            "categorical"
        };
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(kind.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// A typed cell of a preprocessed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FeatureValue {
    /// Coerced float; `None` when the raw value was missing or not numeric
    Numeric(Option<f64>),
    /// Category level as text; `None` when missing
    Categorical(Option<String>),
}

impl FeatureValue {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureValue::Numeric(_) => FeatureKind::Numeric,
            FeatureValue::Categorical(_) => FeatureKind::Categorical,
        }
    }

    /// Back to a raw JSON value
    pub fn to_json(&self) -> Value {
        match self {
            FeatureValue::Numeric(Some(v)) => {
                Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null)
            }
            FeatureValue::Categorical(Some(level)) => Value::String(level.clone()),
            _ => Value::Null,
        }
    }
}

/// Coerce a raw value to a float; anything unparseable is missing
pub fn coerce_numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Tag a raw value as a category level
pub fn coerce_categorical(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// One named, typed column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedColumn {
    pub name: String,
    pub value: FeatureValue,
}

/// Single-row typed table in training column order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRow {
    pub columns: Vec<TypedColumn>,
}

impl TypedRow {
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Convert back into a claim holding the typed values
    pub fn to_claim(&self) -> Claim {
        let mut claim = Claim::new();
        for column in &self.columns {
            claim.insert(&column.name, column.value.to_json());
        }
        claim
    }
}

/// Turns raw claims into typed rows according to the schema.
pub struct Preprocessor {
    schema: Arc<PreprocessSchema>,
    policy: MissingFieldPolicy,
}

impl Preprocessor {
    pub fn new(schema: Arc<PreprocessSchema>, policy: MissingFieldPolicy) -> Self {
        Self { schema, policy }
    }

    pub fn schema(&self) -> &PreprocessSchema {
        &self.schema
    }

    /// Build the typed row for a claim.
    ///
    /// Invalid numeric values become missing and never fail; only an absent
    /// field fails, and only under the `reject` policy.
    pub fn preprocess(&self, claim: &Claim) -> PipelineResult<TypedRow> {
        let mut columns = Vec::with_capacity(self.schema.feature_count());

        for name in &self.schema.feature_names {
            let kind = self
                .schema
                .kind_of(name)
                .ok_or_else(|| PipelineError::SchemaMismatch(format!("unknown kind for '{}'", name)))?;

            let value = match (claim.get(name), kind) {
                (Some(raw), FeatureKind::Numeric) => FeatureValue::Numeric(coerce_numeric(raw)),
                (Some(raw), FeatureKind::Categorical) => {
                    FeatureValue::Categorical(coerce_categorical(raw))
                }
                (None, _) if self.policy == MissingFieldPolicy::Reject => {
                    return Err(PipelineError::MissingClaimField(name.clone()));
                }
                (None, FeatureKind::Numeric) => {
                    debug!(field = %name, "Imputing missing numeric field with training median");
                    FeatureValue::Numeric(self.schema.numeric_medians.get(name).copied())
                }
                (None, FeatureKind::Categorical) => FeatureValue::Categorical(None),
            };

            columns.push(TypedColumn {
                name: name.clone(),
                value,
            });
        }

        Ok(TypedRow { columns })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_schema() -> PreprocessSchema {
        let features = ["Age", "VehiclePrice", "Fault", "Deductible", "DriverRating"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let numeric = ["Age", "VehiclePrice", "Deductible", "DriverRating"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut categories = BTreeMap::new();
        categories.insert(
            "Fault".to_string(),
            vec!["Third Party".to_string(), "Policy Holder".to_string()],
        );
        let mut medians = BTreeMap::new();
        medians.insert("Age".to_string(), 38.0);
        medians.insert("Deductible".to_string(), 400.0);

        PreprocessSchema::new("FraudFound_P", features, numeric)
            .with_categories(categories)
            .with_medians(medians)
    }

    pub(crate) fn sample_claim() -> Claim {
        Claim::new()
            .with("Age", 34)
            .with("VehiclePrice", "20000 to 29000")
            .with("Fault", "Policy Holder")
            .with("Deductible", 400)
            .with("DriverRating", "2")
            .with("PolicyNumber", 1042)
    }

    #[test]
    fn test_preprocess_coerces_types() {
        let preprocessor = Preprocessor::new(Arc::new(sample_schema()), MissingFieldPolicy::Reject);
        let row = preprocessor.preprocess(&sample_claim()).unwrap();

        assert_eq!(row.column_names(), vec!["Age", "VehiclePrice", "Fault", "Deductible", "DriverRating"]);
        assert_eq!(row.get("Age"), Some(&FeatureValue::Numeric(Some(34.0))));
        // Range strings are not numbers and become missing, not errors
        assert_eq!(row.get("VehiclePrice"), Some(&FeatureValue::Numeric(None)));
        assert_eq!(row.get("DriverRating"), Some(&FeatureValue::Numeric(Some(2.0))));
        assert_eq!(
            row.get("Fault"),
            Some(&FeatureValue::Categorical(Some("Policy Holder".to_string())))
        );
    }

    #[test]
    fn test_preprocess_is_idempotent() {
        let preprocessor = Preprocessor::new(Arc::new(sample_schema()), MissingFieldPolicy::Reject);
        let row = preprocessor.preprocess(&sample_claim()).unwrap();
        let again = preprocessor.preprocess(&row.to_claim()).unwrap();
        assert_eq!(row, again);
    }

    #[test]
    fn test_missing_field_rejected() {
        let preprocessor = Preprocessor::new(Arc::new(sample_schema()), MissingFieldPolicy::Reject);
        let claim = Claim::new().with("Age", 34);

        match preprocessor.preprocess(&claim) {
            Err(PipelineError::MissingClaimField(field)) => assert_eq!(field, "VehiclePrice"),
            other => panic!("expected MissingClaimField, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_imputed() {
        let preprocessor = Preprocessor::new(Arc::new(sample_schema()), MissingFieldPolicy::Impute);
        let claim = Claim::new().with("VehiclePrice", 25000).with("DriverRating", 1);
        let row = preprocessor.preprocess(&claim).unwrap();

        assert_eq!(row.get("Age"), Some(&FeatureValue::Numeric(Some(38.0))));
        assert_eq!(row.get("Fault"), Some(&FeatureValue::Categorical(None)));
    }

    #[test]
    fn test_null_field_is_present_but_missing() {
        let preprocessor = Preprocessor::new(Arc::new(sample_schema()), MissingFieldPolicy::Reject);
        let mut claim = sample_claim();
        claim.insert("Age", json!(null));
        let row = preprocessor.preprocess(&claim).unwrap();
        assert_eq!(row.get("Age"), Some(&FeatureValue::Numeric(None)));
    }

    #[test]
    fn test_encode_uses_category_codes() {
        let schema = sample_schema();
        let preprocessor = Preprocessor::new(Arc::new(schema.clone()), MissingFieldPolicy::Reject);
        let row = preprocessor.preprocess(&sample_claim()).unwrap();
        let encoded = schema.encode(&row).unwrap();

        assert_eq!(encoded[0], 34.0);
        assert!(encoded[1].is_nan());
        // Levels are sorted: ["Policy Holder", "Third Party"]
        assert_eq!(encoded[2], 0.0);
        assert_eq!(encoded[3], 400.0);
    }

    #[test]
    fn test_check_row_detects_reordering() {
        let schema = sample_schema();
        let preprocessor = Preprocessor::new(Arc::new(schema.clone()), MissingFieldPolicy::Reject);
        let mut row = preprocessor.preprocess(&sample_claim()).unwrap();
        row.columns.swap(0, 1);

        assert!(matches!(
            schema.check_row(&row),
            Err(PipelineError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_schema_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let schema = sample_schema();
        schema.save(&path).unwrap();

        let loaded = PreprocessSchema::load(&path).unwrap();
        assert_eq!(loaded, schema);

        let mut tampered = schema;
        tampered.numeric_cols.pop();
        tampered.categorical_cols.push("DriverRating".to_string());
        tampered.save(&path).unwrap();
        assert!(matches!(
            PreprocessSchema::load(&path),
            Err(PipelineError::ModelLoad(_))
        ));
    }

    #[test]
    fn test_missing_schema_file() {
        assert!(matches!(
            PreprocessSchema::load("/nonexistent/schema.json"),
            Err(PipelineError::ModelLoad(_))
        ));
    }
}
