//! Historical claims loaded from CSV, plus the summary `train-model inspect` prints

use crate::preprocess::PreprocessSchema;
use crate::training::TrainingError;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Raw tabular data, every cell kept as text
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| TrainingError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TrainingError> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.headers.len())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, TrainingError> {
        self.column_index(name)
            .ok_or_else(|| TrainingError::MissingColumn(name.to_string()))
    }

    /// Cells of one column
    pub fn column(&self, index: usize) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .map(move |row| row.get(index).map(String::as_str).unwrap_or(""))
    }

    /// Labels of the target column, 0/1 (also accepts true/false)
    pub fn labels(&self, target: &str) -> Result<Vec<bool>, TrainingError> {
        let index = self.require_column(target)?;
        self.column(index)
            .enumerate()
            .map(|(row, cell)| match cell.to_ascii_lowercase().as_str() {
                "1" | "1.0" | "true" => Ok(true),
                "0" | "0.0" | "false" => Ok(false),
                _ => Err(TrainingError::InvalidTarget {
                    row,
                    value: cell.to_string(),
                }),
            })
            .collect()
    }

    /// Summary of shape, target balance, numeric stats and missing values
    pub fn inspect(&self, target: &str, numeric_cols: &[String]) -> Result<DatasetSummary, TrainingError> {
        let target_index = self.require_column(target)?;
        let mut target_counts: BTreeMap<String, usize> = BTreeMap::new();
        for cell in self.column(target_index) {
            *target_counts.entry(cell.to_string()).or_insert(0) += 1;
        }

        let mut numeric_stats = Vec::new();
        for name in numeric_cols {
            let index = self.require_column(name)?;
            let values: Vec<f64> = self.column(index).filter_map(parse_numeric).collect();
            numeric_stats.push(NumericStats::from_values(name, &values));
        }

        let missing = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.column(i).filter(|c| is_missing(c)).count()))
            .collect();

        Ok(DatasetSummary {
            rows: self.rows.len(),
            columns: self.headers.clone(),
            target: target.to_string(),
            target_counts,
            numeric_stats,
            missing,
        })
    }
}

/// Empty or NA-like cell
pub fn is_missing(cell: &str) -> bool {
    matches!(cell.trim(), "" | "NA" | "NaN" | "nan" | "null" | "None")
}

/// Numeric value of a cell; non-numeric text is missing
pub fn parse_numeric(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Median of the values, `None` when there are none
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Count, mean, sample std, min and max of one numeric column
#[derive(Debug, Clone, PartialEq)]
pub struct NumericStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl NumericStats {
    fn from_values(name: &str, values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                name: name.to_string(),
                count,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Self {
            name: name.to_string(),
            count,
            mean,
            std,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSummary {
    pub rows: usize,
    pub columns: Vec<String>,
    pub target: String,
    pub target_counts: BTreeMap<String, usize>,
    pub numeric_stats: Vec<NumericStats>,
    /// Missing cells per column, in column order
    pub missing: Vec<(String, usize)>,
}

impl fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataset shape: ({}, {})", self.rows, self.columns.len())?;
        writeln!(f, "\nColumn names:\n{}", self.columns.join(", "))?;

        writeln!(f, "\nTarget ({}) distribution:", self.target)?;
        for (value, count) in &self.target_counts {
            let share = if self.rows > 0 {
                *count as f64 / self.rows as f64
            } else {
                0.0
            };
            writeln!(f, "  {:<8} {:>8} {:>8.4}", value, count, share)?;
        }

        writeln!(f, "\nNumeric column stats:")?;
        writeln!(
            f,
            "  {:<24} {:>8} {:>12} {:>12} {:>12} {:>12}",
            "column", "count", "mean", "std", "min", "max"
        )?;
        for s in &self.numeric_stats {
            writeln!(
                f,
                "  {:<24} {:>8} {:>12.4} {:>12.4} {:>12.4} {:>12.4}",
                s.name, s.count, s.mean, s.std, s.min, s.max
            )?;
        }

        writeln!(f, "\nMissing values per column:")?;
        for (name, count) in &self.missing {
            writeln!(f, "  {:<24} {:>8}", name, count)?;
        }
        Ok(())
    }
}

/// Feature matrix ready for boosting, with the schema that produced it
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub schema: PreprocessSchema,
    /// Row-major; categorical codes match `PreprocessSchema::encode`, numeric gaps take the median
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<bool>,
}

impl PreparedData {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|l| **l).count()
    }
}

impl Dataset {
    /// Drop excluded columns, coerce numerics with median fill, and code categoricals.
    ///
    /// Every remaining column that is not declared numeric is categorical.
    pub fn prepare(
        &self,
        target: &str,
        drop_columns: &[String],
        numeric_features: &[String],
    ) -> Result<PreparedData, TrainingError> {
        if self.rows.is_empty() {
            return Err(TrainingError::EmptyDataset);
        }
        let labels = self.labels(target)?;
        for name in numeric_features {
            self.require_column(name)?;
        }

        let feature_indices: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.as_str() != target && !drop_columns.contains(h))
            .map(|(i, _)| i)
            .collect();
        let feature_names: Vec<String> = feature_indices
            .iter()
            .map(|&i| self.headers[i].clone())
            .collect();

        let mut medians = BTreeMap::new();
        let mut categories = BTreeMap::new();
        for (&index, name) in feature_indices.iter().zip(&feature_names) {
            if numeric_features.contains(name) {
                let values: Vec<f64> = self.column(index).filter_map(parse_numeric).collect();
                if let Some(m) = median(&values) {
                    medians.insert(name.clone(), m);
                }
            } else {
                let levels: Vec<String> = self
                    .column(index)
                    .filter(|c| !is_missing(c))
                    .map(str::to_string)
                    .collect();
                categories.insert(name.clone(), levels);
            }
        }

        let numeric_cols: Vec<String> = numeric_features
            .iter()
            .filter(|name| feature_names.contains(name))
            .cloned()
            .collect();
        let schema = PreprocessSchema::new(target, feature_names.clone(), numeric_cols)
            .with_categories(categories)
            .with_medians(medians);

        let features = self
            .rows
            .iter()
            .map(|row| {
                feature_indices
                    .iter()
                    .zip(&feature_names)
                    .map(|(&index, name)| {
                        let cell = row.get(index).map(String::as_str).unwrap_or("");
                        if numeric_features.contains(name) {
                            parse_numeric(cell)
                                .or_else(|| schema.numeric_medians.get(name).copied())
                                .unwrap_or(f64::NAN)
                        } else if is_missing(cell) {
                            f64::NAN
                        } else {
                            schema
                                .category_code(name, cell)
                                .map(|c| c as f64)
                                .unwrap_or(f64::NAN)
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(PreparedData {
            schema,
            features,
            labels,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_CSV: &str = "\
PolicyNumber,Age,Fault,VehiclePrice,Deductible,FraudFound_P
1,34,Policy Holder,20000 to 29000,400,1
2,51,Third Party,more than 69000,400,0
3,,Third Party,20000 to 29000,500,0
4,28,Policy Holder,less than 20000,400,0
5,45,,30000 to 39000,700,1
";

    fn sample() -> Dataset {
        Dataset::from_reader(SAMPLE_CSV.as_bytes()).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_csv() {
        let dataset = sample();
        assert_eq!(dataset.shape(), (5, 6));
        assert_eq!(dataset.headers[1], "Age");
        assert_eq!(dataset.rows[2][1], "");
    }

    #[test]
    fn test_labels() {
        let dataset = sample();
        assert_eq!(
            dataset.labels("FraudFound_P").unwrap(),
            vec![true, false, false, false, true]
        );
        assert!(matches!(
            dataset.labels("Age"),
            Err(TrainingError::InvalidTarget { row: 0, .. })
        ));
    }

    #[test]
    fn test_inspect() {
        let summary = sample()
            .inspect("FraudFound_P", &strings(&["Age", "Deductible"]))
            .unwrap();

        assert_eq!(summary.rows, 5);
        assert_eq!(summary.target_counts.get("0"), Some(&3));
        assert_eq!(summary.target_counts.get("1"), Some(&2));

        let age = &summary.numeric_stats[0];
        assert_eq!(age.count, 4);
        assert!((age.mean - 39.5).abs() < 1e-12);
        assert_eq!(age.min, 28.0);
        assert_eq!(age.max, 51.0);

        assert!(summary.missing.contains(&("Age".to_string(), 1)));
        assert!(summary.missing.contains(&("Fault".to_string(), 1)));

        let rendered = summary.to_string();
        assert!(rendered.contains("Dataset shape: (5, 6)"));
    }

    #[test]
    fn test_prepare() {
        let prepared = sample()
            .prepare(
                "FraudFound_P",
                &strings(&["PolicyNumber"]),
                &strings(&["Age", "VehiclePrice", "Deductible"]),
            )
            .unwrap();

        let schema = &prepared.schema;
        assert_eq!(
            schema.feature_names,
            strings(&["Age", "Fault", "VehiclePrice", "Deductible"])
        );
        assert_eq!(schema.categorical_cols, strings(&["Fault"]));
        assert_eq!(
            schema.categories.get("Fault").unwrap(),
            &strings(&["Policy Holder", "Third Party"])
        );
        // Median of 34, 51, 28, 45
        assert_eq!(schema.numeric_medians.get("Age"), Some(&39.5));
        // Text price bands never parse, so the column has no median
        assert!(!schema.numeric_medians.contains_key("VehiclePrice"));

        assert_eq!(prepared.features[2][0], 39.5);
        assert_eq!(prepared.features[0][1], 0.0);
        assert!(prepared.features[4][1].is_nan());
        assert!(prepared.features[0][2].is_nan());
        assert_eq!(prepared.positives(), 2);
    }

    #[test]
    fn test_prepare_missing_numeric_column() {
        let result = sample().prepare("FraudFound_P", &[], &strings(&["Mileage"]));
        assert!(matches!(result, Err(TrainingError::MissingColumn(c)) if c == "Mileage"));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }
}
