//! Trial configuration: model family, inputs, schema and output locations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config_error;
use crate::errors::{ModelError, TrialError, TtResult};

/// Numeric precision every split output is cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Float64,
}

impl Default for Precision {
    fn default() -> Self {
        Self::Float32
    }
}

impl Precision {
    /// Round `value` to this precision.
    #[inline]
    pub fn cast(self, value: f64) -> f64 {
        match self {
            Self::Float32 => value as f32 as f64,
            Self::Float64 => value,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Float64 => write!(f, "float64"),
        }
    }
}

/// On-disk format of the input files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputFormat {
    Parquet,
    Csv,
}

impl FromStr for InputFormat {
    type Err = TrialError;

    /// Accepts any tag containing "parquet" or "csv" (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.contains("parquet") {
            Ok(Self::Parquet)
        } else if lower.contains("csv") {
            Ok(Self::Csv)
        } else {
            Err(config_error!("unsupported input file type: {}", s))
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parquet => write!(f, "Parquet"),
            Self::Csv => write!(f, "CSV"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputConfig {
    pub files: Vec<PathBuf>,
    pub format: InputFormat,
}

/// Hyperparameters for the boosted-tree family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XgboostParams {
    pub num_boost_round: usize,
    pub max_depth: usize,
    #[serde(alias = "eta")]
    pub learning_rate: f64,
    /// Minimum split gain.
    pub gamma: f64,
    /// L2 regularization.
    pub lambda: f64,
    /// L1 regularization.
    pub alpha: f64,
    pub min_child_weight: f64,
    pub max_bin: usize,
    pub objective: String,
}

impl Default for XgboostParams {
    fn default() -> Self {
        Self {
            num_boost_round: 100,
            max_depth: 6,
            learning_rate: 0.3,
            gamma: 0.0,
            lambda: 1.0,
            alpha: 0.0,
            min_child_weight: 1.0,
            max_bin: 256,
            objective: "binary:logistic".to_string(),
        }
    }
}

impl XgboostParams {
    pub fn validate(&self) -> TtResult<()> {
        if self.num_boost_round == 0 {
            return Err(invalid("num_boost_round", "must be at least 1"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(invalid("learning_rate", "must be positive"));
        }
        if self.gamma < 0.0 || self.lambda < 0.0 || self.alpha < 0.0 {
            return Err(invalid("gamma/lambda/alpha", "must be non-negative"));
        }
        if self.min_child_weight < 0.0 {
            return Err(invalid("min_child_weight", "must be non-negative"));
        }
        if self.max_bin < 2 {
            return Err(invalid("max_bin", "must be at least 2"));
        }
        if self.objective != "binary:logistic" {
            return Err(invalid(
                "objective",
                &format!("unsupported objective '{}'", self.objective),
            ));
        }
        Ok(())
    }
}

/// Hyperparameters for the random-forest family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    /// Fraction of features considered at each split.
    pub max_features: f64,
    /// Candidate thresholds per feature.
    pub n_bins: usize,
    pub seed: Option<u64>,
}

impl Default for RandomForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 16,
            max_features: 1.0,
            n_bins: 128,
            seed: None,
        }
    }
}

impl RandomForestParams {
    pub fn validate(&self) -> TtResult<()> {
        if self.n_estimators == 0 {
            return Err(invalid("n_estimators", "must be at least 1"));
        }
        if self.max_depth == 0 {
            return Err(invalid("max_depth", "must be at least 1"));
        }
        if !(self.max_features > 0.0 && self.max_features <= 1.0) {
            return Err(invalid("max_features", "must be in (0, 1]"));
        }
        if self.n_bins < 2 {
            return Err(invalid("n_bins", "must be at least 2"));
        }
        Ok(())
    }
}

fn invalid(parameter: &str, message: &str) -> TrialError {
    ModelError::InvalidParameter {
        parameter: parameter.to_string(),
        message: message.to_string(),
    }
    .into()
}

/// The two supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    XGBoost,
    RandomForest,
}

impl ModelFamily {
    /// Boosted-tree training fails when any worker holds no partition, so the
    /// worker count must not exceed the number of input files.
    pub fn is_partition_sensitive(self) -> bool {
        matches!(self, Self::XGBoost)
    }

    /// Filename suffix of the persisted model.
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::XGBoost => "_mgpu_xgb",
            Self::RandomForest => "_mgpu_rf",
        }
    }
}

impl FromStr for ModelFamily {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.contains("xgboost") {
            Ok(Self::XGBoost)
        } else if lower.contains("randomforest") || lower.contains("random_forest") {
            Ok(Self::RandomForest)
        } else {
            Err(config_error!("unsupported model type: {}", s))
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::XGBoost => write!(f, "XGBoost"),
            Self::RandomForest => write!(f, "RandomForest"),
        }
    }
}

/// Model family together with its hyperparameter record. Configuration files
/// are read through [`ModelConfig::from_hyperparameters`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "model_type", content = "model_params")]
pub enum ModelConfig {
    XGBoost(XgboostParams),
    RandomForest(RandomForestParams),
}

impl ModelConfig {
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::XGBoost(_) => ModelFamily::XGBoost,
            Self::RandomForest(_) => ModelFamily::RandomForest,
        }
    }

    pub fn validate(&self) -> TtResult<()> {
        match self {
            Self::XGBoost(p) => p.validate(),
            Self::RandomForest(p) => p.validate(),
        }
    }

    /// Build a typed model config from a loose hyperparameter mapping, as an
    /// external search controller supplies it. Numbers may be JSON numbers or
    /// numeric strings; unknown keys are ignored.
    pub fn from_hyperparameters(
        model_type: &str,
        params: &HashMap<String, serde_json::Value>,
    ) -> TtResult<Self> {
        let config = match model_type.parse::<ModelFamily>()? {
            ModelFamily::XGBoost => {
                let d = XgboostParams::default();
                Self::XGBoost(XgboostParams {
                    num_boost_round: param_usize(params, "num_boost_round", d.num_boost_round)?,
                    max_depth: param_usize(params, "max_depth", d.max_depth)?,
                    learning_rate: match params.contains_key("learning_rate") {
                        true => param_f64(params, "learning_rate", d.learning_rate)?,
                        false => param_f64(params, "eta", d.learning_rate)?,
                    },
                    gamma: param_f64(params, "gamma", d.gamma)?,
                    lambda: param_f64(params, "lambda", d.lambda)?,
                    alpha: param_f64(params, "alpha", d.alpha)?,
                    min_child_weight: param_f64(params, "min_child_weight", d.min_child_weight)?,
                    max_bin: param_usize(params, "max_bin", d.max_bin)?,
                    objective: params
                        .get("objective")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or(d.objective),
                })
            }
            ModelFamily::RandomForest => {
                let d = RandomForestParams::default();
                Self::RandomForest(RandomForestParams {
                    n_estimators: param_usize(params, "n_estimators", d.n_estimators)?,
                    max_depth: param_usize(params, "max_depth", d.max_depth)?,
                    max_features: param_f64(params, "max_features", d.max_features)?,
                    n_bins: param_usize(params, "n_bins", d.n_bins)?,
                    seed: match params.get("seed") {
                        Some(v) if !v.is_null() => Some(param_usize(params, "seed", 0)? as u64),
                        _ => None,
                    },
                })
            }
        };
        config.validate()?;
        Ok(config)
    }
}

fn param_f64(
    params: &HashMap<String, serde_json::Value>,
    key: &str,
    default: f64,
) -> TtResult<f64> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| invalid(key, "not representable as a float")),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| invalid(key, &format!("'{}': {}", s, e))),
        Some(other) => Err(invalid(key, &format!("expected a number, got {}", other))),
    }
}

fn param_usize(
    params: &HashMap<String, serde_json::Value>,
    key: &str,
    default: usize,
) -> TtResult<usize> {
    let value = param_f64(params, key, default as f64)?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(invalid(
            key,
            &format!("expected a non-negative integer, got {}", value),
        ));
    }
    Ok(value as usize)
}

/// Full configuration for one trial. Immutable once the trial starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TrialConfigFile")]
pub struct TrialConfig {
    pub model: ModelConfig,
    pub input: InputConfig,
    pub dataset_columns: Vec<String>,
    pub label_column: String,
    pub dataset_dtype: Precision,
    pub cv_folds: usize,
    pub test_fraction: f64,
    pub output_artifacts_directory: PathBuf,
    pub model_store_directory: PathBuf,
    /// Overrides accelerator detection when set.
    pub accelerators: Option<usize>,
    pub model_name: String,
}

/// A trial configuration as written on disk. Family and format are loose
/// tags and hyperparameters a free-form mapping, as a search controller
/// emits them.
#[derive(Debug, Deserialize)]
struct TrialConfigFile {
    model: ModelSection,
    input: InputSection,
    dataset_columns: Vec<String>,
    label_column: String,
    #[serde(default)]
    dataset_dtype: Precision,
    #[serde(default = "default_cv_folds")]
    cv_folds: usize,
    #[serde(default = "default_test_fraction")]
    test_fraction: f64,
    #[serde(default = "default_output_dir")]
    output_artifacts_directory: PathBuf,
    #[serde(default = "default_model_store")]
    model_store_directory: PathBuf,
    #[serde(default)]
    accelerators: Option<usize>,
    #[serde(default = "default_model_name")]
    model_name: String,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    model_type: String,
    #[serde(default)]
    model_params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InputSection {
    files: Vec<PathBuf>,
    format: String,
}

impl TryFrom<TrialConfigFile> for TrialConfig {
    type Error = TrialError;

    fn try_from(file: TrialConfigFile) -> Result<Self, Self::Error> {
        Ok(Self {
            model: ModelConfig::from_hyperparameters(
                &file.model.model_type,
                &file.model.model_params,
            )?,
            input: InputConfig {
                files: file.input.files,
                format: file.input.format.parse()?,
            },
            dataset_columns: file.dataset_columns,
            label_column: file.label_column,
            dataset_dtype: file.dataset_dtype,
            cv_folds: file.cv_folds,
            test_fraction: file.test_fraction,
            output_artifacts_directory: file.output_artifacts_directory,
            model_store_directory: file.model_store_directory,
            accelerators: file.accelerators,
            model_name: file.model_name,
        })
    }
}

fn default_cv_folds() -> usize {
    1
}

fn default_test_fraction() -> f64 {
    0.1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_model_store() -> PathBuf {
    PathBuf::from("model")
}

fn default_model_name() -> String {
    "saved_model".to_string()
}

impl TrialConfig {
    pub fn new(
        model: ModelConfig,
        files: Vec<PathBuf>,
        format: InputFormat,
        dataset_columns: Vec<String>,
        label_column: impl Into<String>,
    ) -> Self {
        Self {
            model,
            input: InputConfig { files, format },
            dataset_columns,
            label_column: label_column.into(),
            dataset_dtype: Precision::default(),
            cv_folds: default_cv_folds(),
            test_fraction: default_test_fraction(),
            output_artifacts_directory: default_output_dir(),
            model_store_directory: default_model_store(),
            accelerators: None,
            model_name: default_model_name(),
        }
    }

    pub fn with_cv_folds(mut self, folds: usize) -> Self {
        self.cv_folds = folds;
        self
    }

    pub fn with_dtype(mut self, dtype: Precision) -> Self {
        self.dataset_dtype = dtype;
        self
    }

    pub fn with_test_fraction(mut self, fraction: f64) -> Self {
        self.test_fraction = fraction;
        self
    }

    pub fn with_accelerators(mut self, n: usize) -> Self {
        self.accelerators = Some(n);
        self
    }

    pub fn with_directories(
        mut self,
        output_artifacts: impl Into<PathBuf>,
        model_store: impl Into<PathBuf>,
    ) -> Self {
        self.output_artifacts_directory = output_artifacts.into();
        self.model_store_directory = model_store.into();
        self
    }

    pub fn family(&self) -> ModelFamily {
        self.model.family()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TtResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON document. Unknown model families and input
    /// formats are configuration errors.
    pub fn from_json_str(text: &str) -> TtResult<Self> {
        let file: TrialConfigFile = serde_json::from_str(text)?;
        let config = Self::try_from(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run.
    pub fn validate(&self) -> TtResult<()> {
        self.model.validate()?;
        if self.input.files.is_empty() {
            return Err(config_error!("no input files configured"));
        }
        if self.dataset_columns.is_empty() {
            return Err(config_error!("no dataset columns configured"));
        }
        if !self.dataset_columns.contains(&self.label_column) {
            return Err(config_error!(
                "label column '{}' is not among the dataset columns",
                self.label_column
            ));
        }
        if self.dataset_columns.len() < 2 {
            return Err(config_error!("at least one feature column is required"));
        }
        if self.cv_folds == 0 {
            return Err(config_error!("cv_folds must be at least 1"));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(config_error!(
                "test_fraction must be in (0, 1), got {}",
                self.test_fraction
            ));
        }
        Ok(())
    }
}
