//! Configuration-driven training harness for dense tabular models
//!
//! Trains, validates, checkpoints, exports and batch-scores a classification or
//! regression model whose architecture and optimizer are picked by configuration.

pub mod data;
pub mod model;
pub mod predict;
pub mod run;
pub mod training;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Top-level behaviour of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    #[serde(alias = "savedmodel")]
    Export,
    #[serde(alias = "inference")]
    Infer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Export => write!(f, "export"),
            Mode::Infer => write!(f, "infer"),
        }
    }
}

impl FromStr for Mode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "export" | "savedmodel" => Ok(Mode::Export),
            "infer" | "inference" => Ok(Mode::Infer),
            _ => Err(HarnessError::Configuration(format!(
                "Unknown mode: {}. Use train, export, or infer.",
                s
            ))),
        }
    }
}

/// Selects the loss and the reported metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Classification,
    Regression,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::Classification => write!(f, "classification"),
            Scenario::Regression => write!(f, "regression"),
        }
    }
}

impl FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(Scenario::Classification),
            "regression" => Ok(Scenario::Regression),
            _ => Err(HarnessError::Configuration(format!(
                "Unknown scenario: {}. Use classification or regression.",
                s
            ))),
        }
    }
}

/// On-disk encoding of feature/label records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    /// Length-prefixed little-endian binary frames
    #[serde(rename = "record-binary", alias = "tfrecords")]
    RecordBinary,
    /// One comma-delimited row per record, label in the last column
    #[serde(rename = "delimited-text", alias = "csv")]
    DelimitedText,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::RecordBinary => write!(f, "record-binary"),
            FileFormat::DelimitedText => write!(f, "delimited-text"),
        }
    }
}

impl FromStr for FileFormat {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "record-binary" | "tfrecords" => Ok(FileFormat::RecordBinary),
            "delimited-text" | "csv" => Ok(FileFormat::DelimitedText),
            _ => Err(HarnessError::Configuration(format!(
                "Unknown file format: {}. Use record-binary or delimited-text.",
                s
            ))),
        }
    }
}

/// Model architecture variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Dnn,
    #[serde(alias = "lr")]
    Linear,
    WideAndDeep,
    #[serde(alias = "customized")]
    Custom,
    #[serde(alias = "cnn")]
    Convolutional,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Dnn => write!(f, "dnn"),
            ModelKind::Linear => write!(f, "linear"),
            ModelKind::WideAndDeep => write!(f, "wide_and_deep"),
            ModelKind::Custom => write!(f, "custom"),
            ModelKind::Convolutional => write!(f, "convolutional"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dnn" => Ok(ModelKind::Dnn),
            "linear" | "lr" => Ok(ModelKind::Linear),
            "wide_and_deep" => Ok(ModelKind::WideAndDeep),
            "custom" | "customized" => Ok(ModelKind::Custom),
            "convolutional" | "cnn" => Ok(ModelKind::Convolutional),
            _ => Err(HarnessError::Configuration(format!(
                "Unknown model: {}. Use dnn, linear, wide_and_deep, custom, or convolutional.",
                s
            ))),
        }
    }
}

/// Optimizer variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adadelta,
    Adagrad,
    Adam,
    Ftrl,
    Rmsprop,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adadelta => "adadelta",
            OptimizerKind::Adagrad => "adagrad",
            OptimizerKind::Adam => "adam",
            OptimizerKind::Ftrl => "ftrl",
            OptimizerKind::Rmsprop => "rmsprop",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for OptimizerKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adadelta" => Ok(OptimizerKind::Adadelta),
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "adam" => Ok(OptimizerKind::Adam),
            "ftrl" => Ok(OptimizerKind::Ftrl),
            "rmsprop" => Ok(OptimizerKind::Rmsprop),
            _ => Err(HarnessError::Configuration(format!(
                "Unknown optimizer: {}. Use sgd, adadelta, adagrad, adam, ftrl, or rmsprop.",
                s
            ))),
        }
    }
}

/// Application-wide errors
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot open data source {path}: {message}")]
    StreamInitialization { path: String, message: String },

    #[error("Malformed record {index} in {path}: {message}")]
    Decode {
        path: String,
        index: usize,
        message: String,
    },

    #[error("No checkpoint found in {0}")]
    CheckpointMissing(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("The model exists in path: {0}")]
    ExportConflict(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Tensor data error: {0}")]
    Tensor(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Configuration(_) => 2,
            HarnessError::StreamInitialization { .. } | HarnessError::Pattern(_) => 3,
            HarnessError::Decode { .. } => 4,
            HarnessError::CheckpointMissing(_) => 5,
            HarnessError::ExportConflict(_) => 6,
            _ => 1,
        }
    }
}

impl From<burn::record::RecorderError> for HarnessError {
    fn from(e: burn::record::RecorderError) -> Self {
        HarnessError::Recorder(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Resolved run configuration, loaded from config.toml and CLI overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: Mode,
    pub scenario: Scenario,
    /// Train for throughput only: no validation, checkpoints or export
    pub enable_benchmark: bool,
    pub resume_from_checkpoint: bool,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub feature_size: usize,
    pub label_size: usize,
    pub train_file_format: FileFormat,
    /// Glob pattern of training files
    pub train_file: String,
    /// Glob pattern of validation files
    pub validation_file: String,
    pub inference_file_format: FileFormat,
    pub inference_data_file: String,
    pub inference_result_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// Hidden layer widths, input side first
    pub dnn_struct: Vec<usize>,
    pub enable_bn: bool,
    pub bn_epsilon: f64,
    pub enable_dropout: bool,
    pub dropout_keep_prob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub enable_lr_decay: bool,
    pub lr_decay_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Passes over the training files; zero or negative repeats forever
    pub epoch_number: i64,
    pub train_batch_size: usize,
    pub validation_batch_size: usize,
    pub steps_to_validate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub checkpoint_path: PathBuf,
    /// Monitoring output (metrics.csv)
    pub output_path: PathBuf,
    /// Root of versioned serving exports
    pub model_path: PathBuf,
    pub model_version: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            mode: Mode::Train,
            scenario: Scenario::Classification,
            enable_benchmark: false,
            resume_from_checkpoint: true,
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            feature_size: 9,
            label_size: 2,
            train_file_format: FileFormat::RecordBinary,
            train_file: "./data/cancer/cancer_train.csv.tfrecords".to_string(),
            validation_file: "./data/cancer/cancer_test.csv.tfrecords".to_string(),
            inference_file_format: FileFormat::DelimitedText,
            inference_data_file: "./data/cancer/cancer_test.csv".to_string(),
            inference_result_file: "./inference_result.txt".to_string(),
            shuffle_seed: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            kind: ModelKind::Dnn,
            dnn_struct: vec![128, 32, 8],
            enable_bn: false,
            bn_epsilon: 0.001,
            enable_dropout: false,
            dropout_keep_prob: 0.5,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            kind: OptimizerKind::Adagrad,
            learning_rate: 0.01,
            enable_lr_decay: false,
            lr_decay_rate: 0.96,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epoch_number: 100,
            train_batch_size: 64,
            validation_batch_size: 64,
            steps_to_validate: 10,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            checkpoint_path: PathBuf::from("./checkpoint/"),
            output_path: PathBuf::from("./tensorboard/"),
            model_path: PathBuf::from("./model/"),
            model_version: 1,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HarnessError::Configuration(format!("Failed to parse config: {}", e)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            HarnessError::Configuration(format!("Failed to serialize config: {}", e))
        })
    }

    /// Reject nonsensical values before any data or checkpoint I/O happens
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(HarnessError::Configuration(msg));

        if self.data.feature_size == 0 {
            return invalid("feature_size must be positive".to_string());
        }
        if self.data.label_size == 0 {
            return invalid("label_size must be positive".to_string());
        }
        if self.scenario == Scenario::Classification && self.data.label_size < 2 {
            return invalid(format!(
                "classification needs at least 2 labels, got label_size={}",
                self.data.label_size
            ));
        }
        if self.training.train_batch_size == 0 || self.training.validation_batch_size == 0 {
            return invalid("batch sizes must be positive".to_string());
        }
        if self.training.steps_to_validate == 0 {
            return invalid("steps_to_validate must be positive".to_string());
        }
        let lr = self.optimizer.learning_rate;
        if !lr.is_finite() || lr <= 0.0 {
            return invalid(format!("learning_rate must be positive, got {}", lr));
        }
        if self.optimizer.enable_lr_decay {
            let rate = self.optimizer.lr_decay_rate;
            if !rate.is_finite() || rate <= 0.0 {
                return invalid(format!("lr_decay_rate must be positive, got {}", rate));
            }
        }
        if self.model.enable_bn && self.model.bn_epsilon <= 0.0 {
            return invalid(format!(
                "bn_epsilon must be positive, got {}",
                self.model.bn_epsilon
            ));
        }
        if self.model.enable_dropout {
            let keep = self.model.dropout_keep_prob;
            if !(keep > 0.0 && keep <= 1.0) {
                return invalid(format!("dropout_keep_prob must be in (0, 1], got {}", keep));
            }
        }
        let needs_hidden = matches!(
            self.model.kind,
            ModelKind::Dnn | ModelKind::WideAndDeep | ModelKind::Custom
        );
        if needs_hidden
            && (self.model.dnn_struct.is_empty() || self.model.dnn_struct.contains(&0))
        {
            return invalid(format!(
                "dnn_struct must list positive layer widths for the {} model, got {:?}",
                self.model.kind, self.model.dnn_struct
            ));
        }

        Ok(())
    }

    /// Epoch count for the pipeline; `None` repeats forever
    pub fn epochs(&self) -> Option<usize> {
        if self.training.epoch_number <= 0 {
            None
        } else {
            Some(self.training.epoch_number as usize)
        }
    }
}

/// Parse a whitespace separated layer list such as "128 32 8"
pub fn parse_dnn_struct(s: &str) -> Result<Vec<usize>> {
    s.split_whitespace()
        .map(|part| {
            part.parse::<usize>().map_err(|_| {
                HarnessError::Configuration(format!("Invalid dnn_struct entry: {}", part))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, Mode::Train);
        assert_eq!(config.optimizer.kind, OptimizerKind::Adagrad);
        assert_eq!(config.epochs(), Some(100));
    }

    #[test]
    fn test_unknown_names_are_configuration_errors() {
        assert!(matches!(
            "savedmodel".parse::<Mode>(),
            Ok(Mode::Export)
        ));
        assert!(matches!(
            "serve".parse::<Mode>(),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            "ranking".parse::<Scenario>(),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            "lbfgs".parse::<OptimizerKind>(),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            "transformer".parse::<ModelKind>(),
            Err(HarnessError::Configuration(_))
        ));
        assert_eq!("cnn".parse::<ModelKind>().unwrap(), ModelKind::Convolutional);
        assert_eq!("csv".parse::<FileFormat>().unwrap(), FileFormat::DelimitedText);
    }

    #[test]
    fn test_toml_rejects_unknown_optimizer() {
        let err = RunConfig::from_toml_str("[optimizer]\nkind = \"lbfgs\"\n").unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_toml_accepts_reference_spellings() {
        let config = RunConfig::from_toml_str(
            r#"
mode = "inference"

[data]
train_file_format = "tfrecords"

[model]
kind = "customized"
"#,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Infer);
        assert_eq!(config.data.train_file_format, FileFormat::RecordBinary);
        assert_eq!(config.model.kind, ModelKind::Custom);
        // Untouched sections keep their defaults
        assert_eq!(config.training.steps_to_validate, 10);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = RunConfig::default();
        config.data.shuffle_seed = Some(7);
        config.model.kind = ModelKind::WideAndDeep;
        let parsed = RunConfig::from_toml_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.model.kind, ModelKind::WideAndDeep);
        assert_eq!(parsed.data.shuffle_seed, Some(7));
        assert_eq!(parsed.model.dnn_struct, vec![128, 32, 8]);
    }

    #[test]
    fn test_validate_rejects_bad_dimensions() {
        let mut config = RunConfig::default();
        config.data.feature_size = 0;
        assert!(matches!(
            config.validate(),
            Err(HarnessError::Configuration(_))
        ));

        let mut config = RunConfig::default();
        config.data.label_size = 1;
        assert!(config.validate().is_err());

        config.scenario = Scenario::Regression;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_dnn_struct() {
        let mut config = RunConfig::default();
        config.model.dnn_struct.clear();
        assert!(config.validate().is_err());

        // The linear model has no hidden layers to describe
        config.model.kind = ModelKind::Linear;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_infinite_epochs() {
        let mut config = RunConfig::default();
        config.training.epoch_number = 0;
        assert_eq!(config.epochs(), None);
        config.training.epoch_number = -1;
        assert_eq!(config.epochs(), None);
    }

    #[test]
    fn test_parse_dnn_struct() {
        assert_eq!(parse_dnn_struct("128 32 8").unwrap(), vec![128, 32, 8]);
        assert!(parse_dnn_struct("128 x").is_err());
    }
}
