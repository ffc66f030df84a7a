//! Configuration structures for the Taskwright system
//!
//! Every pluggable component is described by a [`ComponentConfig`]: a `type`
//! tag naming the registered implementation plus that implementation's own
//! parameters. The tag is resolved by the [`crate::registry`] at assembly time
//! and the parameters are decoded by the chosen implementation.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Top-level configuration of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Task assembly configuration
    pub task: TaskConfig,

    /// Place the model on a GPU when one is available
    #[serde(default)]
    pub use_cuda_if_available: bool,

    /// GPU ordinal used when CUDA is enabled
    #[serde(default)]
    pub cuda_device_id: usize,

    /// Number of shards for distributed training
    #[serde(default = "default_world_size")]
    pub distributed_world_size: usize,

    /// Snapshot to restore metadata and model state from
    #[serde(default)]
    pub load_snapshot_path: Option<PathBuf>,

    /// Where the trained snapshot is written
    #[serde(default = "default_snapshot_path")]
    pub save_snapshot_path: PathBuf,

    /// Where the exported model is written after training
    #[serde(default)]
    pub export_path: Option<PathBuf>,

    /// Where test metrics are written
    #[serde(default)]
    pub test_out_path: Option<PathBuf>,

    /// Seed for batch shuffling
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_world_size() -> usize {
    1
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("model.snapshot")
}

impl RunConfig {
    /// Create a run configuration with defaults around a task config
    pub fn new(task: TaskConfig) -> Self {
        Self {
            task,
            use_cuda_if_available: false,
            cuda_device_id: 0,
            distributed_world_size: default_world_size(),
            load_snapshot_path: None,
            save_snapshot_path: default_snapshot_path(),
            export_path: None,
            test_out_path: None,
            random_seed: None,
        }
    }

    /// Load configuration from a file (JSON by extension, YAML otherwise)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file (JSON by extension, YAML otherwise)
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.distributed_world_size == 0 {
            return Err(Error::config("distributed_world_size must be > 0"));
        }

        self.task.validate()
    }
}

/// Configuration of a task and all of its components
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Task variant tag
    #[serde(rename = "type", default = "default_task_type")]
    pub type_name: String,

    /// Input feature settings
    #[serde(default)]
    pub features: FeatureConfig,

    /// Featurizer component
    #[serde(default = "default_featurizer")]
    pub featurizer: ComponentConfig,

    /// Data handler component
    pub data_handler: ComponentConfig,

    /// Label settings
    #[serde(default)]
    pub labels: LabelConfig,

    /// Model component
    #[serde(default = "default_model")]
    pub model: ComponentConfig,

    /// Metric reporter component
    #[serde(default = "default_metric_reporter")]
    pub metric_reporter: ComponentConfig,

    /// Trainer component
    #[serde(default = "default_trainer")]
    pub trainer: ComponentConfig,

    /// Optimizer component
    #[serde(default = "default_optimizer")]
    pub optimizer: ComponentConfig,

    /// Learning rate scheduling, absent for a constant rate
    #[serde(default = "default_scheduler")]
    pub scheduler: Option<SchedulerConfig>,

    /// Exporter component, absent when the task does not export
    #[serde(default)]
    pub exporter: Option<ComponentConfig>,
}

fn default_task_type() -> String {
    "Task".to_string()
}

fn default_featurizer() -> ComponentConfig {
    ComponentConfig::new("SimpleFeaturizer")
}

fn default_model() -> ComponentConfig {
    ComponentConfig::new("DocModel")
}

fn default_metric_reporter() -> ComponentConfig {
    ComponentConfig::new("ClassificationMetricReporter")
}

fn default_trainer() -> ComponentConfig {
    ComponentConfig::new("Trainer")
}

fn default_optimizer() -> ComponentConfig {
    ComponentConfig::new("Adam")
}

fn default_scheduler() -> Option<SchedulerConfig> {
    Some(SchedulerConfig::None)
}

impl TaskConfig {
    /// Create a task configuration with default components around a data handler
    pub fn new(data_handler: ComponentConfig) -> Self {
        Self {
            type_name: default_task_type(),
            features: FeatureConfig::default(),
            featurizer: default_featurizer(),
            data_handler,
            labels: LabelConfig::default(),
            model: default_model(),
            metric_reporter: default_metric_reporter(),
            trainer: default_trainer(),
            optimizer: default_optimizer(),
            scheduler: default_scheduler(),
            exporter: None,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let components = [
            ("featurizer", &self.featurizer),
            ("data_handler", &self.data_handler),
            ("model", &self.model),
            ("metric_reporter", &self.metric_reporter),
            ("trainer", &self.trainer),
            ("optimizer", &self.optimizer),
        ];
        for (field, component) in components {
            if component.type_name.trim().is_empty() {
                return Err(Error::config(format!("{} type must not be empty", field)));
            }
        }

        if self.features.word_feat.embed_dim == 0 {
            return Err(Error::config("word_feat.embed_dim must be > 0"));
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.validate()?;
        }

        Ok(())
    }
}

/// Declarative reference to a registered component
///
/// Serialized flat: `{"type": "DocModel", "hidden_dim": 64}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentConfig {
    /// Registered implementation tag
    #[serde(rename = "type")]
    pub type_name: String,

    /// Implementation-specific parameters
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ComponentConfig {
    /// Create a component config with no parameters
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Decode the parameters into the implementation's typed config
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| {
            Error::config(format!("invalid parameters for '{}': {}", self.type_name, e))
        })
    }
}

/// Input feature settings shared by featurizer, data handler, model and exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    /// Word token feature
    pub word_feat: WordFeatConfig,
}

/// Word token feature settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WordFeatConfig {
    /// Embedding dimension
    pub embed_dim: usize,
    /// Minimum token frequency to enter the vocabulary
    pub min_freq: usize,
    /// Maximum vocabulary size (most frequent tokens kept)
    pub max_vocab_size: Option<usize>,
    /// Maximum tokens kept per example
    pub max_seq_len: Option<usize>,
}

impl Default for WordFeatConfig {
    fn default() -> Self {
        Self {
            embed_dim: 100,
            min_freq: 1,
            max_vocab_size: None,
            max_seq_len: None,
        }
    }
}

/// Label settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelConfig {
    /// Output name of the label
    pub name: String,
    /// Column holding the label in raw examples
    pub column: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            name: "doc_label".to_string(),
            column: "label".to_string(),
        }
    }
}

/// Learning rate scheduling strategies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    /// Constant learning rate
    None,
    /// Multiply by `gamma` every `step_size` epochs
    StepLr {
        /// Epochs between decays
        #[serde(default = "default_step_size")]
        step_size: usize,
        /// Decay factor
        #[serde(default = "default_gamma")]
        gamma: f64,
    },
    /// Multiply by `gamma` every epoch
    Exponential {
        /// Decay factor
        #[serde(default = "default_gamma")]
        gamma: f64,
    },
    /// Cosine annealing over `t_max` batches
    CosineAnnealing {
        /// Half period in batches
        #[serde(default = "default_t_max")]
        t_max: usize,
        /// Floor of the learning rate
        #[serde(default)]
        eta_min: f64,
    },
    /// Reduce when the model selection metric stops improving
    ReduceLrOnPlateau {
        /// Epochs without improvement before reducing
        #[serde(default = "default_patience")]
        patience: usize,
        /// Reduction factor
        #[serde(default = "default_factor")]
        factor: f64,
        /// Minimum change counted as an improvement
        #[serde(default = "default_threshold")]
        threshold: f64,
        /// Floor of the learning rate
        #[serde(default)]
        min_lr: f64,
    },
}

fn default_step_size() -> usize {
    30
}

fn default_gamma() -> f64 {
    0.1
}

fn default_t_max() -> usize {
    1000
}

fn default_patience() -> usize {
    5
}

fn default_factor() -> f64 {
    0.1
}

fn default_threshold() -> f64 {
    1e-4
}

impl SchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self {
            SchedulerConfig::None => Ok(()),
            SchedulerConfig::StepLr { step_size, gamma } => {
                if *step_size == 0 {
                    return Err(Error::config("step_lr step_size must be > 0"));
                }
                check_decay(*gamma)
            }
            SchedulerConfig::Exponential { gamma } => check_decay(*gamma),
            SchedulerConfig::CosineAnnealing { t_max, eta_min } => {
                if *t_max == 0 {
                    return Err(Error::config("cosine_annealing t_max must be > 0"));
                }
                if *eta_min < 0.0 {
                    return Err(Error::config("cosine_annealing eta_min must be >= 0"));
                }
                Ok(())
            }
            SchedulerConfig::ReduceLrOnPlateau { factor, min_lr, .. } => {
                if *factor <= 0.0 || *factor >= 1.0 {
                    return Err(Error::config("reduce_lr_on_plateau factor must be in (0, 1)"));
                }
                if *min_lr < 0.0 {
                    return Err(Error::config("reduce_lr_on_plateau min_lr must be >= 0"));
                }
                Ok(())
            }
        }
    }
}

fn check_decay(gamma: f64) -> Result<()> {
    if gamma <= 0.0 || gamma > 1.0 {
        return Err(Error::config("scheduler gamma must be in (0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Default)]
    #[serde(default, deny_unknown_fields)]
    struct ToyParams {
        width: usize,
    }

    #[test]
    fn test_component_config_flat_serde() {
        let json = r#"{"type": "DocModel", "hidden_dim": 64}"#;
        let config: ComponentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.type_name, "DocModel");
        assert_eq!(config.params.get("hidden_dim"), Some(&Value::from(64)));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["type"], "DocModel");
        assert_eq!(back["hidden_dim"], 64);
    }

    #[test]
    fn test_params_rejects_unknown_fields() {
        let config = ComponentConfig::new("Toy").with_param("depth", 3);
        let err = config.params::<ToyParams>().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("Toy"));

        let ok = ComponentConfig::new("Toy").with_param("width", 3);
        assert_eq!(ok.params::<ToyParams>().unwrap().width, 3);
    }

    #[test]
    fn test_task_config_defaults() {
        let yaml = "data_handler:\n  type: DocClassificationDataHandler\n";
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.type_name, "Task");
        assert_eq!(config.featurizer.type_name, "SimpleFeaturizer");
        assert_eq!(config.model.type_name, "DocModel");
        assert_eq!(config.trainer.type_name, "Trainer");
        assert_eq!(config.optimizer.type_name, "Adam");
        assert_eq!(config.scheduler, Some(SchedulerConfig::None));
        assert!(config.exporter.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_scheduler_config_tagging() {
        let json = r#"{"type": "reduce_lr_on_plateau", "patience": 2}"#;
        let config: SchedulerConfig = serde_json::from_str(json).unwrap();
        match config {
            SchedulerConfig::ReduceLrOnPlateau { patience, factor, .. } => {
                assert_eq!(patience, 2);
                assert_eq!(factor, 0.1);
            }
            other => panic!("unexpected scheduler {:?}", other),
        }
    }

    #[test]
    fn test_invalid_scheduler_rejected() {
        let config = SchedulerConfig::StepLr { step_size: 0, gamma: 0.5 };
        assert!(config.validate().is_err());
        let config = SchedulerConfig::Exponential { gamma: 1.5 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new(TaskConfig::new(ComponentConfig::new("DocClassificationDataHandler")));
        config.distributed_world_size = 2;

        for name in ["run.json", "run.yaml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = RunConfig::from_file(&path).unwrap();
            assert_eq!(loaded.task, config.task);
            assert_eq!(loaded.distributed_world_size, 2);
        }
    }

    #[test]
    fn test_zero_world_size_rejected() {
        let mut config = RunConfig::new(TaskConfig::new(ComponentConfig::new("X")));
        config.distributed_world_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());
    }
}
