//! Model export and graph visualization sinks
//!
//! An [`Exporter`] writes a trained model into a deployable artifact. The
//! built-in [`SafetensorsExporter`] writes the weights as safetensors next to
//! a JSON manifest describing the expected inputs, vocabularies and labels.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ComponentConfig, FeatureConfig, LabelConfig};
use crate::data::{Metadata, ModelInputs, WORD_FEATURE};
use crate::error::{Error, Result};
use crate::models::{save_state, Model};

/// Writes a model into a deployable artifact
pub trait Exporter: Send {
    /// Export `model` to `path`
    fn export_model(&self, model: &dyn Model, path: &Path) -> Result<()>;

    /// Inputs with the shapes the model expects, used to trace its graph
    fn dummy_model_input(&self, device: &Device) -> Result<ModelInputs>;
}

/// Sink receiving a model graph for visualization
pub trait GraphWriter {
    /// Record the graph of `model` traced with `inputs`
    fn add_graph(&mut self, model: &dyn Model, inputs: &ModelInputs) -> Result<()>;
}

/// Parameters of [`SafetensorsExporter`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SafetensorsExporterConfig {
    /// Sequence length of the dummy input
    pub dummy_seq_len: usize,
    /// Write the manifest next to the weights
    pub write_manifest: bool,
}

impl Default for SafetensorsExporterConfig {
    fn default() -> Self {
        Self {
            dummy_seq_len: 8,
            write_manifest: true,
        }
    }
}

/// Description of an exported model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Model type tag
    pub model_type: String,
    /// Names of the forward inputs, in order
    pub input_names: Vec<String>,
    /// Output name of the label
    pub output_name: String,
    /// Word vocabulary
    pub vocab: Vec<String>,
    /// Label vocabulary
    pub labels: Vec<String>,
    /// Shape of every exported parameter
    pub parameters: BTreeMap<String, Vec<usize>>,
}

/// Exports model weights as safetensors plus a JSON manifest
#[derive(Debug)]
pub struct SafetensorsExporter {
    config: SafetensorsExporterConfig,
    model_type: String,
    output_name: String,
    metadata: Arc<Metadata>,
}

impl SafetensorsExporter {
    /// Create an exporter
    pub fn new(
        config: SafetensorsExporterConfig,
        model_type: impl Into<String>,
        output_name: impl Into<String>,
        metadata: Arc<Metadata>,
    ) -> Result<Self> {
        if config.dummy_seq_len == 0 {
            return Err(Error::config("dummy_seq_len must be > 0"));
        }
        if metadata.feature(WORD_FEATURE).is_none() {
            return Err(Error::config("SafetensorsExporter requires word feature metadata"));
        }

        Ok(Self {
            config,
            model_type: model_type.into(),
            output_name: output_name.into(),
            metadata,
        })
    }

    /// Build from a component config
    pub fn from_config(
        config: &ComponentConfig,
        _features: &FeatureConfig,
        labels: &LabelConfig,
        metadata: Arc<Metadata>,
        model_config: &ComponentConfig,
    ) -> Result<Self> {
        Self::new(config.params()?, model_config.type_name.clone(), labels.name.clone(), metadata)
    }

    /// Path of the manifest written next to `weights`
    ///
    /// The suffix is appended to the full file name, so the manifest never
    /// replaces the weights whatever their extension.
    pub fn manifest_path(weights: &Path) -> PathBuf {
        let mut name = weights.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".manifest.json");
        weights.with_file_name(name)
    }

    fn manifest(&self, model: &dyn Model) -> Result<ExportManifest> {
        let parameters = model
            .state_dict()?
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec()))
            .collect();
        let vocab = self
            .metadata
            .feature(WORD_FEATURE)
            .map(|m| m.vocab.clone())
            .unwrap_or_default();

        Ok(ExportManifest {
            model_type: self.model_type.clone(),
            input_names: vec!["tokens".to_string(), "mask".to_string()],
            output_name: self.output_name.clone(),
            vocab,
            labels: self.metadata.target.vocab.clone(),
            parameters,
        })
    }
}

impl Exporter for SafetensorsExporter {
    fn export_model(&self, model: &dyn Model, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let state = model.state_dict()?;
        if state.is_empty() {
            return Err(Error::export("model has no parameters to export"));
        }
        save_state(&state, path)?;

        if self.config.write_manifest {
            let manifest_path = Self::manifest_path(path);
            std::fs::write(&manifest_path, serde_json::to_string_pretty(&self.manifest(model)?)?)?;
        }

        info!("Exported {} parameters to {}", state.len(), path.display());
        Ok(())
    }

    fn dummy_model_input(&self, device: &Device) -> Result<ModelInputs> {
        let seq_len = self.config.dummy_seq_len;
        Ok(vec![
            Tensor::zeros((1, seq_len), DType::U32, device)?,
            Tensor::ones((1, seq_len), DType::F32, device)?,
        ])
    }
}

/// Graph summary written to a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    /// Shape of every input
    pub inputs: Vec<Vec<usize>>,
    /// Shape of every parameter
    pub parameters: BTreeMap<String, Vec<usize>>,
    /// Shape of the forward output
    pub output: Vec<usize>,
}

/// [`GraphWriter`] that records input, parameter and output shapes as JSON
pub struct JsonGraphWriter {
    path: PathBuf,
}

impl JsonGraphWriter {
    /// Write graphs to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GraphWriter for JsonGraphWriter {
    fn add_graph(&mut self, model: &dyn Model, inputs: &ModelInputs) -> Result<()> {
        let output = model.forward(inputs)?;
        let summary = GraphSummary {
            inputs: inputs.iter().map(|t| t.dims().to_vec()).collect(),
            parameters: model
                .state_dict()?
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec()))
                .collect(),
            output: output.dims().to_vec(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&summary)?)?;
        Ok(())
    }
}
