//! Bag-of-embeddings document classifier

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{load_varmap_state, varmap_state, Model, ModelState};
use crate::config::{ComponentConfig, FeatureConfig};
use crate::data::{Metadata, WORD_FEATURE};
use crate::error::{Error, Result};

/// Parameters of [`DocModel`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DocModelConfig {
    /// Hidden layer between pooling and classifier
    pub hidden_dim: Option<usize>,
    /// Dropout on the pooled representation
    pub dropout: f32,
}

impl Default for DocModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: None,
            dropout: 0.1,
        }
    }
}

/// Mean-pooled word embeddings followed by a linear classifier
///
/// Inputs are `[tokens: u32 (batch, seq), mask: f32 (batch, seq)]`.
pub struct DocModel {
    config: DocModelConfig,
    vocab_size: usize,
    embed_dim: usize,
    num_labels: usize,
    varmap: VarMap,
    embedding: Embedding,
    hidden: Option<Linear>,
    classifier: Linear,
    device: Device,
    training: bool,
}

impl DocModel {
    /// Create a freshly initialized model
    pub fn new(
        config: DocModelConfig,
        vocab_size: usize,
        embed_dim: usize,
        num_labels: usize,
        device: &Device,
    ) -> Result<Self> {
        if vocab_size == 0 || embed_dim == 0 || num_labels == 0 {
            return Err(Error::config(
                "DocModel needs a non-empty vocabulary, embed_dim and label space",
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(Error::config("DocModel dropout must be in [0, 1)"));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedding = candle_nn::embedding(vocab_size, embed_dim, vb.pp("embedding"))?;
        let (hidden, classifier_in) = match config.hidden_dim {
            Some(dim) => (Some(candle_nn::linear(embed_dim, dim, vb.pp("hidden"))?), dim),
            None => (None, embed_dim),
        };
        let classifier = candle_nn::linear(classifier_in, num_labels, vb.pp("classifier"))?;

        Ok(Self {
            config,
            vocab_size,
            embed_dim,
            num_labels,
            varmap,
            embedding,
            hidden,
            classifier,
            device: device.clone(),
            training: true,
        })
    }

    /// Build from a component config and metadata
    pub fn from_config(
        config: &ComponentConfig,
        features: &FeatureConfig,
        metadata: Arc<Metadata>,
    ) -> Result<Self> {
        let vocab_size = metadata
            .feature(WORD_FEATURE)
            .map(|m| m.vocab_size())
            .ok_or_else(|| Error::config("DocModel requires word feature metadata"))?;

        Self::new(
            config.params()?,
            vocab_size,
            features.word_feat.embed_dim,
            metadata.target.vocab_size(),
            &Device::Cpu,
        )
    }

    /// Number of output classes
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }
}

impl Model for DocModel {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let (tokens, mask) = match inputs {
            [tokens, mask] => (tokens, mask),
            _ => {
                return Err(Error::model(format!(
                    "DocModel expects [tokens, mask], got {} inputs",
                    inputs.len()
                )))
            }
        };

        let embedded = self.embedding.forward(tokens)?;
        let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = embedded.broadcast_mul(&mask)?.sum(1)?;
        let lengths = mask.sum(1)?.clamp(1f32, f32::MAX)?;
        let mut pooled = summed.broadcast_div(&lengths)?;

        if self.training && self.config.dropout > 0.0 {
            pooled = candle_nn::ops::dropout(&pooled, self.config.dropout)?;
        }
        if let Some(hidden) = &self.hidden {
            pooled = hidden.forward(&pooled)?.relu()?;
        }

        Ok(self.classifier.forward(&pooled)?)
    }

    fn get_loss(&self, output: &Tensor, targets: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::cross_entropy(output, targets)?)
    }

    fn get_pred(&self, output: &Tensor) -> Result<(Vec<usize>, Vec<Vec<f32>>)> {
        let scores = candle_nn::ops::softmax(output, D::Minus1)?.to_vec2::<f32>()?;
        let predictions = output
            .argmax(D::Minus1)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|i| i as usize)
            .collect();
        Ok((predictions, scores))
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        load_varmap_state(&self.varmap, state)
    }

    fn state_dict(&self) -> Result<ModelState> {
        varmap_state(&self.varmap)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }

        debug!("Moving DocModel to {:?}", device);
        let state = self.state_dict()?;
        let mut moved = Self::new(
            self.config.clone(),
            self.vocab_size,
            self.embed_dim,
            self.num_labels,
            device,
        )?;
        moved.load_state_dict(&state)?;
        moved.training = self.training;
        *self = moved;
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn train_mode(&mut self) {
        self.training = true;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> &VarMap {
        &self.varmap
    }
}
