//! Data handler for document classification from JSON lines files
//!
//! Every line of a data file is a JSON object holding a text column and, for
//! labeled data, a label column.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{
    Batch, BatchContext, BatchIterator, DataHandler, FieldMeta, Featurizer, Metadata,
    ModelInputs, RawExample, WORD_FEATURE,
};
use crate::config::{ComponentConfig, FeatureConfig, LabelConfig};
use crate::error::{Error, Result};

/// Parameters of [`DocClassificationDataHandler`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DocClassificationDataHandlerConfig {
    /// Training data file
    pub train_path: Option<PathBuf>,
    /// Evaluation data file
    pub eval_path: Option<PathBuf>,
    /// Test data file
    pub test_path: Option<PathBuf>,
    /// Column holding the text
    pub text_column: String,
    /// Training batch size
    pub train_batch_size: usize,
    /// Evaluation batch size
    pub eval_batch_size: usize,
    /// Test batch size
    pub test_batch_size: usize,
    /// Group examples of similar length, longest first
    pub sort_by_length: bool,
    /// Padding token
    pub pad_token: String,
    /// Unknown token
    pub unk_token: String,
}

impl Default for DocClassificationDataHandlerConfig {
    fn default() -> Self {
        Self {
            train_path: None,
            eval_path: None,
            test_path: None,
            text_column: "text".to_string(),
            train_batch_size: 128,
            eval_batch_size: 128,
            test_batch_size: 128,
            sort_by_length: true,
            pad_token: "<pad>".to_string(),
            unk_token: "<unk>".to_string(),
        }
    }
}

/// A featurized example ready for batching
struct Numberized {
    position: usize,
    token_ids: Vec<u32>,
    label: Option<u32>,
}

/// JSON lines document classification data
pub struct DocClassificationDataHandler {
    config: DocClassificationDataHandlerConfig,
    features: FeatureConfig,
    labels: LabelConfig,
    featurizer: Arc<dyn Featurizer>,
    metadata: Option<Arc<Metadata>>,
    test_path: Option<PathBuf>,
}

impl DocClassificationDataHandler {
    /// Create a data handler
    pub fn new(
        config: DocClassificationDataHandlerConfig,
        features: FeatureConfig,
        labels: LabelConfig,
        featurizer: Arc<dyn Featurizer>,
    ) -> Result<Self> {
        if config.train_batch_size == 0 || config.eval_batch_size == 0 || config.test_batch_size == 0 {
            return Err(Error::config("batch sizes must be > 0"));
        }
        if config.pad_token == config.unk_token {
            return Err(Error::config("pad_token and unk_token must differ"));
        }

        let test_path = config.test_path.clone();
        Ok(Self {
            config,
            features,
            labels,
            featurizer,
            metadata: None,
            test_path,
        })
    }

    /// Build from a component config
    pub fn from_config(
        config: &ComponentConfig,
        features: &FeatureConfig,
        labels: &LabelConfig,
        featurizer: Arc<dyn Featurizer>,
    ) -> Result<Self> {
        Self::new(config.params()?, features.clone(), labels.clone(), featurizer)
    }

    fn read_examples(path: &Path) -> Result<Vec<RawExample>> {
        let content = std::fs::read_to_string(path)?;
        let mut examples = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line)? {
                Value::Object(map) => examples.push(map),
                _ => {
                    return Err(Error::data_handler(format!(
                        "{}:{}: expected a JSON object",
                        path.display(),
                        line_no + 1
                    )))
                }
            }
        }

        debug!("Read {} examples from {}", examples.len(), path.display());
        Ok(examples)
    }

    fn text<'a>(&self, example: &'a RawExample) -> Result<&'a str> {
        example
            .get(&self.config.text_column)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::data_handler(format!("missing text column '{}'", self.config.text_column))
            })
    }

    fn label(&self, example: &RawExample) -> Result<String> {
        match example.get(&self.labels.column) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            _ => Err(Error::data_handler(format!(
                "missing label column '{}'",
                self.labels.column
            ))),
        }
    }

    fn require_metadata(&self) -> Result<&Metadata> {
        self.metadata
            .as_deref()
            .ok_or_else(|| Error::data_handler("metadata not initialized; call init_metadata or load_metadata"))
    }

    fn build_metadata(&self, examples: &[RawExample]) -> Result<Metadata> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut label_set = BTreeSet::new();

        for example in examples {
            let featurized = self.featurizer.featurize(self.text(example)?)?;
            for token in featurized.tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
            label_set.insert(self.label(example)?);
        }

        if label_set.is_empty() {
            return Err(Error::data_handler("training data contains no labels"));
        }

        let word = &self.features.word_feat;
        let mut tokens: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(token, freq)| {
                *freq >= word.min_freq && *token != self.config.pad_token && *token != self.config.unk_token
            })
            .collect();
        tokens.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(max) = word.max_vocab_size {
            tokens.truncate(max);
        }

        let mut vocab = vec![self.config.pad_token.clone(), self.config.unk_token.clone()];
        vocab.extend(tokens.into_iter().map(|(token, _)| token));

        let mut features = BTreeMap::new();
        features.insert(WORD_FEATURE.to_string(), FieldMeta::new(vocab, Some(0), Some(1)));

        Ok(Metadata {
            features,
            target: FieldMeta::new(label_set.into_iter().collect(), None, None),
        })
    }

    fn numberize(&self, examples: &[RawExample], labeled: bool) -> Result<Vec<Numberized>> {
        let metadata = self.require_metadata()?;
        let word_meta = metadata
            .feature(WORD_FEATURE)
            .ok_or_else(|| Error::data_handler("metadata has no word feature"))?;
        let unk = word_meta.unk_token_idx.unwrap_or(0) as u32;
        let stoi = word_meta.stoi();
        let label_stoi = metadata.target.stoi();

        examples
            .iter()
            .enumerate()
            .map(|(position, example)| {
                let featurized = self.featurizer.featurize(self.text(example)?)?;
                let mut token_ids: Vec<u32> = featurized
                    .tokens
                    .iter()
                    .map(|t| stoi.get(t.as_str()).map(|&i| i as u32).unwrap_or(unk))
                    .collect();
                if token_ids.is_empty() {
                    token_ids.push(unk);
                }

                let label = if labeled {
                    let label = self.label(example)?;
                    let idx = label_stoi
                        .get(label.as_str())
                        .ok_or_else(|| Error::data_handler(format!("unknown label '{}'", label)))?;
                    Some(*idx as u32)
                } else {
                    None
                };

                Ok(Numberized {
                    position,
                    token_ids,
                    label,
                })
            })
            .collect()
    }

    fn order(&self, mut rows: Vec<Numberized>) -> Vec<Numberized> {
        if self.config.sort_by_length {
            rows.sort_by(|a, b| b.token_ids.len().cmp(&a.token_ids.len()));
        }
        rows
    }

    fn tensorize(&self, rows: &[Numberized]) -> Result<(ModelInputs, Option<Tensor>, BatchContext)> {
        let pad = self
            .require_metadata()?
            .feature(WORD_FEATURE)
            .and_then(|m| m.pad_token_idx)
            .unwrap_or(0) as u32;
        let batch_size = rows.len();
        let max_len = rows.iter().map(|r| r.token_ids.len()).max().unwrap_or(1);

        let mut tokens = Vec::with_capacity(batch_size * max_len);
        let mut mask = Vec::with_capacity(batch_size * max_len);
        for row in rows {
            tokens.extend_from_slice(&row.token_ids);
            mask.extend(std::iter::repeat(1f32).take(row.token_ids.len()));
            let padding = max_len - row.token_ids.len();
            tokens.extend(std::iter::repeat(pad).take(padding));
            mask.extend(std::iter::repeat(0f32).take(padding));
        }

        let inputs = vec![
            Tensor::from_vec(tokens, (batch_size, max_len), &Device::Cpu)?,
            Tensor::from_vec(mask, (batch_size, max_len), &Device::Cpu)?,
        ];

        let labels: Option<Vec<u32>> = rows.iter().map(|r| r.label).collect();
        let targets = match labels {
            Some(labels) => Some(Tensor::from_vec(labels, batch_size, &Device::Cpu)?),
            None => None,
        };

        let context = BatchContext::with_index(rows.iter().map(|r| r.position).collect());
        Ok((inputs, targets, context))
    }

    fn batches(&self, examples: &[RawExample], batch_size: usize) -> Result<BatchIterator> {
        let rows = self.order(self.numberize(examples, true)?);
        let batches = rows
            .chunks(batch_size)
            .map(|chunk| {
                let (inputs, targets, context) = self.tensorize(chunk)?;
                Ok(Batch {
                    inputs,
                    targets,
                    context,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchIterator::new(batches))
    }

    fn required_path<'a>(path: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
        path.as_deref()
            .ok_or_else(|| Error::config(format!("{} is not configured", name)))
    }
}

impl DataHandler for DocClassificationDataHandler {
    fn load_metadata(&mut self, metadata: Metadata) -> Result<()> {
        if metadata.feature(WORD_FEATURE).is_none() {
            return Err(Error::data_handler("metadata has no word feature"));
        }
        self.metadata = Some(Arc::new(metadata));
        Ok(())
    }

    #[instrument(skip(self))]
    fn init_metadata(&mut self) -> Result<()> {
        let path = Self::required_path(&self.config.train_path, "train_path")?;
        let examples = Self::read_examples(path)?;
        let metadata = self.build_metadata(&examples)?;

        info!(
            "Built metadata: {} tokens, {} labels",
            metadata.feature(WORD_FEATURE).map(FieldMeta::vocab_size).unwrap_or(0),
            metadata.target.vocab_size()
        );
        self.metadata = Some(Arc::new(metadata));
        Ok(())
    }

    fn metadata(&self) -> Result<Arc<Metadata>> {
        self.require_metadata()?;
        self.metadata
            .clone()
            .ok_or_else(|| Error::internal("metadata vanished"))
    }

    fn get_train_iter(&self, rank: usize, world_size: usize) -> Result<BatchIterator> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::invalid_input(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }

        let path = Self::required_path(&self.config.train_path, "train_path")?;
        let shard: Vec<RawExample> = Self::read_examples(path)?
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % world_size == rank)
            .map(|(_, example)| example)
            .collect();

        debug!("Shard {}/{} holds {} training examples", rank, world_size, shard.len());
        self.batches(&shard, self.config.train_batch_size)
    }

    fn get_eval_iter(&self) -> Result<BatchIterator> {
        match &self.config.eval_path {
            Some(path) => self.batches(&Self::read_examples(path)?, self.config.eval_batch_size),
            None => Ok(BatchIterator::default()),
        }
    }

    fn get_test_iter(&self) -> Result<BatchIterator> {
        let path = Self::required_path(&self.test_path, "test_path")?;
        self.batches(&Self::read_examples(path)?, self.config.test_batch_size)
    }

    fn get_predict_iter(&self, examples: &[RawExample]) -> Result<(ModelInputs, BatchContext)> {
        if examples.is_empty() {
            return Err(Error::invalid_input("no examples to predict"));
        }
        let rows = self.order(self.numberize(examples, false)?);
        let (inputs, _, context) = self.tensorize(&rows)?;
        Ok((inputs, context))
    }

    fn test_path(&self) -> Option<&Path> {
        self.test_path.as_deref()
    }

    fn set_test_path(&mut self, path: PathBuf) {
        self.test_path = Some(path);
    }
}
