//! Data handling contracts: featurization, metadata and batching
//!
//! A [`DataHandler`] turns raw examples into [`Batch`]es of tensors and owns the
//! [`Metadata`] (vocabularies, label space) that the model, metric reporter and
//! exporter are built from.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub mod doc_classification;
pub mod featurizer;

pub use doc_classification::{DocClassificationDataHandler, DocClassificationDataHandlerConfig};
pub use featurizer::{SimpleFeaturizer, SimpleFeaturizerConfig};

/// A raw input record, keyed by column name
pub type RawExample = Map<String, Value>;

/// Tensors fed to a model's forward pass
pub type ModelInputs = Vec<Tensor>;

/// Name of the word token feature in [`Metadata::features`]
pub const WORD_FEATURE: &str = "word_feat";

/// Vocabulary of one input feature or of the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Tokens or labels, position is the index
    pub vocab: Vec<String>,
    /// Index of the padding token
    pub pad_token_idx: Option<usize>,
    /// Index used for unknown tokens
    pub unk_token_idx: Option<usize>,
}

impl FieldMeta {
    /// Create field metadata
    pub fn new(vocab: Vec<String>, pad_token_idx: Option<usize>, unk_token_idx: Option<usize>) -> Self {
        Self {
            vocab,
            pad_token_idx,
            unk_token_idx,
        }
    }

    /// Number of entries in the vocabulary
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Token to index lookup table
    pub fn stoi(&self) -> HashMap<&str, usize> {
        self.vocab
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect()
    }
}

/// Derived vocabulary and label information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Per input feature metadata
    pub features: BTreeMap<String, FieldMeta>,
    /// Target metadata
    pub target: FieldMeta,
}

impl Metadata {
    /// Metadata of a named feature
    pub fn feature(&self, name: &str) -> Option<&FieldMeta> {
        self.features.get(name)
    }

    /// Load metadata from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save metadata to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Per batch context travelling alongside the tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchContext {
    /// Original position of every example in the batch, in processing order
    pub index: Vec<usize>,
    /// Free-form extras a data handler wants to pass along
    pub extra: Map<String, Value>,
}

impl BatchContext {
    /// Context for examples processed in the given original positions
    pub fn with_index(index: Vec<usize>) -> Self {
        Self {
            index,
            extra: Map::new(),
        }
    }
}

/// One batch of model inputs
#[derive(Debug, Clone)]
pub struct Batch {
    /// Model inputs
    pub inputs: ModelInputs,
    /// Target indices, absent for unlabeled data
    pub targets: Option<Tensor>,
    /// Batch context
    pub context: BatchContext,
}

impl Batch {
    /// Number of examples in the batch
    pub fn len(&self) -> usize {
        self.context.index.len()
    }

    /// Whether the batch holds no examples
    pub fn is_empty(&self) -> bool {
        self.context.index.is_empty()
    }

    /// Copy the batch tensors to a device
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let inputs = self
            .inputs
            .iter()
            .map(|t| t.to_device(device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let targets = match &self.targets {
            Some(t) => Some(t.to_device(device)?),
            None => None,
        };
        Ok(Self {
            inputs,
            targets,
            context: self.context.clone(),
        })
    }
}

/// Re-iterable collection of batches
#[derive(Debug, Clone, Default)]
pub struct BatchIterator {
    batches: Vec<Batch>,
}

impl BatchIterator {
    /// Wrap prepared batches
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    /// Number of batches
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether there are no batches
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total number of examples
    pub fn num_examples(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Iterate over the batches
    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    /// Shuffle batch order in place
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.batches.shuffle(rng);
    }
}

impl IntoIterator for BatchIterator {
    type Item = Batch;
    type IntoIter = std::vec::IntoIter<Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}

impl<'a> IntoIterator for &'a BatchIterator {
    type Item = &'a Batch;
    type IntoIter = std::slice::Iter<'a, Batch>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.iter()
    }
}

/// Features extracted from one raw text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturizedExample {
    /// Word tokens
    pub tokens: Vec<String>,
}

/// Converts raw text into features
pub trait Featurizer: Send + Sync {
    /// Featurize one text
    fn featurize(&self, text: &str) -> Result<FeaturizedExample>;

    /// Featurize many texts
    fn featurize_batch(&self, texts: &[&str]) -> Result<Vec<FeaturizedExample>> {
        texts.iter().map(|t| self.featurize(t)).collect()
    }
}

/// Loads data, owns metadata and produces batches
pub trait DataHandler: Send {
    /// Restore metadata computed by an earlier run
    fn load_metadata(&mut self, metadata: Metadata) -> Result<()>;

    /// Compute metadata from the training data
    fn init_metadata(&mut self) -> Result<()>;

    /// Current metadata, an error before it was loaded or initialized
    fn metadata(&self) -> Result<Arc<Metadata>>;

    /// Training batches of one shard
    fn get_train_iter(&self, rank: usize, world_size: usize) -> Result<BatchIterator>;

    /// Evaluation batches
    fn get_eval_iter(&self) -> Result<BatchIterator>;

    /// Test batches, read from [`DataHandler::test_path`]
    fn get_test_iter(&self) -> Result<BatchIterator>;

    /// Model inputs for unlabeled examples
    ///
    /// The returned context's `index` gives, for every row of the inputs, the
    /// position of the example in `examples`.
    fn get_predict_iter(&self, examples: &[RawExample]) -> Result<(ModelInputs, BatchContext)>;

    /// Path test data is read from
    fn test_path(&self) -> Option<&Path>;

    /// Point test data at a new path
    fn set_test_path(&mut self, path: PathBuf);
}
