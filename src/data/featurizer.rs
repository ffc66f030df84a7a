//! Whitespace featurizer backed by `tokenizers` pre-tokenizers

use serde::{Deserialize, Serialize};
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::{NormalizedString, OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

use super::{FeaturizedExample, Featurizer};
use crate::config::{ComponentConfig, FeatureConfig};
use crate::error::{Error, Result};

/// Parameters of [`SimpleFeaturizer`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SimpleFeaturizerConfig {
    /// Lowercase every token
    pub lowercase_tokens: bool,
    /// Split every Unicode punctuation character into its own token
    pub split_punctuation: bool,
}

impl Default for SimpleFeaturizerConfig {
    fn default() -> Self {
        Self {
            lowercase_tokens: true,
            split_punctuation: false,
        }
    }
}

/// Splits on whitespace, optionally lowercasing and splitting punctuation
#[derive(Debug, Clone)]
pub struct SimpleFeaturizer {
    config: SimpleFeaturizerConfig,
    max_seq_len: Option<usize>,
    pre_tokenizer: PreTokenizerWrapper,
}

impl SimpleFeaturizer {
    /// Create a featurizer
    pub fn new(config: SimpleFeaturizerConfig, max_seq_len: Option<usize>) -> Self {
        let pre_tokenizer = if config.split_punctuation {
            PreTokenizerWrapper::from(BertPreTokenizer)
        } else {
            PreTokenizerWrapper::from(WhitespaceSplit)
        };
        Self {
            config,
            max_seq_len,
            pre_tokenizer,
        }
    }

    /// Build from a component config
    pub fn from_config(config: &ComponentConfig, features: &FeatureConfig) -> Result<Self> {
        Ok(Self::new(config.params()?, features.word_feat.max_seq_len))
    }
}

impl Featurizer for SimpleFeaturizer {
    fn featurize(&self, text: &str) -> Result<FeaturizedExample> {
        let mut normalized = NormalizedString::from(text);
        if self.config.lowercase_tokens {
            normalized.lowercase();
        }

        let mut pretokenized = PreTokenizedString::from(normalized);
        self.pre_tokenizer
            .pre_tokenize(&mut pretokenized)
            .map_err(|e| Error::data_handler(format!("Pre-tokenization failed: {}", e)))?;

        let mut tokens: Vec<String> = pretokenized
            .get_splits(OffsetReferential::Original, OffsetType::Byte)
            .into_iter()
            .map(|(token, _, _)| token.to_string())
            .collect();

        if let Some(max) = self.max_seq_len {
            tokens.truncate(max);
        }

        Ok(FeaturizedExample { tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_whitespace_split() {
        let featurizer = SimpleFeaturizer::new(SimpleFeaturizerConfig::default(), None);
        let out = featurizer.featurize("Play  the Song").unwrap();
        assert_eq!(out.tokens, vec!["play", "the", "song"]);
    }

    #[test]
    fn test_punctuation_and_truncation() {
        let config = SimpleFeaturizerConfig {
            lowercase_tokens: false,
            split_punctuation: true,
        };
        let featurizer = SimpleFeaturizer::new(config, Some(4));
        let out = featurizer.featurize("Hi, there! Bye.").unwrap();
        assert_eq!(out.tokens, vec!["Hi", ",", "there", "!"]);
    }

    #[test]
    fn test_from_config_rejects_unknown_params() {
        let config = ComponentConfig::new("SimpleFeaturizer").with_param("stem", true);
        let err = SimpleFeaturizer::from_config(&config, &FeatureConfig::default()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_unicode_punctuation_split() {
        let config = SimpleFeaturizerConfig {
            lowercase_tokens: true,
            split_punctuation: true,
        };
        let featurizer = SimpleFeaturizer::new(config, None);
        let out = featurizer.featurize("Ça va\u{3001}Über¿ \t ok").unwrap();
        assert_eq!(out.tokens, vec!["ça", "va", "\u{3001}", "über", "¿", "ok"]);
    }

    #[test]
    fn test_whitespace_split_keeps_punctuation_attached() {
        let featurizer = SimpleFeaturizer::new(SimpleFeaturizerConfig::default(), None);
        let out = featurizer.featurize("Hi,\tthere!\n\nBye.").unwrap();
        assert_eq!(out.tokens, vec!["hi,", "there!", "bye."]);
    }

    #[test]
    fn test_empty_text() {
        let featurizer = SimpleFeaturizer::new(SimpleFeaturizerConfig::default(), None);
        assert!(featurizer.featurize("   ").unwrap().tokens.is_empty());
    }
}
