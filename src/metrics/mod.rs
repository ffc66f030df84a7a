//! Metric reporting for training, evaluation and test runs

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod classification;

pub use classification::{ClassificationMetricReporter, ClassificationMetricReporterConfig};

/// Phase a report was computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Training batches
    Train,
    /// Evaluation batches
    Eval,
    /// Held-out test batches
    Test,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Train => write!(f, "train"),
            Stage::Eval => write!(f, "eval"),
            Stage::Test => write!(f, "test"),
        }
    }
}

/// Aggregated metrics of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Stage the metrics were computed for
    pub stage: Stage,

    /// Epoch, absent for test runs
    pub epoch: Option<usize>,

    /// Number of examples seen
    pub num_examples: usize,

    /// Mean loss over the examples
    pub loss: Option<f64>,

    /// Named metric values
    pub metrics: BTreeMap<String, f64>,

    /// When the report was produced
    pub timestamp: DateTime<Utc>,
}

impl MetricReport {
    /// Look up a metric by name, `"loss"` included
    pub fn get(&self, name: &str) -> Option<f64> {
        if name == "loss" {
            return self.loss;
        }
        self.metrics.get(name).copied()
    }

    /// Write the report as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Accumulates batch statistics and reports metrics
pub trait MetricReporter: Send {
    /// Whether a smaller model selection metric is an improvement
    fn lower_is_better(&self) -> bool;

    /// Record the outcome of one batch
    fn add_batch_stats(
        &mut self,
        predictions: &[usize],
        scores: &[Vec<f32>],
        targets: &[usize],
        loss: f64,
    ) -> Result<()>;

    /// Compute metrics over everything recorded since the last report, then reset
    fn report_metric(&mut self, stage: Stage, epoch: Option<usize>) -> Result<MetricReport>;

    /// The single value used to pick the best model
    fn model_select_metric(&self, report: &MetricReport) -> Result<f64>;
}

/// Whether `candidate` improves on `best` in the given direction
pub fn is_better(lower_is_better: bool, candidate: f64, best: Option<f64>) -> bool {
    match best {
        None => !candidate.is_nan(),
        Some(best) if lower_is_better => candidate < best,
        Some(best) => candidate > best,
    }
}
