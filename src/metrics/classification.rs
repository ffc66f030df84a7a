//! Accuracy and F1 reporting for classification

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{MetricReport, MetricReporter, Stage};
use crate::config::ComponentConfig;
use crate::data::Metadata;
use crate::error::{Error, Result};

/// Parameters of [`ClassificationMetricReporter`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationMetricReporterConfig {
    /// Metric used for model selection: `accuracy`, `macro_f1` or `loss`
    pub model_select_metric: String,
}

impl Default for ClassificationMetricReporterConfig {
    fn default() -> Self {
        Self {
            model_select_metric: "accuracy".to_string(),
        }
    }
}

/// Reports loss, accuracy, macro F1 and per-label F1
#[derive(Debug)]
pub struct ClassificationMetricReporter {
    config: ClassificationMetricReporterConfig,
    labels: Vec<String>,
    predictions: Vec<usize>,
    targets: Vec<usize>,
    loss_sum: f64,
}

impl ClassificationMetricReporter {
    /// Create a reporter over a label space
    pub fn new(config: ClassificationMetricReporterConfig, labels: Vec<String>) -> Result<Self> {
        if !matches!(config.model_select_metric.as_str(), "accuracy" | "macro_f1" | "loss") {
            return Err(Error::config(format!(
                "unknown model_select_metric '{}'",
                config.model_select_metric
            )));
        }

        Ok(Self {
            config,
            labels,
            predictions: Vec::new(),
            targets: Vec::new(),
            loss_sum: 0.0,
        })
    }

    /// Build from a component config and metadata
    pub fn from_config(config: &ComponentConfig, metadata: Arc<Metadata>) -> Result<Self> {
        Self::new(config.params()?, metadata.target.vocab.clone())
    }

    fn f1_per_label(&self) -> Vec<f64> {
        (0..self.labels.len())
            .map(|label| {
                let mut tp = 0usize;
                let mut fp = 0usize;
                let mut fn_ = 0usize;
                for (&p, &t) in self.predictions.iter().zip(&self.targets) {
                    match (p == label, t == label) {
                        (true, true) => tp += 1,
                        (true, false) => fp += 1,
                        (false, true) => fn_ += 1,
                        (false, false) => {}
                    }
                }
                if tp == 0 {
                    0.0
                } else {
                    2.0 * tp as f64 / (2 * tp + fp + fn_) as f64
                }
            })
            .collect()
    }
}

impl MetricReporter for ClassificationMetricReporter {
    fn lower_is_better(&self) -> bool {
        self.config.model_select_metric == "loss"
    }

    fn add_batch_stats(
        &mut self,
        predictions: &[usize],
        _scores: &[Vec<f32>],
        targets: &[usize],
        loss: f64,
    ) -> Result<()> {
        if predictions.len() != targets.len() {
            return Err(Error::invalid_input(format!(
                "{} predictions for {} targets",
                predictions.len(),
                targets.len()
            )));
        }

        self.predictions.extend_from_slice(predictions);
        self.targets.extend_from_slice(targets);
        self.loss_sum += loss * targets.len() as f64;
        Ok(())
    }

    fn report_metric(&mut self, stage: Stage, epoch: Option<usize>) -> Result<MetricReport> {
        let total = self.targets.len();
        let mut metrics = BTreeMap::new();

        let loss = if total > 0 {
            let correct = self
                .predictions
                .iter()
                .zip(&self.targets)
                .filter(|(p, t)| p == t)
                .count();
            metrics.insert("accuracy".to_string(), correct as f64 / total as f64);

            let f1 = self.f1_per_label();
            if !f1.is_empty() {
                metrics.insert("macro_f1".to_string(), f1.iter().sum::<f64>() / f1.len() as f64);
            }
            for (label, score) in self.labels.iter().zip(f1) {
                metrics.insert(format!("f1/{}", label), score);
            }
            Some(self.loss_sum / total as f64)
        } else {
            None
        };

        info!(
            "{} metrics{}: examples={} loss={} accuracy={}",
            stage,
            epoch.map(|e| format!(" (epoch {})", e)).unwrap_or_default(),
            total,
            loss.map(|l| format!("{:.4}", l)).unwrap_or_else(|| "n/a".to_string()),
            metrics
                .get("accuracy")
                .map(|a| format!("{:.4}", a))
                .unwrap_or_else(|| "n/a".to_string()),
        );

        self.predictions.clear();
        self.targets.clear();
        self.loss_sum = 0.0;

        Ok(MetricReport {
            stage,
            epoch,
            num_examples: total,
            loss,
            metrics,
            timestamp: Utc::now(),
        })
    }

    fn model_select_metric(&self, report: &MetricReport) -> Result<f64> {
        report.get(&self.config.model_select_metric).ok_or_else(|| {
            Error::invalid_input(format!(
                "report has no '{}' metric",
                self.config.model_select_metric
            ))
        })
    }
}
