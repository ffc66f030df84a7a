//! Trainer contract and the default epoch-based trainer
//!
//! The trainer owns the training loop: forward and backward passes, optimizer
//! and scheduler stepping, evaluation after every epoch, best model selection
//! and early stopping.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{ComponentConfig, RunConfig};
use crate::data::{Batch, BatchIterator};
use crate::error::{Error, Result};
use crate::metrics::{is_better, MetricReport, MetricReporter, Stage};
use crate::models::{Model, ModelState};
use crate::optim::{LrScheduler, Optimizer};

/// Result of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    /// Best model selection metric, absent without evaluation data
    pub best_metric: Option<f64>,

    /// Epoch the kept model comes from
    pub best_epoch: Option<usize>,

    /// Epochs actually run
    pub epochs_run: usize,

    /// Evaluation report of the kept model
    pub best_report: Option<MetricReport>,

    /// Every report produced during training
    pub history: Vec<MetricReport>,
}

/// Runs training and testing loops
pub trait Trainer: Send {
    /// Train `model` on `train_iter`, selecting the best epoch on `eval_iter`
    ///
    /// On return the model holds the parameters of the selected epoch.
    #[allow(clippy::too_many_arguments)]
    fn train(
        &mut self,
        train_iter: BatchIterator,
        eval_iter: BatchIterator,
        model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
        train_config: &RunConfig,
        optimizers: &mut [Box<dyn Optimizer>],
        schedulers: &mut [Box<dyn LrScheduler>],
        rank: usize,
    ) -> Result<TrainOutcome>;

    /// Compute metrics of `model` on `test_iter`
    fn test(
        &mut self,
        test_iter: BatchIterator,
        model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
    ) -> Result<MetricReport>;
}

/// Parameters of [`EpochTrainer`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EpochTrainerConfig {
    /// Number of passes over the training data
    pub epochs: usize,
    /// Stop after this many epochs without improvement, 0 disables
    pub early_stop_after: usize,
    /// Shuffle batch order every epoch
    pub shuffle: bool,
    /// Compute metrics over training batches
    pub report_train_metrics: bool,
}

impl Default for EpochTrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            early_stop_after: 0,
            shuffle: true,
            report_train_metrics: true,
        }
    }
}

/// Epoch loop with evaluation-based model selection
#[derive(Debug)]
pub struct EpochTrainer {
    config: EpochTrainerConfig,
}

impl EpochTrainer {
    /// Create a trainer
    pub fn new(config: EpochTrainerConfig) -> Result<Self> {
        if config.epochs == 0 {
            return Err(Error::config("trainer epochs must be > 0"));
        }
        Ok(Self { config })
    }

    /// Build from a component config
    pub fn from_config(config: &ComponentConfig) -> Result<Self> {
        Self::new(config.params()?)
    }

    fn targets<'a>(batch: &'a Batch) -> Result<&'a Tensor> {
        batch
            .targets
            .as_ref()
            .ok_or_else(|| Error::trainer("batch has no targets"))
    }

    fn scalar(loss: &Tensor) -> Result<f64> {
        Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    fn indices(targets: &Tensor) -> Result<Vec<usize>> {
        Ok(targets
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|t| t as usize)
            .collect())
    }

    fn evaluate(
        &self,
        batches: &BatchIterator,
        model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
        stage: Stage,
        epoch: Option<usize>,
    ) -> Result<MetricReport> {
        model.eval();
        let device = model.device().clone();

        for batch in batches {
            let batch = batch.to_device(&device)?;
            let targets = Self::targets(&batch)?;
            let output = model.forward(&batch.inputs)?;
            let loss = model.get_loss(&output, targets)?;
            let (predictions, scores) = model.get_pred(&output)?;
            metric_reporter.add_batch_stats(&predictions, &scores, &Self::indices(targets)?, Self::scalar(&loss)?)?;
        }

        metric_reporter.report_metric(stage, epoch)
    }
}

impl Trainer for EpochTrainer {
    #[instrument(skip_all, fields(rank = rank))]
    fn train(
        &mut self,
        mut train_iter: BatchIterator,
        eval_iter: BatchIterator,
        model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
        train_config: &RunConfig,
        optimizers: &mut [Box<dyn Optimizer>],
        schedulers: &mut [Box<dyn LrScheduler>],
        rank: usize,
    ) -> Result<TrainOutcome> {
        if train_iter.is_empty() {
            return Err(Error::trainer("no training batches"));
        }

        let mut rng = match train_config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
            None => StdRng::from_os_rng(),
        };
        let device = model.device().clone();
        let lower_is_better = metric_reporter.lower_is_better();

        let mut history = Vec::new();
        let mut best_metric: Option<f64> = None;
        let mut best_epoch = None;
        let mut best_report = None;
        let mut best_state: Option<ModelState> = None;
        let mut stale_epochs = 0;
        let mut epochs_run = 0;

        info!(
            "Training for up to {} epochs on {} batches ({} examples)",
            self.config.epochs,
            train_iter.len(),
            train_iter.num_examples()
        );

        for epoch in 0..self.config.epochs {
            epochs_run += 1;
            model.train_mode();
            if self.config.shuffle {
                train_iter.shuffle(&mut rng);
            }

            for batch in &train_iter {
                let batch = batch.to_device(&device)?;
                let targets = Self::targets(&batch)?;
                let output = model.forward(&batch.inputs)?;
                let loss = model.get_loss(&output, targets)?;
                let gradients = loss.backward()?;

                for optimizer in optimizers.iter_mut() {
                    optimizer.step(&gradients)?;
                }
                for (scheduler, optimizer) in schedulers.iter_mut().zip(optimizers.iter_mut()) {
                    scheduler.step_batch(optimizer.as_mut());
                }

                if self.config.report_train_metrics {
                    let (predictions, scores) = model.get_pred(&output)?;
                    metric_reporter.add_batch_stats(
                        &predictions,
                        &scores,
                        &Self::indices(targets)?,
                        Self::scalar(&loss)?,
                    )?;
                }
            }

            if self.config.report_train_metrics {
                history.push(metric_reporter.report_metric(Stage::Train, Some(epoch))?);
            }

            let metric = if eval_iter.is_empty() {
                best_epoch = Some(epoch);
                None
            } else {
                let report = self.evaluate(&eval_iter, model, metric_reporter, Stage::Eval, Some(epoch))?;
                let metric = metric_reporter.model_select_metric(&report)?;

                if is_better(lower_is_better, metric, best_metric) {
                    debug!("New best metric {:.4} at epoch {}", metric, epoch);
                    best_metric = Some(metric);
                    best_epoch = Some(epoch);
                    best_report = Some(report.clone());
                    best_state = Some(model.state_dict()?);
                    stale_epochs = 0;
                } else {
                    stale_epochs += 1;
                }
                history.push(report);
                Some(metric)
            };

            for (scheduler, optimizer) in schedulers.iter_mut().zip(optimizers.iter_mut()) {
                scheduler.step_epoch(optimizer.as_mut(), metric);
            }

            if self.config.early_stop_after > 0 && stale_epochs >= self.config.early_stop_after {
                info!("Early stopping after {} epochs without improvement", stale_epochs);
                break;
            }
        }

        if let Some(state) = &best_state {
            model.load_state_dict(state)?;
        }

        info!(
            "Training done: {} epochs, best epoch {:?}, best metric {:?}",
            epochs_run, best_epoch, best_metric
        );

        Ok(TrainOutcome {
            best_metric,
            best_epoch,
            epochs_run,
            best_report,
            history,
        })
    }

    #[instrument(skip_all)]
    fn test(
        &mut self,
        test_iter: BatchIterator,
        model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
    ) -> Result<MetricReport> {
        self.evaluate(&test_iter, model, metric_reporter, Stage::Test, None)
    }
}
