//! Task assembly and orchestration
//!
//! A [`Task`] owns every component a configuration selects and exposes the
//! train, test, predict and export entry points. [`Task::from_config`] builds
//! the components in dependency order: featurizer, data handler, metadata,
//! model, metric reporter, optimizers, exporter, trainer and schedulers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::{RunConfig, TaskConfig};
use crate::data::{BatchContext, DataHandler, FieldMeta, Metadata, RawExample};
use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::exporter::{Exporter, GraphWriter};
use crate::metrics::{MetricReport, MetricReporter};
use crate::models::{Model, ModelState};
use crate::optim::{create_schedulers, LrScheduler, Optimizer};
use crate::registry::ComponentRegistry;
use crate::trainer::{TrainOutcome, Trainer};

/// One formatted prediction, keyed by output name
pub type PredictionRecord = BTreeMap<String, Value>;

/// Turns decoded model outputs into prediction records
pub trait PredictionFormatter: Send {
    /// Format predictions in batch order
    ///
    /// The iterator yields one record per prediction and is consumed once.
    fn format_prediction<'a>(
        &'a self,
        predictions: &'a [usize],
        scores: &'a [Vec<f32>],
        context: &'a BatchContext,
        target_meta: &'a FieldMeta,
    ) -> Box<dyn Iterator<Item = PredictionRecord> + 'a>;
}

/// Emits `{prediction, score}` with the raw class index and score vector
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreFormatter;

impl PredictionFormatter for ScoreFormatter {
    fn format_prediction<'a>(
        &'a self,
        predictions: &'a [usize],
        scores: &'a [Vec<f32>],
        _context: &'a BatchContext,
        _target_meta: &'a FieldMeta,
    ) -> Box<dyn Iterator<Item = PredictionRecord> + 'a> {
        Box::new(predictions.iter().zip(scores).map(|(prediction, score)| {
            let mut record = PredictionRecord::new();
            record.insert("prediction".to_string(), Value::from(*prediction));
            record.insert("score".to_string(), Value::from(score.clone()));
            record
        }))
    }
}

/// Decodes label names and emits a score per label
#[derive(Debug, Clone)]
pub struct LabelFormatter {
    output_name: String,
}

impl LabelFormatter {
    /// Formatter writing the label under `output_name`
    pub fn new(output_name: impl Into<String>) -> Self {
        Self {
            output_name: output_name.into(),
        }
    }
}

impl PredictionFormatter for LabelFormatter {
    fn format_prediction<'a>(
        &'a self,
        predictions: &'a [usize],
        scores: &'a [Vec<f32>],
        _context: &'a BatchContext,
        target_meta: &'a FieldMeta,
    ) -> Box<dyn Iterator<Item = PredictionRecord> + 'a> {
        Box::new(predictions.iter().zip(scores).map(move |(&prediction, score)| {
            let label = target_meta
                .vocab
                .get(prediction)
                .map(|name| Value::from(name.as_str()))
                .unwrap_or(Value::Null);
            let per_label: Map<String, Value> = target_meta
                .vocab
                .iter()
                .zip(score)
                .map(|(name, s)| (name.clone(), Value::from(*s)))
                .collect();

            let mut record = PredictionRecord::new();
            record.insert(self.output_name.clone(), label);
            record.insert(
                "score".to_string(),
                score.get(prediction).map(|s| Value::from(*s)).unwrap_or(Value::Null),
            );
            record.insert("scores".to_string(), Value::Object(per_label));
            record
        }))
    }
}

/// An assembled task
pub struct Task {
    /// Runs training and testing loops
    pub trainer: Box<dyn Trainer>,
    /// Owns data and metadata
    pub data_handler: Box<dyn DataHandler>,
    /// The model being trained
    pub model: Box<dyn Model>,
    /// Computes metrics
    pub metric_reporter: Box<dyn MetricReporter>,
    /// Optimizers over the model parameters
    pub optimizers: Vec<Box<dyn Optimizer>>,
    /// One scheduler per optimizer, empty when no scheduler is configured
    pub schedulers: Vec<Box<dyn LrScheduler>>,
    /// Present only when the configuration names an exporter
    pub exporter: Option<Box<dyn Exporter>>,
    /// Formats predictions
    pub formatter: Box<dyn PredictionFormatter>,
}

impl Task {
    /// Assemble a task from its configuration
    ///
    /// `metadata` and `model_state` restore a previously trained task; without
    /// them metadata is computed from the training data and the model starts
    /// freshly initialized.
    #[instrument(skip_all, fields(task = %config.type_name))]
    pub fn from_config(
        config: &TaskConfig,
        registry: &ComponentRegistry,
        metadata: Option<Metadata>,
        model_state: Option<&ModelState>,
        ctx: &ExecutionContext,
    ) -> Result<Task> {
        info!("Task parameters:\n{}", serde_json::to_string_pretty(config)?);

        let featurizer = registry.create_featurizer(&config.featurizer, &config.features)?;
        let mut data_handler =
            registry.create_data_handler(&config.data_handler, &config.features, &config.labels, featurizer)?;

        info!("Loading data...");
        match metadata {
            Some(metadata) => data_handler.load_metadata(metadata)?,
            None => data_handler.init_metadata()?,
        }
        let metadata = data_handler.metadata()?;

        let mut model = registry.create_model(&config.model, &config.features, metadata.clone())?;
        if let Some(state) = model_state {
            model.load_state_dict(state)?;
        }
        if ctx.use_gpu() {
            model.to_device(&ctx.device()?)?;
        }

        let metric_reporter = registry.create_metric_reporter(&config.metric_reporter, metadata.clone())?;
        let optimizers = registry.create_optimizer(&config.optimizer, model.parameters())?;
        let exporter = config
            .exporter
            .as_ref()
            .map(|exporter| {
                registry.create_exporter(exporter, &config.features, &config.labels, metadata.clone(), &config.model)
            })
            .transpose()?;
        let trainer = registry.create_trainer(&config.trainer)?;
        let schedulers = create_schedulers(
            &optimizers,
            config.scheduler.as_ref(),
            metric_reporter.lower_is_better(),
        )?;

        debug!(
            "Assembled task: {} optimizers, {} schedulers, exporter: {}",
            optimizers.len(),
            schedulers.len(),
            exporter.is_some()
        );

        Ok(Task {
            trainer,
            data_handler,
            model,
            metric_reporter,
            optimizers,
            schedulers,
            exporter,
            formatter: Box::new(ScoreFormatter),
        })
    }

    /// Replace the prediction formatter
    pub fn with_formatter(mut self, formatter: Box<dyn PredictionFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Metadata held by the data handler
    pub fn metadata(&self) -> Result<Arc<Metadata>> {
        self.data_handler.metadata()
    }

    /// Train on the shard `rank` of `world_size`
    ///
    /// On return the model holds the parameters the trainer selected.
    #[instrument(skip(self, train_config))]
    pub fn train(&mut self, train_config: &RunConfig, rank: usize, world_size: usize) -> Result<TrainOutcome> {
        let train_iter = self.data_handler.get_train_iter(rank, world_size)?;
        let eval_iter = self.data_handler.get_eval_iter()?;

        self.trainer.train(
            train_iter,
            eval_iter,
            self.model.as_mut(),
            self.metric_reporter.as_mut(),
            train_config,
            &mut self.optimizers,
            &mut self.schedulers,
            rank,
        )
    }

    /// Train on all data in a single process
    pub fn train_single(&mut self, train_config: &RunConfig) -> Result<TrainOutcome> {
        self.train(train_config, 0, 1)
    }

    /// Evaluate the model on the data at `test_path`
    #[instrument(skip(self, test_path))]
    pub fn test(&mut self, test_path: impl Into<PathBuf>) -> Result<MetricReport> {
        self.data_handler.set_test_path(test_path.into());
        let test_iter = self.data_handler.get_test_iter()?;
        self.trainer
            .test(test_iter, self.model.as_mut(), self.metric_reporter.as_mut())
    }

    /// Export `model` with this task's exporter
    ///
    /// GPU execution is switched off on `ctx` and the model is moved to the
    /// CPU first, whether or not an exporter is configured. Without an
    /// exporter nothing is written. The model is traced and written in eval
    /// mode and returned in the mode it had.
    pub fn export(
        &self,
        model: &mut dyn Model,
        export_path: &Path,
        summary_writer: Option<&mut dyn GraphWriter>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        export_with(self.exporter.as_deref(), model, export_path, summary_writer, ctx)
    }

    /// Export the task's own model
    pub fn export_own_model(
        &mut self,
        export_path: &Path,
        summary_writer: Option<&mut dyn GraphWriter>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        export_with(
            self.exporter.as_deref(),
            self.model.as_mut(),
            export_path,
            summary_writer,
            ctx,
        )
    }

    /// Format decoded outputs with the task's formatter
    pub fn format_prediction<'a>(
        &'a self,
        predictions: &'a [usize],
        scores: &'a [Vec<f32>],
        context: &'a BatchContext,
        target_meta: &'a FieldMeta,
    ) -> Box<dyn Iterator<Item = PredictionRecord> + 'a> {
        self.formatter
            .format_prediction(predictions, scores, context, target_meta)
    }

    /// Predict unlabeled examples
    ///
    /// Returns one record per example, in the order of `examples`.
    #[instrument(skip_all, fields(examples = examples.len()))]
    pub fn predict(&mut self, examples: &[RawExample]) -> Result<Vec<PredictionRecord>> {
        if examples.is_empty() {
            return Ok(Vec::new());
        }

        self.model.eval();
        let (inputs, context) = self.data_handler.get_predict_iter(examples)?;
        let device = self.model.device().clone();
        let inputs = inputs
            .iter()
            .map(|t| t.to_device(&device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let output = self.model.forward(&inputs)?;
        let (predictions, scores) = self.model.get_pred(&output)?;
        let metadata = self.data_handler.metadata()?;

        let mut results: Vec<Option<PredictionRecord>> = vec![None; examples.len()];
        let records = self.format_prediction(&predictions, &scores, &context, &metadata.target);
        for (&position, record) in context.index.iter().zip(records) {
            let slot = results.get_mut(position).ok_or_else(|| {
                Error::invalid_input(format!(
                    "batch context index {} out of range for {} examples",
                    position,
                    examples.len()
                ))
            })?;
            if slot.is_some() {
                return Err(Error::invalid_input(format!(
                    "batch context index {} appears more than once",
                    position
                )));
            }
            *slot = Some(record);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                record.ok_or_else(|| Error::invalid_input(format!("no prediction produced for example {}", i)))
            })
            .collect()
    }
}

fn export_with(
    exporter: Option<&dyn Exporter>,
    model: &mut dyn Model,
    export_path: &Path,
    summary_writer: Option<&mut dyn GraphWriter>,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    ctx.disable_gpu();
    let device = ctx.device()?;
    model.to_device(&device)?;

    let Some(exporter) = exporter else {
        warn!("No exporter configured, skipping export to {}", export_path.display());
        return Ok(());
    };

    let was_training = model.is_training();
    model.eval();
    let result = write_export(exporter, model, export_path, summary_writer, &device);
    if was_training {
        model.train_mode();
    }
    result
}

fn write_export(
    exporter: &dyn Exporter,
    model: &dyn Model,
    export_path: &Path,
    summary_writer: Option<&mut dyn GraphWriter>,
    device: &Device,
) -> Result<()> {
    if let Some(writer) = summary_writer {
        let inputs = exporter.dummy_model_input(device)?;
        writer.add_graph(model, &inputs)?;
    }

    info!("Exporting model to {}", export_path.display());
    exporter.export_model(model, export_path)
}
