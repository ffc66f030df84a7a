//! Stub collaborators and fixtures shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use taskwright::config::{ComponentConfig, FeatureConfig, LabelConfig, RunConfig, TaskConfig};
use taskwright::data::{
    BatchContext, BatchIterator, DataHandler, FeaturizedExample, Featurizer, FieldMeta, Metadata, ModelInputs,
    RawExample, WORD_FEATURE,
};
use taskwright::exporter::{Exporter, GraphWriter};
use taskwright::metrics::{MetricReport, MetricReporter, Stage};
use taskwright::models::{load_varmap_state, varmap_state, Model, ModelState};
use taskwright::optim::{LrScheduler, Optimizer};
use taskwright::registry::ComponentRegistry;
use taskwright::trainer::{TrainOutcome, Trainer};
use taskwright::Result;

/// Ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }
}

pub fn stub_metadata() -> Metadata {
    let mut features = BTreeMap::new();
    features.insert(
        WORD_FEATURE.to_string(),
        FieldMeta::new(vec!["<pad>".into(), "<unk>".into()], Some(0), Some(1)),
    );
    Metadata {
        features,
        target: FieldMeta::new(vec!["a".into(), "b".into(), "c".into()], None, None),
    }
}

pub struct StubFeaturizer;

impl Featurizer for StubFeaturizer {
    fn featurize(&self, text: &str) -> Result<FeaturizedExample> {
        Ok(FeaturizedExample {
            tokens: text.split_whitespace().map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StubHandlerParams {
    /// Context index returned by the predict path, identity when absent
    pub predict_index: Option<Vec<usize>>,
}

/// Predict inputs are one row per example holding its `x` value
pub struct StubDataHandler {
    params: StubHandlerParams,
    log: CallLog,
    metadata: Option<Arc<Metadata>>,
    test_path: Option<PathBuf>,
}

impl DataHandler for StubDataHandler {
    fn load_metadata(&mut self, metadata: Metadata) -> Result<()> {
        self.log.push("load_metadata");
        self.metadata = Some(Arc::new(metadata));
        Ok(())
    }

    fn init_metadata(&mut self) -> Result<()> {
        self.log.push("init_metadata");
        self.metadata = Some(Arc::new(stub_metadata()));
        Ok(())
    }

    fn metadata(&self) -> Result<Arc<Metadata>> {
        self.metadata
            .clone()
            .ok_or_else(|| taskwright::Error::data_handler("no metadata"))
    }

    fn get_train_iter(&self, rank: usize, world_size: usize) -> Result<BatchIterator> {
        self.log.push(format!("get_train_iter {} {}", rank, world_size));
        Ok(BatchIterator::default())
    }

    fn get_eval_iter(&self) -> Result<BatchIterator> {
        self.log.push("get_eval_iter");
        Ok(BatchIterator::default())
    }

    fn get_test_iter(&self) -> Result<BatchIterator> {
        let path = self
            .test_path
            .as_ref()
            .ok_or_else(|| taskwright::Error::config("test_path is not configured"))?;
        self.log.push(format!("get_test_iter {}", path.display()));
        Ok(BatchIterator::default())
    }

    fn get_predict_iter(&self, examples: &[RawExample]) -> Result<(ModelInputs, BatchContext)> {
        let index = self
            .params
            .predict_index
            .clone()
            .unwrap_or_else(|| (0..examples.len()).collect());
        let values: Vec<f32> = index
            .iter()
            .map(|&i| {
                examples
                    .get(i)
                    .and_then(|e| e.get("x"))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32
            })
            .collect();
        let rows = values.len();
        let inputs = vec![Tensor::from_vec(values, (rows, 1), &Device::Cpu)?];
        Ok((inputs, BatchContext::with_index(index)))
    }

    fn test_path(&self) -> Option<&Path> {
        self.test_path.as_deref()
    }

    fn set_test_path(&mut self, path: PathBuf) {
        self.test_path = Some(path);
    }
}

/// Forward returns its single input; the prediction is that value
pub struct StubModel {
    varmap: VarMap,
    device: Device,
    training: bool,
    log: CallLog,
}

impl StubModel {
    pub fn new(log: CallLog) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(1, "w", Init::Const(1.0)).unwrap();
        Self {
            varmap,
            device: Device::Cpu,
            training: true,
            log,
        }
    }
}

impl Model for StubModel {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        Ok(inputs[0].clone())
    }

    fn get_loss(&self, output: &Tensor, _targets: &Tensor) -> Result<Tensor> {
        Ok(output.sum_all()?)
    }

    fn get_pred(&self, output: &Tensor) -> Result<(Vec<usize>, Vec<Vec<f32>>)> {
        let scores = output.to_vec2::<f32>()?;
        let predictions = scores.iter().map(|row| row[0] as usize).collect();
        Ok((predictions, scores))
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        self.log.push("load_state_dict");
        load_varmap_state(&self.varmap, state)
    }

    fn state_dict(&self) -> Result<ModelState> {
        varmap_state(&self.varmap)
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        self.log.push(format!("to_device cpu={}", device.is_cpu()));
        self.device = device.clone();
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn eval(&mut self) {
        self.log.push("eval");
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

pub struct StubMetricReporter;

impl MetricReporter for StubMetricReporter {
    fn lower_is_better(&self) -> bool {
        false
    }

    fn add_batch_stats(&mut self, _: &[usize], _: &[Vec<f32>], _: &[usize], _: f64) -> Result<()> {
        Ok(())
    }

    fn report_metric(&mut self, stage: Stage, epoch: Option<usize>) -> Result<MetricReport> {
        Ok(MetricReport {
            stage,
            epoch,
            num_examples: 0,
            loss: None,
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
        })
    }

    fn model_select_metric(&self, report: &MetricReport) -> Result<f64> {
        Ok(report.num_examples as f64)
    }
}

pub struct StubExporter {
    log: CallLog,
}

impl Exporter for StubExporter {
    fn export_model(&self, model: &dyn Model, path: &Path) -> Result<()> {
        self.log.push(format!("export_model training={}", model.is_training()));
        std::fs::write(path, "exported")?;
        Ok(())
    }

    fn dummy_model_input(&self, device: &Device) -> Result<ModelInputs> {
        Ok(vec![Tensor::zeros((1, 1), DType::F32, device)?])
    }
}

/// Graph writer remembering the input shapes it saw
#[derive(Default)]
pub struct RecordingGraphWriter {
    pub graphs: Vec<Vec<Vec<usize>>>,
}

impl GraphWriter for RecordingGraphWriter {
    fn add_graph(&mut self, model: &dyn Model, inputs: &ModelInputs) -> Result<()> {
        model.forward(inputs)?;
        self.graphs.push(inputs.iter().map(|t| t.dims().to_vec()).collect());
        Ok(())
    }
}

pub struct StubTrainer {
    log: CallLog,
}

impl Trainer for StubTrainer {
    fn train(
        &mut self,
        train_iter: BatchIterator,
        _eval_iter: BatchIterator,
        _model: &mut dyn Model,
        _metric_reporter: &mut dyn MetricReporter,
        _train_config: &RunConfig,
        optimizers: &mut [Box<dyn Optimizer>],
        schedulers: &mut [Box<dyn LrScheduler>],
        rank: usize,
    ) -> Result<TrainOutcome> {
        self.log.push(format!(
            "train rank={} optimizers={} schedulers={}",
            rank,
            optimizers.len(),
            schedulers.len()
        ));
        Ok(TrainOutcome {
            best_metric: None,
            best_epoch: None,
            epochs_run: train_iter.len(),
            best_report: None,
            history: Vec::new(),
        })
    }

    fn test(
        &mut self,
        _test_iter: BatchIterator,
        _model: &mut dyn Model,
        metric_reporter: &mut dyn MetricReporter,
    ) -> Result<MetricReport> {
        self.log.push("test");
        metric_reporter.report_metric(Stage::Test, None)
    }
}

/// Registry holding only stub components, every factory logging its call
pub fn stub_registry(log: &CallLog) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();

    let l = log.clone();
    registry
        .register_featurizer("StubFeaturizer", move |_config, _features: &FeatureConfig| {
            l.push("featurizer");
            Ok(Arc::new(StubFeaturizer) as Arc<dyn Featurizer>)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_data_handler("StubDataHandler", move |config, _features, _labels: &LabelConfig, _featurizer| {
            l.push("data_handler");
            Ok(Box::new(StubDataHandler {
                params: config.params()?,
                log: l.clone(),
                metadata: None,
                test_path: None,
            }) as Box<dyn DataHandler>)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_model("StubModel", move |_config, _features, _metadata| {
            l.push("model");
            Ok(Box::new(StubModel::new(l.clone())) as Box<dyn Model>)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_metric_reporter("StubMetricReporter", move |_config, _metadata| {
            l.push("metric_reporter");
            Ok(Box::new(StubMetricReporter) as Box<dyn MetricReporter>)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_optimizer("StubOptimizer", move |_config, parameters| {
            l.push("optimizer");
            taskwright::optim::create_sgd(&ComponentConfig::new("SGD"), parameters)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_exporter("StubExporter", move |_config, _features, _labels, _metadata, _model_config| {
            l.push("exporter");
            Ok(Box::new(StubExporter { log: l.clone() }) as Box<dyn Exporter>)
        })
        .unwrap();

    let l = log.clone();
    registry
        .register_trainer("StubTrainer", move |_config| {
            l.push("trainer");
            Ok(Box::new(StubTrainer { log: l.clone() }) as Box<dyn Trainer>)
        })
        .unwrap();

    registry
        .register_task("Task", taskwright::Task::from_config)
        .unwrap();

    registry
}

pub fn stub_task_config() -> TaskConfig {
    let mut config = TaskConfig::new(ComponentConfig::new("StubDataHandler"));
    config.featurizer = ComponentConfig::new("StubFeaturizer");
    config.model = ComponentConfig::new("StubModel");
    config.metric_reporter = ComponentConfig::new("StubMetricReporter");
    config.optimizer = ComponentConfig::new("StubOptimizer");
    config.trainer = ComponentConfig::new("StubTrainer");
    config
}

pub fn examples(values: &[f64]) -> Vec<RawExample> {
    values
        .iter()
        .map(|x| json!({ "x": x }).as_object().unwrap().clone())
        .collect()
}

/// Write rows as a JSON lines file
pub fn write_jsonl(dir: &Path, name: &str, rows: &[Value]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    path
}

/// Tiny separable sentiment corpus
pub fn sentiment_rows() -> Vec<Value> {
    let positive = ["good great fun", "great movie", "fun good film", "good good", "great fun"];
    let negative = ["bad awful boring", "awful movie", "boring bad film", "bad bad", "awful boring"];

    positive
        .iter()
        .map(|t| json!({"text": t, "label": "pos"}))
        .chain(negative.iter().map(|t| json!({"text": t, "label": "neg"})))
        .collect()
}
