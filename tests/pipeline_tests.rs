//! End-to-end runs of the built-in document classification pipeline

mod common;

use std::path::Path;

use common::*;
use serde_json::{json, Value};
use taskwright::exporter::{ExportManifest, SafetensorsExporter};
use taskwright::metrics::MetricReport;
use taskwright::snapshot::{load_snapshot, save_snapshot};
use taskwright::{workflow, ComponentRegistry, ExecutionContext, Model, RawExample, RunConfig};

fn write_run_config(dir: &Path) -> RunConfig {
    let data = write_jsonl(dir, "train.jsonl", &sentiment_rows());
    let yaml = format!(
        r#"
task:
  type: DocClassificationTask
  features:
    word_feat:
      embed_dim: 16
  data_handler:
    type: DocClassificationDataHandler
    train_path: {data}
    eval_path: {data}
    test_path: {data}
    train_batch_size: 4
    eval_batch_size: 4
  model:
    type: DocModel
    dropout: 0.0
  optimizer:
    type: Adam
    lr: 0.05
  trainer:
    type: Trainer
    epochs: 40
  exporter:
    type: SafetensorsExporter
save_snapshot_path: {snapshot}
export_path: {export}
test_out_path: {test_out}
random_seed: 7
"#,
        data = data.display(),
        snapshot = dir.join("model.snapshot").display(),
        export = dir.join("export").join("model.safetensors").display(),
        test_out = dir.join("test_metrics.json").display(),
    );

    let path = dir.join("run.yaml");
    std::fs::write(&path, yaml).unwrap();
    RunConfig::from_file(&path).unwrap()
}

fn texts(texts: &[&str]) -> Vec<RawExample> {
    texts
        .iter()
        .map(|t| json!({ "text": t }).as_object().unwrap().clone())
        .collect()
}

#[test]
fn test_train_predict_test_export() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_run_config(dir.path());
    let registry = ComponentRegistry::global();
    let mut ctx = ExecutionContext::cpu();

    let outcome = workflow::train_model(&config, 0, registry, &mut ctx).unwrap();
    assert!(outcome.epochs_run > 0);
    assert!(outcome.best_metric.unwrap() >= 0.9);

    let snapshot = dir.path().join("model.snapshot");
    for file in ["config.json", "metadata.json", "model.safetensors", "manifest.json"] {
        assert!(snapshot.join(file).exists(), "snapshot is missing {}", file);
    }

    let test_report: MetricReport =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("test_metrics.json")).unwrap()).unwrap();
    assert_eq!(test_report.num_examples, 10);

    let export = dir.path().join("export").join("model.safetensors");
    assert!(export.exists());
    let manifest: ExportManifest =
        serde_json::from_str(&std::fs::read_to_string(SafetensorsExporter::manifest_path(&export)).unwrap()).unwrap();
    assert_eq!(manifest.labels, vec!["neg".to_string(), "pos".to_string()]);
    assert_eq!(manifest.output_name, "doc_label");

    let predictions = workflow::predict_from_snapshot(
        &snapshot,
        &texts(&["bad awful boring", "good great fun", "great fun"]),
        registry,
        &ExecutionContext::cpu(),
    )
    .unwrap();
    let labels: Vec<&Value> = predictions.iter().map(|p| &p["doc_label"]).collect();
    assert_eq!(labels, vec![&json!("neg"), &json!("pos"), &json!("pos")]);
    assert!(predictions[0]["scores"]["neg"].as_f64().unwrap() > 0.5);

    let report = workflow::test_model_from_snapshot(
        &snapshot,
        &dir.path().join("train.jsonl"),
        registry,
        &ExecutionContext::cpu(),
    )
    .unwrap();
    assert!(report.get("accuracy").unwrap() >= 0.9);

    let exported_again = dir.path().join("again.safetensors");
    let mut ctx = ExecutionContext::cpu();
    workflow::export_saved_model(&snapshot, &exported_again, registry, &mut ctx).unwrap();
    assert!(exported_again.exists());
}

#[test]
fn test_snapshot_restores_identical_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_run_config(dir.path());
    let registry = ComponentRegistry::global();
    let ctx = ExecutionContext::cpu();

    let mut task = registry.create_task(&config.task, None, None, &ctx).unwrap();
    let snapshot = dir.path().join("snap");
    save_snapshot(&snapshot, &config, &task).unwrap();

    let loaded = load_snapshot(&snapshot).unwrap();
    assert_eq!(loaded.metadata, *task.metadata().unwrap());
    assert_eq!(loaded.manifest.task_type, "DocClassificationTask");
    assert_eq!(loaded.manifest.version, env!("CARGO_PKG_VERSION"));

    let original_state = task.model.state_dict().unwrap();
    assert_eq!(loaded.model_state.len(), original_state.len());
    for (name, tensor) in &original_state {
        let restored = loaded.model_state[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(restored, tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap(), "{}", name);
    }

    let mut restored = registry
        .create_task(&loaded.config.task, Some(loaded.metadata.clone()), Some(&loaded.model_state), &ctx)
        .unwrap();
    let examples = texts(&["good movie", "bad film", "unseen words here"]);
    let before = task.predict(&examples).unwrap();
    let after = restored.predict(&examples).unwrap();
    assert_eq!(before.len(), 3);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a["doc_label"], b["doc_label"]);
    }
}

#[test]
fn test_prepare_task_from_snapshot_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_run_config(dir.path());
    let registry = ComponentRegistry::global();
    let ctx = ExecutionContext::cpu();

    let task = workflow::prepare_task(&config, registry, &ctx).unwrap();
    let snapshot = dir.path().join("snap");
    save_snapshot(&snapshot, &config, &task).unwrap();

    config.load_snapshot_path = Some(snapshot);
    let restored = workflow::prepare_task(&config, registry, &ctx).unwrap();
    assert_eq!(*restored.metadata().unwrap(), *task.metadata().unwrap());
}
