//! Task assembly and orchestration against stub collaborators

mod common;

use common::*;
use serde_json::Value;
use taskwright::config::{ComponentConfig, RunConfig, SchedulerConfig};
use taskwright::{workflow, ComponentKind, Error, ExecutionContext, Model};

#[test]
fn test_assembly_order_fresh() {
    let log = CallLog::default();
    let registry = stub_registry(&log);

    let task = registry
        .create_task(&stub_task_config(), None, None, &ExecutionContext::cpu())
        .unwrap();

    assert_eq!(
        log.entries(),
        vec![
            "featurizer",
            "data_handler",
            "init_metadata",
            "model",
            "metric_reporter",
            "optimizer",
            "trainer",
        ]
    );
    assert!(task.exporter.is_none());
    assert_eq!(task.optimizers.len(), 1);
    // default scheduler config binds a constant schedule to every optimizer
    assert_eq!(task.schedulers.len(), 1);
}

#[test]
fn test_assembly_restores_metadata_and_state() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.exporter = Some(ComponentConfig::new("StubExporter"));
    config.scheduler = None;

    let mut saved = stub_metadata();
    saved.target.vocab.push("d".to_string());
    let state = StubModel::new(CallLog::default()).state_dict().unwrap();

    let task = registry
        .create_task(&config, Some(saved.clone()), Some(&state), &ExecutionContext::cpu())
        .unwrap();

    assert_eq!(
        log.entries(),
        vec![
            "featurizer",
            "data_handler",
            "load_metadata",
            "model",
            "load_state_dict",
            "metric_reporter",
            "optimizer",
            "exporter",
            "trainer",
        ]
    );
    assert_eq!(*task.metadata().unwrap(), saved);
    assert!(task.exporter.is_some());
    assert!(task.schedulers.is_empty());
}

#[test]
fn test_unregistered_component_stops_assembly() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.model = ComponentConfig::new("MissingModel");

    let err = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .err()
        .unwrap();
    assert!(err.is_config_error());
    assert!(matches!(
        err,
        Error::UnregisteredComponent {
            kind: ComponentKind::Model,
            ..
        }
    ));
    assert!(!log.contains("metric_reporter"));
}

#[test]
fn test_unregistered_task_type() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.type_name = "NoSuchTask".to_string();

    let err = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .err()
        .unwrap();
    assert!(err.is_config_error());
    assert!(log.entries().is_empty());
}

#[test]
fn test_invalid_scheduler_fails_assembly() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.scheduler = Some(SchedulerConfig::StepLr {
        step_size: 0,
        gamma: 0.5,
    });

    let err = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .err()
        .unwrap();
    assert!(err.is_config_error());
}

#[test]
fn test_predict_restores_input_order() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.data_handler = ComponentConfig::new("StubDataHandler").with_param("predict_index", vec![2, 0, 1]);

    let mut task = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .unwrap();
    let results = task.predict(&examples(&[10.0, 20.0, 30.0])).unwrap();

    // the handler batches examples as [2, 0, 1]
    let predictions: Vec<Value> = results.iter().map(|r| r["prediction"].clone()).collect();
    assert_eq!(predictions, vec![Value::from(10), Value::from(20), Value::from(30)]);
    assert!(!task.model.is_training());
    assert!(log.contains("eval"));
}

#[test]
fn test_predict_empty_examples() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut task = registry
        .create_task(&stub_task_config(), None, None, &ExecutionContext::cpu())
        .unwrap();
    assert!(task.predict(&[]).unwrap().is_empty());
}

#[test]
fn test_predict_rejects_inconsistent_index() {
    for index in [vec![0, 0, 1], vec![0, 1, 5], vec![0, 1]] {
        let log = CallLog::default();
        let registry = stub_registry(&log);
        let mut config = stub_task_config();
        config.data_handler = ComponentConfig::new("StubDataHandler").with_param("predict_index", index.clone());

        let mut task = registry
            .create_task(&config, None, None, &ExecutionContext::cpu())
            .unwrap();
        let err = task.predict(&examples(&[0.0, 1.0, 2.0])).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "index {:?} gave {}", index, err);
    }
}

#[test]
fn test_export_without_exporter_is_noop() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut task = registry
        .create_task(&stub_task_config(), None, None, &ExecutionContext::cpu())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.out");
    let mut ctx = ExecutionContext::gpu(0);
    task.export_own_model(&path, None, &mut ctx).unwrap();

    assert!(!ctx.use_gpu());
    assert!(!path.exists());
    assert!(log.contains("to_device cpu=true"));
}

#[test]
fn test_export_writes_graph_then_model() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut config = stub_task_config();
    config.exporter = Some(ComponentConfig::new("StubExporter"));
    let task = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.out");
    let mut model = StubModel::new(log.clone());
    let mut writer = RecordingGraphWriter::default();
    let mut ctx = ExecutionContext::gpu(3);

    task.export(&mut model, &path, Some(&mut writer), &mut ctx).unwrap();

    assert!(!ctx.use_gpu());
    assert_eq!(writer.graphs, vec![vec![vec![1, 1]]]);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "exported");
    assert!(log.contains("export_model training=false"));
    // written in eval mode, handed back in training mode
    assert!(model.is_training());

    let mut eval_model = StubModel::new(CallLog::default());
    eval_model.eval();
    task.export(&mut eval_model, &path, None, &mut ctx).unwrap();
    assert!(!eval_model.is_training());
}

#[test]
fn test_train_delegates_shard_to_trainer() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let config = stub_task_config();
    let mut task = registry
        .create_task(&config, None, None, &ExecutionContext::cpu())
        .unwrap();

    let run = RunConfig::new(config);
    task.train(&run, 1, 2).unwrap();
    assert!(log.contains("get_train_iter 1 2"));
    assert!(log.contains("get_eval_iter"));
    assert!(log.contains("train rank=1 optimizers=1 schedulers=1"));

    task.train_single(&run).unwrap();
    assert!(log.contains("get_train_iter 0 1"));
}

#[test]
fn test_train_model_uses_world_size_and_rank() {
    let dir = tempfile::tempdir().unwrap();
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut run = RunConfig::new(stub_task_config());
    run.distributed_world_size = 2;
    run.save_snapshot_path = dir.path().join("snap");

    workflow::train_model(&run, 1, &registry, &mut ExecutionContext::cpu()).unwrap();
    assert!(log.contains("get_train_iter 1 2"));
    // only rank 0 writes the snapshot
    assert!(!run.save_snapshot_path.exists());

    let err = workflow::train_model(&run, 2, &registry, &mut ExecutionContext::cpu()).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{}", err);
}

#[test]
fn test_test_sets_data_path() {
    let log = CallLog::default();
    let registry = stub_registry(&log);
    let mut task = registry
        .create_task(&stub_task_config(), None, None, &ExecutionContext::cpu())
        .unwrap();

    let report = task.test("held_out.jsonl").unwrap();
    assert_eq!(report.stage, taskwright::metrics::Stage::Test);
    assert_eq!(task.data_handler.test_path().unwrap().to_str(), Some("held_out.jsonl"));
    assert!(log.contains("get_test_iter held_out.jsonl"));
    assert!(log.contains("test"));
}
