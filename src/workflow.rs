//! End-to-end runs composed from task assembly and snapshots

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::config::RunConfig;
use crate::data::RawExample;
use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::metrics::MetricReport;
use crate::registry::ComponentRegistry;
use crate::snapshot::{load_snapshot, save_snapshot};
use crate::task::{PredictionRecord, Task};
use crate::trainer::TrainOutcome;

/// Assemble the task of a run, restoring `load_snapshot_path` when set
#[instrument(skip_all)]
pub fn prepare_task(config: &RunConfig, registry: &ComponentRegistry, ctx: &ExecutionContext) -> Result<Task> {
    match &config.load_snapshot_path {
        Some(path) => {
            info!("Restoring metadata and model from {}", path.display());
            let snapshot = load_snapshot(path)?;
            registry.create_task(&config.task, Some(snapshot.metadata), Some(&snapshot.model_state), ctx)
        }
        None => registry.create_task(&config.task, None, None, ctx),
    }
}

/// Train shard `rank` of `distributed_world_size`, then save, test and export
///
/// Only rank 0 writes the snapshot, the test metrics and the export. Test
/// metrics are written to `test_out_path` when both it and the data handler's
/// test data are configured.
#[instrument(skip_all, fields(rank = rank, world_size = config.distributed_world_size))]
pub fn train_model(
    config: &RunConfig,
    rank: usize,
    registry: &ComponentRegistry,
    ctx: &mut ExecutionContext,
) -> Result<TrainOutcome> {
    let world_size = config.distributed_world_size;
    if rank >= world_size {
        return Err(Error::invalid_input(format!(
            "rank {} out of range for world size {}",
            rank, world_size
        )));
    }

    let mut task = prepare_task(config, registry, ctx)?;
    let outcome = task.train(config, rank, world_size)?;

    if rank != 0 {
        debug!("Rank {} leaves snapshot and export to rank 0", rank);
        return Ok(outcome);
    }

    save_snapshot(&config.save_snapshot_path, config, &task)?;

    if let Some(out_path) = &config.test_out_path {
        if let Some(test_path) = task.data_handler.test_path().map(Path::to_path_buf) {
            let report = task.test(test_path)?;
            report.save(out_path)?;
            info!("Wrote test metrics to {}", out_path.display());
        }
    }

    if let Some(export_path) = &config.export_path {
        task.export_own_model(export_path, None, ctx)?;
    }

    Ok(outcome)
}

/// Evaluate a saved task on the data at `test_path`
#[instrument(skip_all)]
pub fn test_model_from_snapshot(
    snapshot_path: &Path,
    test_path: &Path,
    registry: &ComponentRegistry,
    ctx: &ExecutionContext,
) -> Result<MetricReport> {
    let snapshot = load_snapshot(snapshot_path)?;
    let mut task = registry.create_task(
        &snapshot.config.task,
        Some(snapshot.metadata),
        Some(&snapshot.model_state),
        ctx,
    )?;

    let report = task.test(test_path)?;
    if let Some(out_path) = &snapshot.config.test_out_path {
        report.save(out_path)?;
    }
    Ok(report)
}

/// Predict raw examples with a saved task
#[instrument(skip_all, fields(examples = examples.len()))]
pub fn predict_from_snapshot(
    snapshot_path: &Path,
    examples: &[RawExample],
    registry: &ComponentRegistry,
    ctx: &ExecutionContext,
) -> Result<Vec<PredictionRecord>> {
    let snapshot = load_snapshot(snapshot_path)?;
    let mut task = registry.create_task(
        &snapshot.config.task,
        Some(snapshot.metadata),
        Some(&snapshot.model_state),
        ctx,
    )?;
    task.predict(examples)
}

/// Export a saved task's model to `export_path`
#[instrument(skip_all)]
pub fn export_saved_model(
    snapshot_path: &Path,
    export_path: &Path,
    registry: &ComponentRegistry,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    let snapshot = load_snapshot(snapshot_path)?;
    let mut task = registry.create_task(
        &snapshot.config.task,
        Some(snapshot.metadata),
        Some(&snapshot.model_state),
        ctx,
    )?;
    task.export_own_model(export_path, None, ctx)
}
