//! Saved task snapshots
//!
//! A snapshot is a directory holding everything needed to rebuild a trained
//! task:
//!
//! - `config.json`: the run configuration
//! - `metadata.json`: vocabularies and label space
//! - `model.safetensors`: model parameters
//! - `manifest.json`: creation time and crate version

use std::path::Path;

use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::RunConfig;
use crate::data::Metadata;
use crate::error::{Error, Result};
use crate::models::{load_state, save_state, ModelState};
use crate::task::Task;

const CONFIG_FILE: &str = "config.json";
const METADATA_FILE: &str = "metadata.json";
const MODEL_FILE: &str = "model.safetensors";
const MANIFEST_FILE: &str = "manifest.json";

/// Provenance of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// When the snapshot was written
    pub created_at: DateTime<Utc>,
    /// Version of the crate that wrote it
    pub version: String,
    /// Task variant tag
    pub task_type: String,
}

/// Contents of a snapshot directory
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Run configuration the task was built from
    pub config: RunConfig,
    /// Metadata of the trained task
    pub metadata: Metadata,
    /// Trained model parameters
    pub model_state: ModelState,
    /// Provenance
    pub manifest: SnapshotManifest,
}

/// Write the configuration, metadata and model of `task` to `path`
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn save_snapshot(path: impl AsRef<Path>, config: &RunConfig, task: &Task) -> Result<()> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)?;

    std::fs::write(path.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    task.metadata()?.save(path.join(METADATA_FILE))?;
    save_state(&task.model.state_dict()?, path.join(MODEL_FILE))?;

    let manifest = SnapshotManifest {
        created_at: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        task_type: config.task.type_name.clone(),
    };
    std::fs::write(path.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;

    info!("Saved snapshot to {}", path.display());
    Ok(())
}

/// Read a snapshot directory
///
/// Model parameters are loaded on the CPU.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Snapshot> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Err(Error::config(format!("snapshot {} does not exist", path.display())));
    }

    let config: RunConfig = serde_json::from_str(&std::fs::read_to_string(path.join(CONFIG_FILE))?)?;
    config.validate()?;
    let metadata = Metadata::load(path.join(METADATA_FILE))?;
    let model_state = load_state(path.join(MODEL_FILE), &Device::Cpu)?;
    let manifest: SnapshotManifest =
        serde_json::from_str(&std::fs::read_to_string(path.join(MANIFEST_FILE))?)?;

    if manifest.version != env!("CARGO_PKG_VERSION") {
        warn!(
            "Snapshot written by version {}, running {}",
            manifest.version,
            env!("CARGO_PKG_VERSION")
        );
    }

    info!("Loaded snapshot from {} (created {})", path.display(), manifest.created_at);
    Ok(Snapshot {
        config,
        metadata,
        model_state,
        manifest,
    })
}
