//! Model contract and parameter state handling

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::{Error, Result};

pub mod doc_model;

pub use doc_model::{DocModel, DocModelConfig};

/// Named parameter tensors of a model
pub type ModelState = HashMap<String, Tensor>;

/// A trainable model
pub trait Model: Send {
    /// Forward pass producing raw outputs (logits)
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor>;

    /// Loss of raw outputs against target indices
    fn get_loss(&self, output: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Decode raw outputs into predicted indices and per-class scores
    fn get_pred(&self, output: &Tensor) -> Result<(Vec<usize>, Vec<Vec<f32>>)>;

    /// Replace parameter values
    fn load_state_dict(&mut self, state: &ModelState) -> Result<()>;

    /// Current parameter values
    fn state_dict(&self) -> Result<ModelState>;

    /// Move parameters to a device
    fn to_device(&mut self, device: &Device) -> Result<()>;

    /// Device holding the parameters
    fn device(&self) -> &Device;

    /// Switch to evaluation mode
    fn eval(&mut self);

    /// Switch to training mode
    fn train_mode(&mut self);

    /// Whether the model is in training mode
    fn is_training(&self) -> bool;

    /// Trainable parameters
    fn parameters(&self) -> &VarMap;
}

/// Snapshot the variables of a var map
pub fn varmap_state(varmap: &VarMap) -> Result<ModelState> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter lock poisoned"))?;
    // Optimizers update variables in place, so the snapshot owns its storage.
    let state = data
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect::<candle_core::Result<ModelState>>()?;
    Ok(state)
}

/// Copy saved values into the variables of a var map
///
/// Every variable must be present in `state` with the same shape, and `state`
/// must not hold names the var map does not know.
pub fn load_varmap_state(varmap: &VarMap, state: &ModelState) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter lock poisoned"))?;

    if let Some(unexpected) = state.keys().find(|k| !data.contains_key(k.as_str())) {
        return Err(Error::model(format!("unexpected parameter '{}' in state", unexpected)));
    }

    for (name, var) in data.iter() {
        let value = state
            .get(name)
            .ok_or_else(|| Error::model(format!("missing parameter '{}' in state", name)))?;
        if value.dims() != var.dims() {
            return Err(Error::model(format!(
                "shape mismatch for '{}': expected {:?}, got {:?}",
                name,
                var.dims(),
                value.dims()
            )));
        }
        var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }

    Ok(())
}

/// Save model state as safetensors
pub fn save_state(state: &ModelState, path: impl AsRef<Path>) -> Result<()> {
    candle_core::safetensors::save(state, path)?;
    Ok(())
}

/// Load model state from safetensors
pub fn load_state(path: impl AsRef<Path>, device: &Device) -> Result<ModelState> {
    Ok(candle_core::safetensors::load(path, device)?)
}
