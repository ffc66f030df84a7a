//! Execution context selecting where models run
//!
//! The context is an explicit value handed to task assembly and export. It is
//! the only place GPU execution is switched on or off.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::Result;

/// Device selection for model placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    use_gpu: bool,
    gpu_ordinal: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ExecutionContext {
    /// CPU-only execution
    pub fn cpu() -> Self {
        Self {
            use_gpu: false,
            gpu_ordinal: 0,
        }
    }

    /// GPU execution on the given ordinal
    pub fn gpu(ordinal: usize) -> Self {
        Self {
            use_gpu: true,
            gpu_ordinal: ordinal,
        }
    }

    /// Build the context a run asks for, falling back to CPU when CUDA is absent
    pub fn from_run_config(config: &RunConfig) -> Self {
        if !config.use_cuda_if_available {
            return Self::cpu();
        }

        if candle_core::utils::cuda_is_available() {
            debug!("CUDA available, using GPU {}", config.cuda_device_id);
            Self::gpu(config.cuda_device_id)
        } else {
            warn!("use_cuda_if_available set but CUDA is not available, running on CPU");
            Self::cpu()
        }
    }

    /// Whether models are placed on the GPU
    pub fn use_gpu(&self) -> bool {
        self.use_gpu
    }

    /// GPU ordinal used when GPU execution is enabled
    pub fn gpu_ordinal(&self) -> usize {
        self.gpu_ordinal
    }

    /// Switch to CPU execution
    pub fn disable_gpu(&mut self) {
        self.use_gpu = false;
    }

    /// The device models should be placed on
    pub fn device(&self) -> Result<Device> {
        if self.use_gpu {
            Ok(Device::new_cuda(self.gpu_ordinal)?)
        } else {
            Ok(Device::Cpu)
        }
    }
}
