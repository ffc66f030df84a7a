//! Optimizers and learning rate schedulers
//!
//! Optimizers wrap the `candle_nn` implementations behind an object-safe trait
//! so a task can hold a heterogeneous list of them. Schedulers adjust the
//! learning rate of one optimizer each.

pub mod schedulers;

pub use schedulers::{
    create_schedulers, ConstantScheduler, CosineScheduler, ExponentialScheduler, LrScheduler,
    PlateauScheduler, StepScheduler,
};

use candle_core::backprop::GradStore;
use candle_nn::{AdamW, ParamsAdamW, VarMap, SGD};
use serde::{Deserialize, Serialize};

use crate::config::ComponentConfig;
use crate::error::{Error, Result};

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from computed gradients
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

/// Adapter from a `candle_nn` optimizer to [`Optimizer`]
pub struct CandleOptimizer<O> {
    name: String,
    inner: O,
    steps: usize,
}

impl<O: candle_nn::Optimizer> CandleOptimizer<O> {
    /// Wrap a candle optimizer
    pub fn new(name: impl Into<String>, inner: O) -> Self {
        Self {
            name: name.into(),
            inner,
            steps: 0,
        }
    }
}

impl<O: candle_nn::Optimizer + Send> Optimizer for CandleOptimizer<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.inner.step(gradients)?;
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn step_count(&self) -> usize {
        self.steps
    }
}

/// Parameters of the `Adam` and `AdamW` optimizers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AdamParams {
    /// Learning rate
    pub lr: f64,
    /// First moment decay
    pub beta1: f64,
    /// Second moment decay
    pub beta2: f64,
    /// Numerical stability term
    pub eps: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Parameters of the `SGD` optimizer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SgdParams {
    /// Learning rate
    pub lr: f64,
}

impl Default for SgdParams {
    fn default() -> Self {
        Self { lr: 0.01 }
    }
}

fn check_lr(lr: f64) -> Result<()> {
    if !(lr > 0.0) {
        return Err(Error::config("optimizer lr must be > 0"));
    }
    Ok(())
}

fn trainable_vars(parameters: &VarMap) -> Result<Vec<candle_core::Var>> {
    let vars = parameters.all_vars();
    if vars.is_empty() {
        return Err(Error::config("model has no trainable parameters"));
    }
    Ok(vars)
}

fn adam_family(name: &str, params: AdamParams, parameters: &VarMap) -> Result<Vec<Box<dyn Optimizer>>> {
    check_lr(params.lr)?;
    let config = ParamsAdamW {
        lr: params.lr,
        beta1: params.beta1,
        beta2: params.beta2,
        eps: params.eps,
        weight_decay: params.weight_decay,
    };
    let inner = <AdamW as candle_nn::Optimizer>::new(trainable_vars(parameters)?, config)?;
    Ok(vec![Box::new(CandleOptimizer::new(name, inner)) as Box<dyn Optimizer>])
}

/// Adam, as AdamW with weight decay off unless configured
pub fn create_adam(config: &ComponentConfig, parameters: &VarMap) -> Result<Vec<Box<dyn Optimizer>>> {
    adam_family("adam", config.params()?, parameters)
}

/// AdamW with decoupled weight decay (default 0.01)
pub fn create_adamw(config: &ComponentConfig, parameters: &VarMap) -> Result<Vec<Box<dyn Optimizer>>> {
    let mut params = AdamParams {
        weight_decay: 0.01,
        ..AdamParams::default()
    };
    if !config.params.is_empty() {
        let mut merged = serde_json::to_value(&params)?;
        if let Some(map) = merged.as_object_mut() {
            map.extend(config.params.clone());
        }
        params = serde_json::from_value(merged).map_err(|e| {
            Error::config(format!("invalid parameters for '{}': {}", config.type_name, e))
        })?;
    }
    adam_family("adamw", params, parameters)
}

/// Plain stochastic gradient descent
pub fn create_sgd(config: &ComponentConfig, parameters: &VarMap) -> Result<Vec<Box<dyn Optimizer>>> {
    let params: SgdParams = config.params()?;
    check_lr(params.lr)?;
    let inner = <SGD as candle_nn::Optimizer>::new(trainable_vars(parameters)?, params.lr)?;
    Ok(vec![Box::new(CandleOptimizer::new("sgd", inner)) as Box<dyn Optimizer>])
}
