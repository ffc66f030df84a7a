//! Learning rate schedulers for training optimization
//!
//! This module provides step, exponential, cosine and plateau-based schedules.
//! Each scheduler drives one optimizer; epoch-based schedules act in
//! [`LrScheduler::step_epoch`], batch-based ones in [`LrScheduler::step_batch`].

use tracing::{debug, info};

use super::Optimizer;
use crate::config::SchedulerConfig;
use crate::error::Result;

/// Trait for learning rate schedulers
pub trait LrScheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Called after every optimizer update
    fn step_batch(&mut self, _optimizer: &mut dyn Optimizer) {}

    /// Called after every epoch with the model selection metric, if any
    fn step_epoch(&mut self, optimizer: &mut dyn Optimizer, metric: Option<f64>);

    /// Get current learning rate
    fn get_lr(&self) -> f64;
}

/// Constant learning rate
pub struct ConstantScheduler {
    /// Base learning rate
    base_lr: f64,
}

impl ConstantScheduler {
    /// Create a new constant scheduler
    pub fn new(base_lr: f64) -> Self {
        Self { base_lr }
    }
}

impl LrScheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn step_epoch(&mut self, _optimizer: &mut dyn Optimizer, _metric: Option<f64>) {}

    fn get_lr(&self) -> f64 {
        self.base_lr
    }
}

/// Step learning rate scheduler
pub struct StepScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Epochs between decays
    step_size: usize,

    /// Decay factor
    gamma: f64,

    /// Completed epochs
    epoch: usize,

    /// Current learning rate
    current_lr: f64,
}

impl StepScheduler {
    /// Create a new step scheduler
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
            current_lr: base_lr,
        }
    }
}

impl LrScheduler for StepScheduler {
    fn name(&self) -> &str {
        "step_lr"
    }

    fn step_epoch(&mut self, optimizer: &mut dyn Optimizer, _metric: Option<f64>) {
        self.epoch += 1;
        let decays = (self.epoch / self.step_size) as i32;
        self.current_lr = self.base_lr * self.gamma.powi(decays);
        optimizer.set_learning_rate(self.current_lr);
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }
}

/// Exponential learning rate scheduler
pub struct ExponentialScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Decay factor per epoch
    gamma: f64,

    /// Completed epochs
    epoch: usize,

    /// Current learning rate
    current_lr: f64,
}

impl ExponentialScheduler {
    /// Create a new exponential scheduler
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            epoch: 0,
            current_lr: base_lr,
        }
    }
}

impl LrScheduler for ExponentialScheduler {
    fn name(&self) -> &str {
        "exponential"
    }

    fn step_epoch(&mut self, optimizer: &mut dyn Optimizer, _metric: Option<f64>) {
        self.epoch += 1;
        self.current_lr = self.base_lr * self.gamma.powi(self.epoch as i32);
        optimizer.set_learning_rate(self.current_lr);
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }
}

/// Cosine annealing learning rate scheduler, stepped per batch
pub struct CosineScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Minimum learning rate
    eta_min: f64,

    /// Half period in batches
    t_max: usize,

    /// Current step
    current_step: usize,

    /// Current learning rate
    current_lr: f64,
}

impl CosineScheduler {
    /// Create a new cosine scheduler
    pub fn new(base_lr: f64, eta_min: f64, t_max: usize) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            current_step: 0,
            current_lr: base_lr,
        }
    }

    /// Calculate learning rate for current step
    fn calculate_lr(&self) -> f64 {
        let progress = (self.current_step % (2 * self.t_max)) as f64 / self.t_max as f64;
        let cosine_factor = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.eta_min + (self.base_lr - self.eta_min) * cosine_factor
    }
}

impl LrScheduler for CosineScheduler {
    fn name(&self) -> &str {
        "cosine_annealing"
    }

    fn step_batch(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_step += 1;
        self.current_lr = self.calculate_lr();
        optimizer.set_learning_rate(self.current_lr);
    }

    fn step_epoch(&mut self, _optimizer: &mut dyn Optimizer, _metric: Option<f64>) {}

    fn get_lr(&self) -> f64 {
        self.current_lr
    }
}

/// Reduces the learning rate when the selection metric stops improving
pub struct PlateauScheduler {
    /// Whether smaller metrics are improvements
    lower_is_better: bool,

    /// Epochs without improvement tolerated
    patience: usize,

    /// Reduction factor
    factor: f64,

    /// Relative improvement threshold
    threshold: f64,

    /// Floor of the learning rate
    min_lr: f64,

    /// Best metric seen
    best: Option<f64>,

    /// Epochs since the best metric
    bad_epochs: usize,

    /// Current learning rate
    current_lr: f64,
}

impl PlateauScheduler {
    /// Create a new plateau scheduler
    pub fn new(
        base_lr: f64,
        lower_is_better: bool,
        patience: usize,
        factor: f64,
        threshold: f64,
        min_lr: f64,
    ) -> Self {
        Self {
            lower_is_better,
            patience,
            factor,
            threshold,
            min_lr,
            best: None,
            bad_epochs: 0,
            current_lr: base_lr,
        }
    }

    fn improves(&self, metric: f64) -> bool {
        match self.best {
            None => true,
            Some(best) if self.lower_is_better => metric < best - self.threshold * best.abs(),
            Some(best) => metric > best + self.threshold * best.abs(),
        }
    }
}

impl LrScheduler for PlateauScheduler {
    fn name(&self) -> &str {
        "reduce_lr_on_plateau"
    }

    fn step_epoch(&mut self, optimizer: &mut dyn Optimizer, metric: Option<f64>) {
        let Some(metric) = metric else {
            return;
        };

        if self.improves(metric) {
            self.best = Some(metric);
            self.bad_epochs = 0;
            return;
        }

        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            let reduced = (self.current_lr * self.factor).max(self.min_lr);
            if reduced < self.current_lr {
                info!("Reducing learning rate from {:.6} to {:.6}", self.current_lr, reduced);
                self.current_lr = reduced;
                optimizer.set_learning_rate(reduced);
            }
            self.bad_epochs = 0;
        }
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }
}

/// Build one scheduler per optimizer
///
/// `lower_is_better` orients the plateau comparison; other schedules ignore it.
pub fn create_schedulers(
    optimizers: &[Box<dyn Optimizer>],
    config: Option<&SchedulerConfig>,
    lower_is_better: bool,
) -> Result<Vec<Box<dyn LrScheduler>>> {
    let Some(config) = config else {
        return Ok(Vec::new());
    };
    config.validate()?;

    let schedulers = optimizers
        .iter()
        .map(|optimizer| {
            let base_lr = optimizer.learning_rate();
            let scheduler: Box<dyn LrScheduler> = match config {
                SchedulerConfig::None => Box::new(ConstantScheduler::new(base_lr)),
                SchedulerConfig::StepLr { step_size, gamma } => {
                    Box::new(StepScheduler::new(base_lr, *step_size, *gamma))
                }
                SchedulerConfig::Exponential { gamma } => {
                    Box::new(ExponentialScheduler::new(base_lr, *gamma))
                }
                SchedulerConfig::CosineAnnealing { t_max, eta_min } => {
                    Box::new(CosineScheduler::new(base_lr, *eta_min, *t_max))
                }
                SchedulerConfig::ReduceLrOnPlateau {
                    patience,
                    factor,
                    threshold,
                    min_lr,
                } => Box::new(PlateauScheduler::new(
                    base_lr,
                    lower_is_better,
                    *patience,
                    *factor,
                    *threshold,
                    *min_lr,
                )),
            };
            debug!("Scheduler '{}' bound to optimizer '{}'", scheduler.name(), optimizer.name());
            scheduler
        })
        .collect();

    Ok(schedulers)
}
