//! Taskwright - configuration-driven ML task orchestration
//!
//! A declarative [`RunConfig`] selects a featurizer, data handler, model,
//! optimizers, learning rate schedulers, metric reporter, optional exporter
//! and trainer. [`Task::from_config`] resolves each of them through the
//! [`ComponentRegistry`] in dependency order and yields a [`Task`] with
//! uniform train, test, predict and export entry points.
//!
//! ```no_run
//! use taskwright::{ComponentRegistry, ExecutionContext, RunConfig};
//!
//! # fn main() -> taskwright::Result<()> {
//! let config = RunConfig::from_file("run.yaml")?;
//! let ctx = ExecutionContext::from_run_config(&config);
//! let mut task = ComponentRegistry::global().create_task(&config.task, None, None, &ctx)?;
//! let outcome = task.train_single(&config)?;
//! println!("best metric: {:?}", outcome.best_metric);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod models;
pub mod optim;
pub mod registry;
pub mod snapshot;
pub mod task;
pub mod trainer;
pub mod workflow;

// Re-exports
pub use config::{ComponentConfig, FeatureConfig, LabelConfig, RunConfig, SchedulerConfig, TaskConfig};
pub use data::{BatchContext, BatchIterator, DataHandler, Featurizer, Metadata, RawExample};
pub use device::ExecutionContext;
pub use error::{Error, Result};
pub use exporter::{Exporter, GraphWriter};
pub use metrics::{MetricReport, MetricReporter};
pub use models::{Model, ModelState};
pub use optim::{LrScheduler, Optimizer};
pub use registry::{ComponentKind, ComponentRegistry, Registry};
pub use task::{PredictionFormatter, PredictionRecord, Task};
pub use trainer::{TrainOutcome, Trainer};
