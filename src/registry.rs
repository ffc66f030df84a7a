//! Component registry and factories
//!
//! Every pluggable component family has a typed [`Registry`] mapping config
//! type tags to factories. [`ComponentRegistry`] groups the families and
//! exposes one `create_*` helper per family, fixing the argument list the
//! family's factories receive.
//!
//! ```no_run
//! use taskwright::registry::ComponentRegistry;
//! use taskwright::trainer::{EpochTrainer, Trainer};
//!
//! let mut registry = ComponentRegistry::with_builtins().unwrap();
//! registry
//!     .register_trainer("QuickTrainer", |config| Ok(Box::new(EpochTrainer::from_config(config)?) as Box<dyn Trainer>))
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_nn::VarMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::{ComponentConfig, FeatureConfig, LabelConfig, TaskConfig};
use crate::data::{
    DataHandler, DocClassificationDataHandler, Featurizer, Metadata, SimpleFeaturizer,
};
use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::exporter::{Exporter, SafetensorsExporter};
use crate::metrics::{ClassificationMetricReporter, MetricReporter};
use crate::models::{DocModel, Model, ModelState};
use crate::optim::{self, Optimizer};
use crate::task::{LabelFormatter, Task};
use crate::trainer::{EpochTrainer, Trainer};

/// Component families known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Task variants
    Task,
    /// Featurizers
    Featurizer,
    /// Data handlers
    DataHandler,
    /// Models
    Model,
    /// Metric reporters
    MetricReporter,
    /// Optimizers
    Optimizer,
    /// Exporters
    Exporter,
    /// Trainers
    Trainer,
}

impl ComponentKind {
    /// Every family, in assembly order
    pub const ALL: [ComponentKind; 8] = [
        ComponentKind::Task,
        ComponentKind::Featurizer,
        ComponentKind::DataHandler,
        ComponentKind::Model,
        ComponentKind::MetricReporter,
        ComponentKind::Optimizer,
        ComponentKind::Exporter,
        ComponentKind::Trainer,
    ];
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Task => "task",
            ComponentKind::Featurizer => "featurizer",
            ComponentKind::DataHandler => "data handler",
            ComponentKind::Model => "model",
            ComponentKind::MetricReporter => "metric reporter",
            ComponentKind::Optimizer => "optimizer",
            ComponentKind::Exporter => "exporter",
            ComponentKind::Trainer => "trainer",
        };
        f.write_str(name)
    }
}

/// Builds a featurizer
pub type FeaturizerFactory =
    dyn Fn(&ComponentConfig, &FeatureConfig) -> Result<Arc<dyn Featurizer>> + Send + Sync;

/// Builds a data handler
pub type DataHandlerFactory = dyn Fn(&ComponentConfig, &FeatureConfig, &LabelConfig, Arc<dyn Featurizer>) -> Result<Box<dyn DataHandler>>
    + Send
    + Sync;

/// Builds a model
pub type ModelFactory =
    dyn Fn(&ComponentConfig, &FeatureConfig, Arc<Metadata>) -> Result<Box<dyn Model>> + Send + Sync;

/// Builds a metric reporter
pub type MetricReporterFactory =
    dyn Fn(&ComponentConfig, Arc<Metadata>) -> Result<Box<dyn MetricReporter>> + Send + Sync;

/// Builds the optimizers of a model's parameters
pub type OptimizerFactory =
    dyn Fn(&ComponentConfig, &VarMap) -> Result<Vec<Box<dyn Optimizer>>> + Send + Sync;

/// Builds an exporter
pub type ExporterFactory = dyn Fn(
        &ComponentConfig,
        &FeatureConfig,
        &LabelConfig,
        Arc<Metadata>,
        &ComponentConfig,
    ) -> Result<Box<dyn Exporter>>
    + Send
    + Sync;

/// Builds a trainer
pub type TrainerFactory = dyn Fn(&ComponentConfig) -> Result<Box<dyn Trainer>> + Send + Sync;

/// Builds a task variant
pub type TaskFactory = dyn Fn(
        &TaskConfig,
        &ComponentRegistry,
        Option<Metadata>,
        Option<&ModelState>,
        &ExecutionContext,
    ) -> Result<Task>
    + Send
    + Sync;

/// Type tag to factory mapping for one component family
pub struct Registry<F: ?Sized> {
    kind: ComponentKind,
    factories: HashMap<String, Arc<F>>,
}

impl<F: ?Sized> Registry<F> {
    /// Create an empty registry for a family
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            factories: HashMap::new(),
        }
    }

    /// Family served by this registry
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Register a factory under a type tag
    ///
    /// Empty and already registered tags are configuration errors.
    pub fn register(&mut self, type_name: impl Into<String>, factory: Arc<F>) -> Result<()> {
        let type_name = type_name.into();
        if type_name.trim().is_empty() {
            return Err(Error::config(format!("{} type name must not be empty", self.kind)));
        }
        if self.factories.contains_key(&type_name) {
            return Err(Error::config(format!(
                "{} '{}' is already registered",
                self.kind, type_name
            )));
        }
        self.factories.insert(type_name, factory);
        Ok(())
    }

    /// Whether a type tag is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Factory registered for a type tag
    pub fn lookup(&self, type_name: &str) -> Result<&F> {
        self.factories
            .get(type_name)
            .map(|factory| factory.as_ref())
            .ok_or_else(|| Error::unregistered(self.kind, type_name))
    }

    /// Resolve `config.type_name` and invoke its factory through `build`
    pub fn create_component<T>(
        &self,
        config: &ComponentConfig,
        build: impl FnOnce(&F) -> Result<T>,
    ) -> Result<T> {
        build(self.lookup(&config.type_name)?)
    }

    /// Registered type tags, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

static GLOBAL: Lazy<ComponentRegistry> = Lazy::new(|| {
    ComponentRegistry::with_builtins().unwrap_or_else(|err| {
        error!("Failed to register built-in components: {}", err);
        ComponentRegistry::new()
    })
});

/// All component families
pub struct ComponentRegistry {
    tasks: Registry<TaskFactory>,
    featurizers: Registry<FeaturizerFactory>,
    data_handlers: Registry<DataHandlerFactory>,
    models: Registry<ModelFactory>,
    metric_reporters: Registry<MetricReporterFactory>,
    optimizers: Registry<OptimizerFactory>,
    exporters: Registry<ExporterFactory>,
    trainers: Registry<TrainerFactory>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    /// Registry with no registrations
    pub fn new() -> Self {
        Self {
            tasks: Registry::new(ComponentKind::Task),
            featurizers: Registry::new(ComponentKind::Featurizer),
            data_handlers: Registry::new(ComponentKind::DataHandler),
            models: Registry::new(ComponentKind::Model),
            metric_reporters: Registry::new(ComponentKind::MetricReporter),
            optimizers: Registry::new(ComponentKind::Optimizer),
            exporters: Registry::new(ComponentKind::Exporter),
            trainers: Registry::new(ComponentKind::Trainer),
        }
    }

    /// Registry holding the built-in components
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_builtins()?;
        Ok(registry)
    }

    /// Process-wide registry of the built-in components
    pub fn global() -> &'static ComponentRegistry {
        &GLOBAL
    }

    /// Register the built-in component of every family
    pub fn register_builtins(&mut self) -> Result<()> {
        self.register_task("Task", Task::from_config)?;
        self.register_task("DocClassificationTask", |config, registry, metadata, state, ctx| {
            let formatter = LabelFormatter::new(config.labels.name.clone());
            Ok(Task::from_config(config, registry, metadata, state, ctx)?.with_formatter(Box::new(formatter)))
        })?;

        self.register_featurizer("SimpleFeaturizer", |config, features| {
            Ok(Arc::new(SimpleFeaturizer::from_config(config, features)?) as Arc<dyn Featurizer>)
        })?;

        self.register_data_handler("DocClassificationDataHandler", |config, features, labels, featurizer| {
            Ok(Box::new(DocClassificationDataHandler::from_config(config, features, labels, featurizer)?)
                as Box<dyn DataHandler>)
        })?;

        self.register_model("DocModel", |config, features, metadata| {
            Ok(Box::new(DocModel::from_config(config, features, metadata)?) as Box<dyn Model>)
        })?;

        self.register_metric_reporter("ClassificationMetricReporter", |config, metadata| {
            Ok(Box::new(ClassificationMetricReporter::from_config(config, metadata)?) as Box<dyn MetricReporter>)
        })?;

        self.register_optimizer("Adam", optim::create_adam)?;
        self.register_optimizer("AdamW", optim::create_adamw)?;
        self.register_optimizer("SGD", optim::create_sgd)?;

        self.register_exporter(
            "SafetensorsExporter",
            |config, features, labels, metadata, model_config| {
                Ok(Box::new(SafetensorsExporter::from_config(config, features, labels, metadata, model_config)?)
                    as Box<dyn Exporter>)
            },
        )?;

        self.register_trainer("Trainer", |config| {
            Ok(Box::new(EpochTrainer::from_config(config)?) as Box<dyn Trainer>)
        })?;

        Ok(())
    }

    /// Register a task variant
    pub fn register_task<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&TaskConfig, &ComponentRegistry, Option<Metadata>, Option<&ModelState>, &ExecutionContext) -> Result<Task>
            + Send
            + Sync
            + 'static,
    {
        self.tasks.register(type_name, Arc::new(factory))
    }

    /// Register a featurizer
    pub fn register_featurizer<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, &FeatureConfig) -> Result<Arc<dyn Featurizer>> + Send + Sync + 'static,
    {
        self.featurizers.register(type_name, Arc::new(factory))
    }

    /// Register a data handler
    pub fn register_data_handler<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, &FeatureConfig, &LabelConfig, Arc<dyn Featurizer>) -> Result<Box<dyn DataHandler>>
            + Send
            + Sync
            + 'static,
    {
        self.data_handlers.register(type_name, Arc::new(factory))
    }

    /// Register a model
    pub fn register_model<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, &FeatureConfig, Arc<Metadata>) -> Result<Box<dyn Model>> + Send + Sync + 'static,
    {
        self.models.register(type_name, Arc::new(factory))
    }

    /// Register a metric reporter
    pub fn register_metric_reporter<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, Arc<Metadata>) -> Result<Box<dyn MetricReporter>> + Send + Sync + 'static,
    {
        self.metric_reporters.register(type_name, Arc::new(factory))
    }

    /// Register an optimizer
    pub fn register_optimizer<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, &VarMap) -> Result<Vec<Box<dyn Optimizer>>> + Send + Sync + 'static,
    {
        self.optimizers.register(type_name, Arc::new(factory))
    }

    /// Register an exporter
    pub fn register_exporter<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig, &FeatureConfig, &LabelConfig, Arc<Metadata>, &ComponentConfig) -> Result<Box<dyn Exporter>>
            + Send
            + Sync
            + 'static,
    {
        self.exporters.register(type_name, Arc::new(factory))
    }

    /// Register a trainer
    pub fn register_trainer<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ComponentConfig) -> Result<Box<dyn Trainer>> + Send + Sync + 'static,
    {
        self.trainers.register(type_name, Arc::new(factory))
    }

    /// Assemble the task variant named by `config.type_name`
    pub fn create_task(
        &self,
        config: &TaskConfig,
        metadata: Option<Metadata>,
        model_state: Option<&ModelState>,
        ctx: &ExecutionContext,
    ) -> Result<Task> {
        let factory = self.tasks.lookup(&config.type_name)?;
        factory(config, self, metadata, model_state, ctx)
    }

    /// Build a featurizer
    pub fn create_featurizer(
        &self,
        config: &ComponentConfig,
        features: &FeatureConfig,
    ) -> Result<Arc<dyn Featurizer>> {
        self.featurizers
            .create_component(config, |factory| factory(config, features))
    }

    /// Build a data handler
    pub fn create_data_handler(
        &self,
        config: &ComponentConfig,
        features: &FeatureConfig,
        labels: &LabelConfig,
        featurizer: Arc<dyn Featurizer>,
    ) -> Result<Box<dyn DataHandler>> {
        self.data_handlers
            .create_component(config, |factory| factory(config, features, labels, featurizer))
    }

    /// Build a model
    pub fn create_model(
        &self,
        config: &ComponentConfig,
        features: &FeatureConfig,
        metadata: Arc<Metadata>,
    ) -> Result<Box<dyn Model>> {
        self.models
            .create_component(config, |factory| factory(config, features, metadata))
    }

    /// Build a metric reporter
    pub fn create_metric_reporter(
        &self,
        config: &ComponentConfig,
        metadata: Arc<Metadata>,
    ) -> Result<Box<dyn MetricReporter>> {
        self.metric_reporters
            .create_component(config, |factory| factory(config, metadata))
    }

    /// Build the optimizers of a parameter set
    pub fn create_optimizer(
        &self,
        config: &ComponentConfig,
        parameters: &VarMap,
    ) -> Result<Vec<Box<dyn Optimizer>>> {
        self.optimizers
            .create_component(config, |factory| factory(config, parameters))
    }

    /// Build an exporter
    pub fn create_exporter(
        &self,
        config: &ComponentConfig,
        features: &FeatureConfig,
        labels: &LabelConfig,
        metadata: Arc<Metadata>,
        model_config: &ComponentConfig,
    ) -> Result<Box<dyn Exporter>> {
        self.exporters.create_component(config, |factory| {
            factory(config, features, labels, metadata, model_config)
        })
    }

    /// Build a trainer
    pub fn create_trainer(&self, config: &ComponentConfig) -> Result<Box<dyn Trainer>> {
        self.trainers
            .create_component(config, |factory| factory(config))
    }

    /// Registered type tags of a family, sorted
    pub fn registered_types(&self, kind: ComponentKind) -> Vec<String> {
        match kind {
            ComponentKind::Task => self.tasks.registered_types(),
            ComponentKind::Featurizer => self.featurizers.registered_types(),
            ComponentKind::DataHandler => self.data_handlers.registered_types(),
            ComponentKind::Model => self.models.registered_types(),
            ComponentKind::MetricReporter => self.metric_reporters.registered_types(),
            ComponentKind::Optimizer => self.optimizers.registered_types(),
            ComponentKind::Exporter => self.exporters.registered_types(),
            ComponentKind::Trainer => self.trainers.registered_types(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ComponentRegistry::global();
        assert_eq!(
            registry.registered_types(ComponentKind::Optimizer),
            vec!["Adam".to_string(), "AdamW".to_string(), "SGD".to_string()]
        );
        assert_eq!(
            registry.registered_types(ComponentKind::Task),
            vec!["DocClassificationTask".to_string(), "Task".to_string()]
        );
        for kind in ComponentKind::ALL {
            assert!(!registry.registered_types(kind).is_empty(), "{} has no builtins", kind);
        }
    }

    #[test]
    fn test_unregistered_type_is_config_error() {
        let registry = ComponentRegistry::with_builtins().unwrap();
        let err = registry
            .create_trainer(&ComponentConfig::new("NoSuchTrainer"))
            .err()
            .unwrap();
        assert!(err.is_config_error());
        assert!(matches!(
            err,
            Error::UnregisteredComponent {
                kind: ComponentKind::Trainer,
                ..
            }
        ));
        assert!(err.to_string().contains("NoSuchTrainer"));
    }

    #[test]
    fn test_duplicate_and_empty_registration_rejected() {
        let mut registry = ComponentRegistry::with_builtins().unwrap();
        let err = registry
            .register_trainer("Trainer", |config| Ok(Box::new(EpochTrainer::from_config(config)?) as Box<dyn Trainer>))
            .unwrap_err();
        assert!(err.is_config_error());

        let err = registry
            .register_trainer("  ", |config| Ok(Box::new(EpochTrainer::from_config(config)?) as Box<dyn Trainer>))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_builtins_fail_when_already_registered() {
        let mut registry = ComponentRegistry::with_builtins().unwrap();
        let err = registry.register_builtins().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ComponentRegistry::new();
        assert!(registry.registered_types(ComponentKind::Trainer).is_empty());

        registry
            .register_trainer("Quick", |config| Ok(Box::new(EpochTrainer::from_config(config)?) as Box<dyn Trainer>))
            .unwrap();
        let config = ComponentConfig::new("Quick").with_param("epochs", 1);
        assert!(registry.create_trainer(&config).is_ok());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ComponentKind::DataHandler.to_string(), "data handler");
        assert_eq!(ComponentKind::Exporter.to_string(), "exporter");
    }
}
