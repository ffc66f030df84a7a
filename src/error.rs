//! Error types for the Taskwright system

use thiserror::Error;

use crate::registry::ComponentKind;

/// Main error type for Taskwright operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No implementation registered for a config type
    #[error("Configuration error: no {kind} registered for config type '{type_name}'")]
    UnregisteredComponent {
        /// Component family that was searched
        kind: ComponentKind,
        /// Config type tag that had no registration
        type_name: String,
    },

    /// Data handler error
    #[error("Data handler error: {0}")]
    DataHandler(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Trainer error
    #[error("Trainer error: {0}")]
    Trainer(String),

    /// Export error
    #[error("Export error: {0}")]
    Export(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Taskwright operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unregistered component error
    pub fn unregistered(kind: ComponentKind, type_name: impl Into<String>) -> Self {
        Self::UnregisteredComponent {
            kind,
            type_name: type_name.into(),
        }
    }

    /// Create a data handler error
    pub fn data_handler(msg: impl Into<String>) -> Self {
        Self::DataHandler(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a trainer error
    pub fn trainer(msg: impl Into<String>) -> Self {
        Self::Trainer(msg.into())
    }

    /// Create an export error
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error was caused by a bad or unresolvable configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnregisteredComponent { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_kinds() {
        assert!(Error::config("bad").is_config_error());
        assert!(Error::unregistered(ComponentKind::Model, "Nope").is_config_error());
        assert!(!Error::model("shape mismatch").is_config_error());
        assert!(!Error::invalid_input("empty").is_config_error());
    }

    #[test]
    fn test_unregistered_message_names_kind_and_type() {
        let err = Error::unregistered(ComponentKind::Exporter, "OnnxExporter");
        let msg = err.to_string();
        assert!(msg.contains("exporter"));
        assert!(msg.contains("OnnxExporter"));
    }
}
