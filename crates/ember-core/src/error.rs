//! Error types for ember-core.

use ember_vm::{ErrorKind, VmError};
use thiserror::Error;

/// Result type alias for ember-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Descriptor construction and validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Option name not recognized
    #[error("unknown configuration option '{0}'")]
    UnknownOption(String),

    /// Value could not be parsed for its option
    #[error("invalid value '{value}' for option '{key}'")]
    InvalidValue {
        /// Option name
        key: String,
        /// Rejected value
        value: String,
    },

    /// Descriptor failed validation
    #[error("{0}")]
    Invalid(String),

    /// A required file does not exist
    #[error("{what} not found at: {path}")]
    MissingFile {
        /// Which file
        what: &'static str,
        /// Path that was checked
        path: String,
    },
}

/// Errors surfaced by the lifecycle orchestrator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from ember-vm, with its original kind
    #[error(transparent)]
    Vm(#[from] VmError),

    /// Invalid descriptor
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An operation on a VM failed; wraps the underlying cause
    #[error("failed to {operation} VMM {id}: {source}")]
    Management {
        /// VM identifier
        id: String,
        /// Operation name
        operation: &'static str,
        /// Underlying error
        #[source]
        source: Box<CoreError>,
    },

    /// VM not found in the registry
    #[error("VMM with ID {0} does not exist")]
    NotFound(String),

    /// Interactive shell failure
    #[error("SSH error: {0}")]
    Ssh(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wrap with VM id and operation context.
    pub fn management(id: impl Into<String>, operation: &'static str, source: CoreError) -> Self {
        CoreError::Management {
            id: id.into(),
            operation,
            source: Box::new(source),
        }
    }

    /// Kind of the innermost ember-vm error, if any.
    pub fn vm_kind(&self) -> Option<ErrorKind> {
        match self {
            CoreError::Vm(e) => Some(e.kind()),
            CoreError::Config(_) => Some(ErrorKind::Config),
            CoreError::Management { source, .. } => source.vm_kind(),
            _ => None,
        }
    }

    /// Configuration and process errors keep their kind through `create`.
    pub(crate) fn is_passthrough(&self) -> bool {
        matches!(
            self,
            CoreError::Config(_)
                | CoreError::Vm(VmError::Config(_))
                | CoreError::Vm(VmError::Process(_))
        )
    }
}
