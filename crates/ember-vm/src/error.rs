//! Error types for ember-vm.

use thiserror::Error;

/// Result type alias for ember-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Coarse classification of a [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input, missing files, or a rejected configuration call.
    Config,
    /// The hypervisor process died or could not be launched.
    Process,
    /// The control socket could not be reached.
    Api,
    /// Tap, NAT or port-forward failure.
    Network,
    /// Anything else (I/O, serialization).
    Other,
}

/// Errors that can occur while driving a Firecracker process or the host network.
#[derive(Debug, Error)]
pub enum VmError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Hypervisor process error
    #[error("process error: {0}")]
    Process(String),

    /// Control-plane error (socket unreachable, transport failure)
    #[error("API error: {0}")]
    Api(String),

    /// Host network error
    #[error("network error: {0}")]
    Network(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Config(_) => ErrorKind::Config,
            VmError::Process(_) => ErrorKind::Process,
            VmError::Api(_) => ErrorKind::Api,
            VmError::Network(_) => ErrorKind::Network,
            VmError::Io(_) | VmError::Json(_) => ErrorKind::Other,
        }
    }
}
