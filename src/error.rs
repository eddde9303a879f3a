//! Error types for the MPI operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for MPIJob specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Reconciliation error for a child resource
    #[error("reconcile error: {0}")]
    Reconcile(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Startup or server configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a reconcile error with the given message
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
