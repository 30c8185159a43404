//! Error types for Flotilla

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for Flotilla operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown worker type: {0}")]
    UnknownWorkerType(String),

    #[error("Worker type {worker_type} does not allow region {region}")]
    UnknownRegion {
        worker_type: String,
        region: String,
    },

    #[error("Worker type {worker_type} does not define instance type {instance_type}")]
    UnknownInstanceType {
        worker_type: String,
        instance_type: String,
    },

    #[error("Malformed launch spec: {0}")]
    MalformedLaunchSpec(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Pricing error: {0}")]
    Pricing(String),
}

impl CoreError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a pricing error
    pub fn pricing(msg: impl Into<String>) -> Self {
        Self::Pricing(msg.into())
    }
}
