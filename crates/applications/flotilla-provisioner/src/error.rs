//! Error types for the provisioner
//!
//! The reconciler is self-healing by repetition, so the error surface is
//! mostly about deciding what a failure means for the current iteration:
//! transient cloud errors skip the iteration and the next tick retries
//! from scratch, permission errors abort it loudly, and everything else
//! is reported per-item.

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use std::time::Duration;
use thiserror::Error;

/// Provisioner result type
pub type Result<T> = std::result::Result<T, ProvisionerError>;

/// Errors that can occur in the provisioner
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// Cloud API rejected the call for throttling or server-side reasons
    #[error("Cloud API throttled: {0}")]
    Throttled(String),

    /// Network-level failure reaching the cloud API
    #[error("Network error: {0}")]
    Network(String),

    /// A cloud API call exceeded its per-call deadline
    #[error("Cloud API call timed out after {0:?}")]
    ApiTimeout(Duration),

    /// Credentials are missing or not allowed to perform the call
    #[error("Permission error: {0}")]
    Permission(String),

    /// Non-retryable cloud API error
    #[error("Cloud error: {0}")]
    Cloud(String),

    /// Error from a core collaborator (store, queue, pricing)
    #[error(transparent)]
    Core(#[from] flotilla_core::CoreError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProvisionerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a non-retryable cloud error
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// True when the next tick should simply retry from scratch
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::Network(_) | Self::ApiTimeout(_)
        )
    }

    /// Classify an AWS SDK error into the provisioner taxonomy
    pub fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                Self::Network(err.to_string())
            }
            SdkError::ServiceError(ctx) => {
                let code = ctx.err().code().unwrap_or("Unknown");
                let message = ctx.err().message().unwrap_or("").to_string();
                match code {
                    "RequestLimitExceeded"
                    | "Throttling"
                    | "ThrottlingException"
                    | "ServiceUnavailable"
                    | "InternalError"
                    | "InsufficientAddressCapacity"
                    | "Unavailable" => Self::Throttled(format!("{code}: {message}")),
                    "AuthFailure"
                    | "UnauthorizedOperation"
                    | "OptInRequired"
                    | "PendingVerification"
                    | "SignatureDoesNotMatch" => Self::Permission(format!("{code}: {message}")),
                    _ => Self::Cloud(format!("{code}: {message}")),
                }
            }
            _ => Self::Cloud(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProvisionerError::Throttled("RequestLimitExceeded".into()).is_transient());
        assert!(ProvisionerError::Network("connection reset".into()).is_transient());
        assert!(ProvisionerError::ApiTimeout(Duration::from_secs(30)).is_transient());

        assert!(!ProvisionerError::Permission("AuthFailure".into()).is_transient());
        assert!(!ProvisionerError::Cloud("InvalidParameterValue".into()).is_transient());
        assert!(!ProvisionerError::Config("missing key prefix".into()).is_transient());
    }
}
