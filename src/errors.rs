//! Autoscaler error taxonomy
//!
//! Errors are classified by origin. Cloud provider failures abort the current
//! iteration, API call failures abort the affected operation, internal errors
//! flag broken invariants and transient errors are timeouts that the next
//! iteration naturally retries.

use thiserror::Error;

use crate::cloudprovider::CloudProviderError;
use crate::kube::ApiError;

/// Errors surfaced by the autoscaling core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutoscalerError {
    /// A node group operation failed at the cloud provider
    #[error("cloud provider error: {0}")]
    CloudProvider(String),

    /// A call to the cluster API failed
    #[error("api call error: {0}")]
    ApiCall(String),

    /// An invariant was violated
    #[error("internal error: {0}")]
    Internal(String),

    /// A wait timed out; the operation is retried next iteration
    #[error("transient error: {0}")]
    Transient(String),
}

impl AutoscalerError {
    /// Short name of the error class, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CloudProvider(_) => "cloudProviderError",
            Self::ApiCall(_) => "apiCallError",
            Self::Internal(_) => "internalError",
            Self::Transient(_) => "transientError",
        }
    }

    /// Prepend context to the message, keeping the error class
    pub fn add_prefix(self, prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        match self {
            Self::CloudProvider(msg) => Self::CloudProvider(format!("{}{}", prefix, msg)),
            Self::ApiCall(msg) => Self::ApiCall(format!("{}{}", prefix, msg)),
            Self::Internal(msg) => Self::Internal(format!("{}{}", prefix, msg)),
            Self::Transient(msg) => Self::Transient(format!("{}{}", prefix, msg)),
        }
    }
}

impl From<CloudProviderError> for AutoscalerError {
    fn from(err: CloudProviderError) -> Self {
        Self::CloudProvider(err.to_string())
    }
}

impl From<ApiError> for AutoscalerError {
    fn from(err: ApiError) -> Self {
        Self::ApiCall(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutoscalerError>;
