//! Plugin control-plane error types.

use std::time::Duration;

use thiserror::Error;

use super::PluginUniqueIdentifier;
use crate::cluster::ClusterError;
use crate::media::CacheError;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or oversized input. Never retried.
    Validation,
    /// Another operation owns the plugin. Attach or retry later.
    Conflict,
    /// Execution backend failure. Retryable with backoff.
    Backend,
    /// Cluster view needs a resync. Logged and self-healing.
    Consistency,
    /// Asset cache rejected an item.
    Cache,
    /// Local I/O, serialization or configuration problems.
    Internal,
}

/// Failures reported by runtime backends while provisioning.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The worker process could not be started.
    #[error("Failed to spawn plugin process: {0}")]
    SpawnFailed(String),

    /// The serverless platform could not be reached.
    #[error("Execution platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// The serverless platform refused to host more functions.
    #[error("Execution platform quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The deployment did not finish in time.
    #[error("Function deployment timed out after {}s", .0.as_secs())]
    DeployTimeout(Duration),
}

/// Errors that can occur during plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Package exceeds the configured maximum size.
    #[error("Plugin package is {size} bytes, exceeding the maximum of {max} bytes")]
    PackageTooLarge { size: u64, max: u64 },

    /// Package could not be decoded or failed validation.
    #[error("Invalid plugin package: {0}")]
    InvalidPackage(String),

    /// Identifier string is not in canonical form.
    #[error("Invalid plugin identifier '{raw}': {reason}")]
    InvalidIdentifier { raw: String, reason: String },

    /// An entry for the identifier already exists on this node.
    #[error("Plugin '{0}' is already registered")]
    DuplicateIdentity(PluginUniqueIdentifier),

    /// No local or cluster knowledge of the plugin.
    #[error("Plugin '{0}' not found")]
    NotFound(PluginUniqueIdentifier),

    /// Backend provisioning failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Coordination store or lock failure.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Asset cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invocation transport failure.
    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PackageTooLarge { .. }
            | Self::InvalidPackage(_)
            | Self::InvalidIdentifier { .. }
            | Self::NotFound(_) => ErrorCategory::Validation,
            Self::DuplicateIdentity(_) => ErrorCategory::Conflict,
            Self::Backend(_) | Self::Invocation(_) => ErrorCategory::Backend,
            Self::Cluster(err) => match err {
                ClusterError::LockHeld(_) => ErrorCategory::Conflict,
                ClusterError::Disconnected => ErrorCategory::Consistency,
                _ => ErrorCategory::Backend,
            },
            Self::Cache(_) => ErrorCategory::Cache,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Backend | ErrorCategory::Conflict)
    }

    /// Whether another operation is already working on this plugin.
    pub fn is_conflict(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let too_large = PluginError::PackageTooLarge { size: 10, max: 5 };
        assert_eq!(too_large.category(), ErrorCategory::Validation);
        assert!(!too_large.is_retryable());

        let held = PluginError::from(ClusterError::LockHeld("x".into()));
        assert!(held.is_conflict());
        assert!(held.is_retryable());

        let spawn = PluginError::from(BackendError::SpawnFailed("no such file".into()));
        assert_eq!(spawn.category(), ErrorCategory::Backend);

        let cache = PluginError::from(CacheError::AssetTooLarge { size: 10, capacity: 1 });
        assert_eq!(cache.category(), ErrorCategory::Cache);

        let lost = PluginError::from(ClusterError::Disconnected);
        assert_eq!(lost.category(), ErrorCategory::Consistency);
    }

    #[test]
    fn test_error_messages() {
        let err = PluginError::PackageTooLarge { size: 10_485_760, max: 5_242_880 };
        assert_eq!(
            err.to_string(),
            "Plugin package is 10485760 bytes, exceeding the maximum of 5242880 bytes"
        );

        let err = BackendError::DeployTimeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "Function deployment timed out after 300s");
    }
}
