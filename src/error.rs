//! Error types for the jsonnet-controller
//!
//! Every failure a reconciliation can surface maps onto one of the condition
//! reasons recorded on the Konfiguration's `Ready` condition. Variants carry
//! the context needed to produce a useful status message.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Referenced source missing, not ready, or its artifact could not be
    /// downloaded or unpacked
    #[error("artifact error for {konfiguration}: {message}")]
    Artifact {
        /// Namespace/name of the Konfiguration
        konfiguration: String,
        /// Description of what failed
        message: String,
    },

    /// Temp directory or file write failure while preparing a source
    #[error("storage error for {konfiguration}: {message}")]
    Storage {
        /// Namespace/name of the Konfiguration
        konfiguration: String,
        /// Description of what failed
        message: String,
    },

    /// Jsonnet evaluation, object walk, or stream marshalling failure
    #[error("build error: {message}")]
    Build {
        /// Description of what failed
        message: String,
    },

    /// Dry-run apply rejected by the API server
    #[error("validation error for {object}: {message}")]
    Validation {
        /// The `Kind/namespace/name` identifier of the rejected object
        object: String,
        /// Description of what the API server rejected
        message: String,
    },

    /// One or more dependsOn entries not ready
    #[error("dependency '{dependency}' is not ready{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    DependencyNotReady {
        /// Namespace/name of the dependency
        dependency: String,
        /// Optional detail on why the dependency is not ready
        reason: Option<String>,
    },

    /// One or more declared resources did not reach Current within the timeout
    #[error("health check failed: {message}")]
    HealthCheck {
        /// Description enumerating the unhealthy identifiers
        message: String,
    },

    /// One or more orphaned objects could not be deleted
    #[error("pruning failed: {message}")]
    Prune {
        /// The accumulated change set of the failed prune
        message: String,
    },

    /// Apply path surfaced a non-classifiable error
    #[error("reconciliation failed: {message}")]
    Reconciliation {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error (server startup, serialization, bad state)
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "importer", "server")
        context: String,
    },
}

/// Default context value when no specific context is available
const UNKNOWN_CONTEXT: &str = "unknown";

impl Error {
    /// Create an artifact error for the given Konfiguration
    pub fn artifact(konfiguration: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Artifact {
            konfiguration: konfiguration.into(),
            message: msg.into(),
        }
    }

    /// Create a storage error for the given Konfiguration
    pub fn storage(konfiguration: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            konfiguration: konfiguration.into(),
            message: msg.into(),
        }
    }

    /// Create a build error with the given message
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build {
            message: msg.into(),
        }
    }

    /// Create a validation error for the given object identifier
    pub fn validation(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency-not-ready error for the given dependency
    pub fn dependency_not_ready(dependency: impl Into<String>) -> Self {
        Self::DependencyNotReady {
            dependency: dependency.into(),
            reason: None,
        }
    }

    /// Create a dependency-not-ready error with a detail message
    pub fn dependency_not_ready_because(
        dependency: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyNotReady {
            dependency: dependency.into(),
            reason: Some(reason.into()),
        }
    }

    /// Create a health check error with the given message
    pub fn health_check(msg: impl Into<String>) -> Self {
        Self::HealthCheck {
            message: msg.into(),
        }
    }

    /// Create a prune error with the given message
    pub fn prune(msg: impl Into<String>) -> Self {
        Self::Prune {
            message: msg.into(),
        }
    }

    /// Create a reconciliation error with the given message
    pub fn reconciliation(msg: impl Into<String>) -> Self {
        Self::Reconciliation {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The condition reason recorded on the Ready condition for this error
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Artifact { .. } => reasons::ARTIFACT_FAILED,
            Error::Storage { .. } => reasons::STORAGE_OPERATION_FAILED,
            Error::Build { .. } => reasons::BUILD_FAILED,
            Error::Validation { .. } => reasons::VALIDATION_FAILED,
            Error::DependencyNotReady { .. } => reasons::DEPENDENCY_NOT_READY,
            Error::HealthCheck { .. } => reasons::HEALTH_CHECK_FAILED,
            Error::Prune { .. } => reasons::PRUNE_FAILED,
            Error::Reconciliation { .. } | Error::Kube { .. } | Error::Internal { .. } => {
                reasons::RECONCILIATION_FAILED
            }
        }
    }

    /// Check if this error is recoverable through a requeue
    ///
    /// Everything the reconciler surfaces is recoverable; only programmer
    /// errors (corrupt in-memory state) are fatal, and those panic instead of
    /// reaching this type.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Don't retry client-side misuse of the API (4xx other than conflicts)
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            _ => true,
        }
    }
}

/// Condition reason strings recorded on the Konfiguration's conditions.
///
/// These appear in `kubectl get konfigs` under the STATUS column.
pub mod reasons {
    /// Reconciliation completed and the revision was applied
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    /// Apply path surfaced a non-classifiable error
    pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
    /// A reconciliation cycle is in progress
    pub const PROGRESSING: &str = "Progressing";
    /// The referenced source or its artifact failed
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
    /// A temp directory or file write failed
    pub const STORAGE_OPERATION_FAILED: &str = "StorageOperationFailed";
    /// The Jsonnet build failed
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// The dry-run apply was rejected by the API server
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// One or more dependsOn entries are not ready
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    /// One or more declared resources did not become Current in time
    pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";
    /// One or more orphans could not be deleted
    pub const PRUNE_FAILED: &str = "PruneFailed";
    /// The Konfiguration is suspended
    pub const SUSPENDED: &str = "Suspended";
}
