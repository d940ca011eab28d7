//! Error types for the registries operator
//!
//! Errors carry the registry name and the object that was being handled so a
//! failed reconciliation can be traced back from the log line alone.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for registry certificate operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A job with the same name is still present (usually a concurrent or
    /// not-yet-garbage-collected run). Retried on the next pass.
    #[error("job {namespace}/{name} already exists")]
    JobAlreadyExists {
        /// Job name
        name: String,
        /// Job namespace
        namespace: String,
    },

    /// The Secret referenced by `spec.certificate` does not exist
    #[error("certificate secret {namespace}/{name} for registry {registry} not found")]
    CertificateNotFound {
        /// Registry referencing the secret
        registry: String,
        /// Secret name
        name: String,
        /// Secret namespace
        namespace: String,
    },

    /// Invalid Registry spec or certificate payload
    #[error("validation error for {registry}: {message}")]
    Validation {
        /// Registry with invalid configuration
        registry: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a job-already-exists error
    pub fn job_already_exists(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::JobAlreadyExists {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a certificate-not-found error
    pub fn certificate_not_found(
        registry: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::CertificateNotFound {
            registry: registry.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            registry: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with registry context
    pub fn validation_for(registry: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            registry: registry.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when a job creation collided with an existing job
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::JobAlreadyExists { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation errors need a spec change. A missing certificate secret
    /// may show up later, so it is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::JobAlreadyExists { .. } => true,
            Error::CertificateNotFound { .. } => true,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
