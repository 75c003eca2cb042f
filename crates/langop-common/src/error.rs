//! Error types for the langop operator
//!
//! Errors carry enough structure for the reconciler to decide between three
//! outcomes: retry through the controller backoff (transient cluster errors),
//! surface a `Failed` phase with a condition reason (configuration errors),
//! or stop quietly (handled at call sites by returning `Option`).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for langop operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// User-facing configuration error (malformed rule, missing secret, ...)
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// Name of the resource with the invalid configuration
        resource: String,
        /// CamelCase reason recorded on the resource's conditions
        reason: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An operation exceeded its deadline
    #[error("timed out after {seconds}s: {operation}")]
    Timeout {
        /// Operation that was cut off (e.g., "dns lookup api.openai.com")
        operation: String,
        /// Deadline in seconds
        seconds: u64,
    },

    /// Code synthesis collaborator failed
    #[error("synthesis error: {message}")]
    Synthesis {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "sync")
        context: String,
    },
}

impl Error {
    /// Create a configuration error with a condition reason
    pub fn configuration(reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: UNKNOWN_CONTEXT.to_string(),
            reason: reason.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error scoped to a named resource
    pub fn configuration_for(
        resource: impl Into<String>,
        reason: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            resource: resource.into(),
            reason: reason.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a synthesis error
    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis {
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

    /// Check if this error is retryable
    ///
    /// Transient cluster errors (server errors, conflicts, throttling,
    /// transport failures) and timeouts are retried with backoff.
    /// Configuration and serialization errors need a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Synthesis { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Condition reason describing this error
    pub fn reason(&self) -> &str {
        match self {
            Error::Kube { .. } => "KubernetesApiError",
            Error::Configuration { reason, .. } => reason,
            Error::Serialization { .. } => "SerializationError",
            Error::Timeout { .. } => "Timeout",
            Error::Synthesis { .. } => "SynthesisFailed",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
