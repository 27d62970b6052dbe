//! Error types shared by every keel crate
//!
//! Errors are structured with fields to aid debugging: each variant carries
//! the control-plane instance, provider or resource it concerns, and the
//! variants line up with the failure categories the provisioning sagas act on
//! (validation failures are reported immediately, infrastructure and
//! Kubernetes failures trigger rollback, and so on).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Bad flags or flag combinations
    #[error("validation error for {instance}: {message}")]
    Validation {
        /// Control-plane instance the flags were given for
        instance: String,
        /// Description of what's invalid
        message: String,
        /// The offending flag or field, if known
        field: Option<String>,
    },

    /// A control-plane instance with this name already exists
    #[error("control plane instance {instance} already exists")]
    AlreadyExists {
        /// Name of the colliding instance
        instance: String,
    },

    /// A persisted record or Kubernetes object does not exist
    #[error("{resource} {name} not found")]
    NotFound {
        /// What was looked up (e.g. "control plane instance", "Deployment")
        resource: String,
        /// Name that was looked up
        name: String,
    },

    /// Cloud or local runtime creation/deletion failed
    #[error("infrastructure error [{provider}] for {instance}: {message}")]
    InfraProvision {
        /// Control-plane instance being provisioned
        instance: String,
        /// Provider identifier (kind, eks)
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// A Kubernetes client could not be built or used
    #[error("kubernetes client error [{context}]: {message}")]
    KubeClient {
        /// Where the failure happened (e.g. "discovery", "install api-server")
        context: String,
        /// Description of what failed
        message: String,
        /// Whether the API server rejected our credentials
        auth_failure: bool,
    },

    /// A runtime has an endpoint but no usable credential shape
    #[error("runtime configuration error for {runtime}: {message}")]
    Config {
        /// Runtime instance name
        runtime: String,
        /// Description of the problem
        message: String,
    },

    /// The control-plane API rejected or failed a call
    #[error("control plane API error [{resource}]: {message}")]
    ApiRegistration {
        /// API resource being called (e.g. "kubernetes-runtime-instances")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Bearer token refresh failed
    #[error("token refresh failed [{provider}]: {message}")]
    AuthRefresh {
        /// Provider whose refresh path failed
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// No implementation exists for the requested provider
    #[error("unsupported provider: {provider}")]
    UnsupportedProvider {
        /// The provider identifier that was requested
        provider: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being processed (if known)
        kind: Option<String>,
    },

    /// Local file or process I/O error
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being read or written
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A termination signal was observed at a saga step boundary
    #[error("interrupted during {step}")]
    Interrupted {
        /// The step that observed the cancellation
        step: String,
    },

    /// Teardown refused because workloads still run on the control plane
    #[error(
        "refusing to delete {instance}: {count} workload instance(s) still exist, delete them first"
    )]
    WorkloadsPresent {
        /// Control-plane instance being deleted
        instance: String,
        /// Number of workload instances reported by the API
        count: usize,
    },

    /// A step failed and the compensating rollback failed too
    #[error(
        "{cause}; rollback also failed ({}), resources may be left behind",
        .failures.join("; ")
    )]
    RollbackFailed {
        /// The error that triggered the rollback
        #[source]
        cause: Box<Error>,
        /// Every secondary failure hit while cleaning up
        failures: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error without instance context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            instance: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the instance and offending flag
    pub fn validation_for_field(
        instance: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            instance: instance.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create an infrastructure error with full context
    pub fn infra(
        instance: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InfraProvision {
            instance: instance.into(),
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a Kubernetes client error
    pub fn kube_client(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::KubeClient {
            context: context.into(),
            message: msg.into(),
            auth_failure: false,
        }
    }

    /// Wrap a kube-rs error hit while building or using a client
    ///
    /// Keeps track of whether the API server refused our credentials so
    /// callers can decide to refresh them.
    pub fn from_kube(context: impl Into<String>, err: kube::Error) -> Self {
        let auth_failure = is_kube_auth_failure(&err);
        Self::KubeClient {
            context: context.into(),
            message: err.to_string(),
            auth_failure,
        }
    }

    /// Create a runtime configuration error
    pub fn config(runtime: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            runtime: runtime.into(),
            message: msg.into(),
        }
    }

    /// Create a control-plane API error
    pub fn api(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ApiRegistration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a token refresh error
    pub fn auth_refresh(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AuthRefresh {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported-provider error
    pub fn unsupported_provider(provider: impl Into<String>) -> Self {
        Self::UnsupportedProvider {
            provider: provider.into(),
        }
    }

    /// Create a serialization error
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

    /// Wrap an I/O error with what was being accessed
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an interruption error for the given step
    pub fn interrupted(step: impl Into<String>) -> Self {
        Self::Interrupted { step: step.into() }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Combine a step failure with the failures of its rollback
    ///
    /// Returns the original error untouched when the rollback was clean.
    pub fn with_rollback_failures(self, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            self
        } else {
            Self::RollbackFailed {
                cause: Box::new(self),
                failures,
            }
        }
    }

    /// Check if this error is retryable
    ///
    /// Flag problems, name collisions, refused teardowns and unknown providers
    /// need operator action; transport-level failures may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::NotFound { .. } => false,
            Error::InfraProvision { .. } => true,
            Error::KubeClient { .. } => true,
            Error::Config { .. } => false,
            Error::ApiRegistration { .. } => true,
            Error::AuthRefresh { .. } => false,
            Error::UnsupportedProvider { .. } => false,
            Error::Serialization { .. } => false,
            Error::Io { .. } => true,
            Error::Interrupted { .. } => false,
            Error::WorkloadsPresent { .. } => false,
            Error::RollbackFailed { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the Kubernetes API server rejected our credentials
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Kube { source } => is_kube_auth_failure(source),
            Error::KubeClient { auth_failure, .. } => *auth_failure,
            _ => false,
        }
    }

    /// Whether this is a Kubernetes "not found" response
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube { source } => matches!(source, kube::Error::Api(ae) if ae.code == 404),
            Error::NotFound { .. } => true,
            _ => false,
        }
    }
}

fn is_kube_auth_failure(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 401 || ae.code == 403,
        kube::Error::Auth(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} error", reason),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: a bad flag combination is reported before anything is created
    #[test]
    fn story_validation_names_the_flag() {
        let err = Error::validation_for_field(
            "prod",
            "auth-enabled",
            "eks requires authentication to be enabled",
        );
        assert!(err.to_string().contains("prod"));
        assert!(err.to_string().contains("requires authentication"));
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("auth-enabled")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: a rollback that also fails keeps both causes visible
    #[test]
    fn story_rollback_failure_reports_original_and_cleanup_errors() {
        let original = Error::infra("prod", "eks", "stack creation timed out");
        let combined = original.with_rollback_failures(vec![
            "delete infrastructure: stack in DELETE_FAILED".to_string(),
            "remove config record: permission denied".to_string(),
        ]);

        let message = combined.to_string();
        assert!(message.contains("stack creation timed out"));
        assert!(message.contains("DELETE_FAILED"));
        assert!(message.contains("permission denied"));
        assert!(message.contains("left behind"));
        assert!(!combined.is_retryable());

        match combined {
            Error::RollbackFailed { cause, failures } => {
                assert!(matches!(*cause, Error::InfraProvision { .. }));
                assert_eq!(failures.len(), 2);
            }
            _ => panic!("Expected RollbackFailed variant"),
        }
    }

    #[test]
    fn clean_rollback_returns_original_error() {
        let err = Error::api("kubernetes-runtime-instances", "500 Internal Server Error")
            .with_rollback_failures(Vec::new());
        assert!(matches!(err, Error::ApiRegistration { .. }));
    }

    #[test]
    fn auth_failures_are_recognised() {
        assert!(Error::from(api_error(401, "Unauthorized")).is_auth_failure());
        assert!(Error::from_kube("discovery", api_error(403, "Forbidden")).is_auth_failure());
        assert!(!Error::from_kube("discovery", api_error(500, "InternalError")).is_auth_failure());
        assert!(!Error::validation("nope").is_auth_failure());
    }

    #[test]
    fn kube_client_errors_are_retryable_but_4xx_api_errors_are_not() {
        assert!(Error::kube_client("install", "connection reset").is_retryable());
        assert!(!Error::from(api_error(422, "Invalid")).is_retryable());
        assert!(Error::from(api_error(503, "ServiceUnavailable")).is_retryable());
    }

    #[test]
    fn not_found_detection() {
        assert!(Error::from(api_error(404, "NotFound")).is_not_found());
        assert!(Error::not_found("control plane instance", "dev").is_not_found());
        assert!(!Error::from(api_error(409, "AlreadyExists")).is_not_found());
    }

    #[test]
    fn workloads_present_refusal_is_final() {
        let err = Error::WorkloadsPresent {
            instance: "prod".to_string(),
            count: 3,
        };
        assert!(err.to_string().contains("3 workload instance(s)"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unsupported_provider_message() {
        let err = Error::unsupported_provider("gke");
        assert_eq!(err.to_string(), "unsupported provider: gke");
        assert!(!err.is_retryable());
    }
}
