//! Error types for temporary access provisioning.

use std::fmt;

use thiserror::Error;

use crate::gateway::{ObjectKind, ObjectRef};

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, AccessError>;

/// Result type for cluster gateway calls.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors raised by a [`ClusterGateway`](crate::ClusterGateway) implementation.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level failure talking to the API server (boxed to keep enum small).
    #[error("HTTP error: {0}")]
    Http(#[source] Box<reqwest::Error>),

    /// The API server rejected the request.
    #[error("API server returned {status} ({reason}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Machine-readable reason from the `Status` object.
        reason: String,
        /// Human-readable message from the `Status` object.
        message: String,
    },

    /// The addressed object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of the missing object.
        kind: ObjectKind,
        /// Name of the missing object.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// Kind of the conflicting object.
        kind: ObjectKind,
        /// Name of the conflicting object.
        name: String,
    },

    /// The caller's credentials do not allow the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The kubeconfig could not be read or resolved.
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    /// A request body could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The API server answered with a body we could not interpret.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Failure injected into the in-memory gateway.
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl GatewayError {
    /// Returns true if the error means the object is already gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Http(Box::new(err))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

/// The provisioning step an [`AccessError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    /// Parsing the requested time-to-live.
    ParseDuration,
    /// Creating the service account.
    CreateIdentity,
    /// Creating the custom cluster role.
    CreatePermissionSet,
    /// Creating the cluster role binding.
    CreateBinding,
    /// Requesting the bound token.
    IssueToken,
    /// Creating the janitor objects and the deletion job.
    ScheduleCleanup,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisionStep::ParseDuration => "parse-duration",
            ProvisionStep::CreateIdentity => "create-service-account",
            ProvisionStep::CreatePermissionSet => "create-cluster-role",
            ProvisionStep::CreateBinding => "create-cluster-role-binding",
            ProvisionStep::IssueToken => "issue-token",
            ProvisionStep::ScheduleCleanup => "schedule-cleanup",
        };
        f.write_str(name)
    }
}

/// Errors returned to the caller of [`CredentialProvisioner`](crate::CredentialProvisioner).
#[derive(Error, Debug)]
pub enum AccessError {
    /// The expiration literal could not be used as a time-to-live.
    #[error("invalid expiration duration {input:?}: {reason}")]
    InvalidDuration {
        /// The literal as supplied.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Step 3 failed; nothing was created.
    #[error("creating service account {identity} in namespace {scope}")]
    IdentityCreationFailed {
        /// Tenant scope of the grant.
        scope: String,
        /// Service account name.
        identity: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// Step 4 failed.
    #[error("creating custom cluster role {permission_set} for namespace {scope}")]
    PermissionSetCreationFailed {
        /// Tenant scope of the grant.
        scope: String,
        /// Cluster role name.
        permission_set: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// Step 5 failed.
    #[error("creating cluster role binding {binding} for namespace {scope}")]
    BindingCreationFailed {
        /// Tenant scope of the grant.
        scope: String,
        /// Binding name.
        binding: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// Step 6 failed.
    #[error("getting token for service account {identity} in namespace {scope}")]
    TokenIssuanceFailed {
        /// Tenant scope of the grant.
        scope: String,
        /// Service account name.
        identity: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// Step 7 failed; the grant would never have expired on schedule.
    #[error("creating deletion job {unit} in namespace {scope}")]
    CleanupSchedulingFailed {
        /// Tenant scope of the grant.
        scope: String,
        /// Deletion job name.
        unit: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },

    /// A step failed and some of the grant's objects could not be removed.
    #[error("grant in namespace {scope} failed; objects left in the cluster: {}", join_refs(.leaked))]
    PartialGrantLeaked {
        /// Tenant scope of the grant.
        scope: String,
        /// Objects that still exist and will never expire on their own.
        leaked: Vec<ObjectRef>,
        /// The step failure that triggered the leak.
        #[source]
        source: Box<AccessError>,
    },
}

impl AccessError {
    /// The provisioning step that failed.
    #[must_use]
    pub fn step(&self) -> ProvisionStep {
        match self {
            AccessError::InvalidDuration { .. } => ProvisionStep::ParseDuration,
            AccessError::IdentityCreationFailed { .. } => ProvisionStep::CreateIdentity,
            AccessError::PermissionSetCreationFailed { .. } => ProvisionStep::CreatePermissionSet,
            AccessError::BindingCreationFailed { .. } => ProvisionStep::CreateBinding,
            AccessError::TokenIssuanceFailed { .. } => ProvisionStep::IssueToken,
            AccessError::CleanupSchedulingFailed { .. } => ProvisionStep::ScheduleCleanup,
            AccessError::PartialGrantLeaked { source, .. } => source.step(),
        }
    }

    /// The tenant scope the failure belongs to, if one was reached.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        match self {
            AccessError::InvalidDuration { .. } => None,
            AccessError::IdentityCreationFailed { scope, .. }
            | AccessError::PermissionSetCreationFailed { scope, .. }
            | AccessError::BindingCreationFailed { scope, .. }
            | AccessError::TokenIssuanceFailed { scope, .. }
            | AccessError::CleanupSchedulingFailed { scope, .. }
            | AccessError::PartialGrantLeaked { scope, .. } => Some(scope),
        }
    }

    /// Objects known to be left behind by this failure.
    #[must_use]
    pub fn leaked(&self) -> &[ObjectRef] {
        match self {
            AccessError::PartialGrantLeaked { leaked, .. } => leaked,
            _ => &[],
        }
    }
}

fn join_refs(refs: &[ObjectRef]) -> String {
    refs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while loading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file contents or overrides did not match the expected shape.
    #[error("Parse error in {path}: {reason}")]
    Parse {
        /// Path (or `<env>`) that failed.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// The file extension is not one of toml, yaml, yml or json.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_display() {
        let err = AccessError::IdentityCreationFailed {
            scope: "team-a".to_string(),
            identity: "temp-sa-123".to_string(),
            source: GatewayError::Forbidden("no".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("team-a"));
        assert!(msg.contains("temp-sa-123"));
        assert!(!msg.contains("Forbidden"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Forbidden: no");
        assert_eq!(err.step(), ProvisionStep::CreateIdentity);
        assert_eq!(err.scope(), Some("team-a"));
    }

    #[test]
    fn test_invalid_duration_has_no_scope() {
        let err = AccessError::InvalidDuration {
            input: "soon".to_string(),
            reason: "missing unit".to_string(),
        };
        assert!(err.scope().is_none());
        assert_eq!(err.step(), ProvisionStep::ParseDuration);
        assert!(err.to_string().contains("\"soon\""));
    }

    #[test]
    fn test_partial_leak_reports_inner_step() {
        let inner = AccessError::BindingCreationFailed {
            scope: "default".to_string(),
            binding: "temp-binding-1".to_string(),
            source: GatewayError::Injected("boom".to_string()),
        };
        let err = AccessError::PartialGrantLeaked {
            scope: "default".to_string(),
            leaked: vec![ObjectRef::identity("default", "temp-sa-1")],
            source: Box::new(inner),
        };
        assert_eq!(err.step(), ProvisionStep::CreateBinding);
        assert_eq!(err.leaked().len(), 1);
        let msg = err.to_string();
        assert!(msg.contains("serviceaccount default/temp-sa-1"));
        assert!(!msg.contains("temp-binding-1"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("temp-binding-1"));
    }

    #[test]
    fn test_not_found_helper() {
        let err = GatewayError::NotFound {
            kind: ObjectKind::Binding,
            name: "x".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!GatewayError::Forbidden("x".to_string()).is_not_found());
    }
}
