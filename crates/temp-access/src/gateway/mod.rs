//! Cluster client gateway.
//!
//! The provisioner only talks to the cluster through [`ClusterGateway`].
//! [`KubeGateway`] speaks the Kubernetes REST API; [`MemoryGateway`] keeps
//! objects in process and simulates the deletion job with a manual clock.

mod kube;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use kube::{manifests, Kubeconfig, KubeGateway, ResolvedContext};
pub use memory::{GatewayCall, MemoryGateway, Operation, TokenRecord, UnitState};

use crate::cleanup::ScheduledUnitSpec;
use crate::error::GatewayResult;
use crate::permissions::PolicyRule;

/// Server-assigned unique id of a created object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectUid(pub String);

impl fmt::Display for ObjectUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of object a grant is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A `ServiceAccount`.
    Identity,
    /// A `ClusterRole`.
    PermissionSet,
    /// A `ClusterRoleBinding`.
    Binding,
    /// A `batch/v1` `Job`.
    ScheduledUnit,
}

impl ObjectKind {
    /// The Kubernetes `kind` field.
    #[must_use]
    pub fn kube_kind(self) -> &'static str {
        match self {
            ObjectKind::Identity => "ServiceAccount",
            ObjectKind::PermissionSet => "ClusterRole",
            ObjectKind::Binding => "ClusterRoleBinding",
            ObjectKind::ScheduledUnit => "Job",
        }
    }

    /// The `apiVersion` the kind is served under.
    #[must_use]
    pub fn api_version(self) -> &'static str {
        match self {
            ObjectKind::Identity => "v1",
            ObjectKind::PermissionSet | ObjectKind::Binding => "rbac.authorization.k8s.io/v1",
            ObjectKind::ScheduledUnit => "batch/v1",
        }
    }

    /// Resource name as used by `kubectl` and in RBAC rules.
    #[must_use]
    pub fn resource(self) -> &'static str {
        match self {
            ObjectKind::Identity => "serviceaccounts",
            ObjectKind::PermissionSet => "clusterroles",
            ObjectKind::Binding => "clusterrolebindings",
            ObjectKind::ScheduledUnit => "jobs",
        }
    }

    /// API group of the resource ("" for core).
    #[must_use]
    pub fn api_group(self) -> &'static str {
        match self {
            ObjectKind::Identity => "",
            ObjectKind::PermissionSet | ObjectKind::Binding => "rbac.authorization.k8s.io",
            ObjectKind::ScheduledUnit => "batch",
        }
    }

    /// Whether objects of this kind live inside a namespace.
    #[must_use]
    pub fn is_namespaced(self) -> bool {
        matches!(self, ObjectKind::Identity | ObjectKind::ScheduledUnit)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kube_kind())
    }
}

/// A reference to one cluster object by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object name.
    pub name: String,
    /// Namespace for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ObjectRef {
    /// A service account in `scope`.
    #[must_use]
    pub fn identity(scope: &str, name: &str) -> Self {
        Self {
            kind: ObjectKind::Identity,
            name: name.to_string(),
            scope: Some(scope.to_string()),
        }
    }

    /// A cluster role.
    #[must_use]
    pub fn permission_set(name: &str) -> Self {
        Self {
            kind: ObjectKind::PermissionSet,
            name: name.to_string(),
            scope: None,
        }
    }

    /// A cluster role binding.
    #[must_use]
    pub fn binding(name: &str) -> Self {
        Self {
            kind: ObjectKind::Binding,
            name: name.to_string(),
            scope: None,
        }
    }

    /// A job in `scope`.
    #[must_use]
    pub fn scheduled_unit(scope: &str, name: &str) -> Self {
        Self {
            kind: ObjectKind::ScheduledUnit,
            name: name.to_string(),
            scope: Some(scope.to_string()),
        }
    }
}

/// The delete call an [`ObjectRef`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deletion<'a> {
    Identity { scope: &'a str, name: &'a str },
    Binding(&'a str),
    PermissionSet(&'a str),
}

impl ObjectRef {
    /// Resolves the delete call for this object; jobs and unscoped service accounts have none.
    pub(crate) fn deletion(&self) -> GatewayResult<Deletion<'_>> {
        match (self.kind, self.scope.as_deref()) {
            (ObjectKind::Identity, Some(scope)) => Ok(Deletion::Identity {
                scope,
                name: &self.name,
            }),
            (ObjectKind::Binding, _) => Ok(Deletion::Binding(&self.name)),
            (ObjectKind::PermissionSet, _) => Ok(Deletion::PermissionSet(&self.name)),
            (kind, _) => Err(crate::GatewayError::Api {
                status: 405,
                reason: "MethodNotAllowed".to_string(),
                message: format!("deleting {kind} {} is not supported", self.name),
            }),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resource = self.kind.kube_kind().to_ascii_lowercase();
        match &self.scope {
            Some(scope) => write!(f, "{resource} {scope}/{}", self.name),
            None => write!(f, "{resource} {}", self.name),
        }
    }
}

/// Owner of an object; the cluster garbage-collects dependents once the owner is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Kind of the owner.
    pub kind: ObjectKind,
    /// Name of the owner.
    pub name: String,
    /// Uid of the owner as returned on creation.
    pub uid: ObjectUid,
}

/// A service account to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Service account name.
    pub name: String,
    /// Namespace.
    pub scope: String,
    /// Grant suffix, recorded as a label.
    pub grant: String,
    /// Optional owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
}

impl Identity {
    /// Creates an unowned service account description.
    #[must_use]
    pub fn new(scope: &str, name: &str, grant: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: scope.to_string(),
            grant: grant.to_string(),
            owner: None,
        }
    }

    /// Attaches an owner reference.
    #[must_use]
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// A cluster role to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Cluster role name.
    pub name: String,
    /// Grant suffix, recorded as a label.
    pub grant: String,
    /// Allow-rules.
    pub rules: Vec<PolicyRule>,
}

impl PermissionSet {
    /// Creates a cluster role description.
    #[must_use]
    pub fn new(name: &str, grant: &str, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.to_string(),
            grant: grant.to_string(),
            rules,
        }
    }
}

/// A cluster role binding to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Binding name.
    pub name: String,
    /// Bound service account.
    pub identity: String,
    /// Namespace of the bound service account.
    pub scope: String,
    /// Referenced cluster role.
    pub permission_set: String,
    /// Grant suffix, recorded as a label.
    pub grant: String,
    /// Optional owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
}

impl Binding {
    /// Creates an unowned binding description.
    #[must_use]
    pub fn new(name: &str, identity: &str, scope: &str, permission_set: &str, grant: &str) -> Self {
        Self {
            name: name.to_string(),
            identity: identity.to_string(),
            scope: scope.to_string(),
            permission_set: permission_set.to_string(),
            grant: grant.to_string(),
            owner: None,
        }
    }

    /// Attaches an owner reference.
    #[must_use]
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Typed access to the cluster control plane.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Short name of the backend, used in logs.
    fn name(&self) -> &str;

    /// Creates a service account.
    async fn create_identity(&self, identity: &Identity) -> GatewayResult<ObjectUid>;

    /// Creates a cluster role.
    async fn create_permission_set(&self, set: &PermissionSet) -> GatewayResult<ObjectUid>;

    /// Creates a cluster role binding.
    async fn create_binding(&self, binding: &Binding) -> GatewayResult<ObjectUid>;

    /// Requests a bound token for `identity` valid for `expiration_seconds`.
    async fn issue_token(
        &self,
        scope: &str,
        identity: &str,
        expiration_seconds: i64,
    ) -> GatewayResult<String>;

    /// Submits the deletion job.
    async fn create_scheduled_unit(&self, unit: &ScheduledUnitSpec) -> GatewayResult<ObjectUid>;

    /// Deletes a service account.
    async fn delete_identity(&self, scope: &str, name: &str) -> GatewayResult<()>;

    /// Deletes a cluster role binding.
    async fn delete_binding(&self, name: &str) -> GatewayResult<()>;

    /// Deletes a cluster role.
    async fn delete_permission_set(&self, name: &str) -> GatewayResult<()>;

    /// Deletes the referenced object, dispatching on its kind.
    async fn delete_object(&self, object: &ObjectRef) -> GatewayResult<()> {
        match object.deletion()? {
            Deletion::Identity { scope, name } => self.delete_identity(scope, name).await,
            Deletion::Binding(name) => self.delete_binding(name).await,
            Deletion::PermissionSet(name) => self.delete_permission_set(name).await,
        }
    }
}
