//! JSON bodies for the Kubernetes API.
//!
//! Every object carries the `managed-by` label and the grant suffix so a
//! grant's leftovers can be found with a label selector.

use serde_json::{json, Value};

use crate::cleanup::{ScheduledUnitSpec, CLEANUP_CONTAINER_NAME};
use crate::gateway::{Binding, Identity, ObjectKind, OwnerReference, PermissionSet};
use crate::permissions::PolicyRule;

/// Value of `app.kubernetes.io/managed-by` on every object we create.
pub const MANAGED_BY: &str = "kube-temp-access";

/// Label holding the grant suffix.
pub const GRANT_LABEL: &str = "kube-temp-access/grant";

fn labels(grant: &str) -> Value {
    json!({
        "app.kubernetes.io/managed-by": MANAGED_BY,
        GRANT_LABEL: grant,
    })
}

fn owner_references(owner: Option<&OwnerReference>) -> Value {
    match owner {
        Some(owner) => json!([{
            "apiVersion": owner.kind.api_version(),
            "kind": owner.kind.kube_kind(),
            "name": owner.name,
            "uid": owner.uid.0,
        }]),
        None => json!([]),
    }
}

fn metadata(name: &str, scope: Option<&str>, grant: &str, owner: Option<&OwnerReference>) -> Value {
    let mut meta = json!({
        "name": name,
        "labels": labels(grant),
    });
    if let Some(scope) = scope {
        meta["namespace"] = json!(scope);
    }
    if owner.is_some() {
        meta["ownerReferences"] = owner_references(owner);
    }
    meta
}

/// `ServiceAccount` body.
#[must_use]
pub fn service_account(identity: &Identity) -> Value {
    json!({
        "apiVersion": ObjectKind::Identity.api_version(),
        "kind": ObjectKind::Identity.kube_kind(),
        "metadata": metadata(
            &identity.name,
            Some(&identity.scope),
            &identity.grant,
            identity.owner.as_ref(),
        ),
    })
}

fn policy_rule(rule: &PolicyRule) -> Value {
    let mut value = json!({
        "apiGroups": rule.api_groups,
        "resources": rule.resources,
        "verbs": rule.verbs,
    });
    if !rule.resource_names.is_empty() {
        value["resourceNames"] = json!(rule.resource_names);
    }
    value
}

/// `ClusterRole` body.
#[must_use]
pub fn cluster_role(set: &PermissionSet) -> Value {
    json!({
        "apiVersion": ObjectKind::PermissionSet.api_version(),
        "kind": ObjectKind::PermissionSet.kube_kind(),
        "metadata": metadata(&set.name, None, &set.grant, None),
        "rules": set.rules.iter().map(policy_rule).collect::<Vec<_>>(),
    })
}

/// `ClusterRoleBinding` body with one service account subject.
#[must_use]
pub fn cluster_role_binding(binding: &Binding) -> Value {
    json!({
        "apiVersion": ObjectKind::Binding.api_version(),
        "kind": ObjectKind::Binding.kube_kind(),
        "metadata": metadata(&binding.name, None, &binding.grant, binding.owner.as_ref()),
        "subjects": [{
            "kind": ObjectKind::Identity.kube_kind(),
            "name": binding.identity,
            "namespace": binding.scope,
        }],
        "roleRef": {
            "apiGroup": ObjectKind::PermissionSet.api_group(),
            "kind": ObjectKind::PermissionSet.kube_kind(),
            "name": binding.permission_set,
        },
    })
}

/// `authentication.k8s.io/v1` `TokenRequest` body.
#[must_use]
pub fn token_request(expiration_seconds: i64) -> Value {
    json!({
        "apiVersion": "authentication.k8s.io/v1",
        "kind": "TokenRequest",
        "spec": {
            "expirationSeconds": expiration_seconds,
        },
    })
}

/// `batch/v1` `Job` body running the cleanup script once.
#[must_use]
pub fn job(unit: &ScheduledUnitSpec) -> Value {
    json!({
        "apiVersion": ObjectKind::ScheduledUnit.api_version(),
        "kind": ObjectKind::ScheduledUnit.kube_kind(),
        "metadata": metadata(&unit.name, Some(&unit.scope), &unit.grant, None),
        "spec": {
            "ttlSecondsAfterFinished": unit.retention.num_seconds(),
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "labels": labels(&unit.grant),
                },
                "spec": {
                    "serviceAccountName": unit.runner,
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": CLEANUP_CONTAINER_NAME,
                        "image": unit.image,
                        "command": unit.command(),
                    }],
                },
            },
        },
    })
}
