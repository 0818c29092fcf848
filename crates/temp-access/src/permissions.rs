//! Permission resolution: built-in read-only role or a custom rule set.

use serde::{Deserialize, Serialize};

use crate::naming::GrantNames;

/// Marker resource that selects the cluster's built-in read-only role.
pub const BUILT_IN_READ_ONLY: &str = "view";

/// Verbs granted on every requested resource kind.
pub const READ_VERBS: [&str; 3] = ["get", "list", "watch"];

/// API groups custom rules are scoped to: core and apps.
pub const READ_API_GROUPS: [&str; 2] = ["", "apps"];

/// One allow-rule of a cluster role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    /// API groups this rule applies to ("" is the core group).
    pub api_groups: Vec<String>,
    /// Resource kinds (e.g. "pods", "deployments").
    pub resources: Vec<String>,
    /// Allowed verbs.
    pub verbs: Vec<String>,
    /// Restricts the rule to these object names; empty means all names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

impl PolicyRule {
    /// Read-only rule over the given resource kinds in the core and apps groups.
    #[must_use]
    pub fn read_only(resources: &[String]) -> Self {
        Self {
            api_groups: READ_API_GROUPS.iter().map(ToString::to_string).collect(),
            resources: resources.to_vec(),
            verbs: READ_VERBS.iter().map(ToString::to_string).collect(),
            resource_names: Vec::new(),
        }
    }

    /// Rule allowing `verbs` on exactly the named objects of one kind.
    #[must_use]
    pub fn named(api_group: &str, resource: &str, verbs: &[&str], names: Vec<String>) -> Self {
        Self {
            api_groups: vec![api_group.to_string()],
            resources: vec![resource.to_string()],
            verbs: verbs.iter().map(ToString::to_string).collect(),
            resource_names: names,
        }
    }

    /// Returns true if the rule allows `verb` on `resource` in `api_group` named `name`.
    #[must_use]
    pub fn allows(&self, verb: &str, api_group: &str, resource: &str, name: &str) -> bool {
        self.verbs.iter().any(|v| v == verb || v == "*")
            && self.api_groups.iter().any(|g| g == api_group || g == "*")
            && self.resources.iter().any(|r| r == resource || r == "*")
            && (self.resource_names.is_empty() || self.resource_names.iter().any(|n| n == name))
    }
}

/// Which permission set a grant's binding points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rules", rename_all = "snake_case")]
pub enum RoleChoice {
    /// The cluster's built-in read-only role.
    BuiltIn,
    /// A custom cluster role minted for this grant.
    Custom(Vec<PolicyRule>),
}

impl RoleChoice {
    /// Name of the role the binding must reference.
    #[must_use]
    pub fn role_name<'a>(&self, names: &'a GrantNames) -> &'a str {
        match self {
            RoleChoice::BuiltIn => BUILT_IN_READ_ONLY,
            RoleChoice::Custom(_) => &names.permission_set,
        }
    }

    /// Returns true if a custom cluster role has to be created.
    #[must_use]
    pub fn is_custom(&self) -> bool {
        matches!(self, RoleChoice::Custom(_))
    }
}

/// Decides the permission set for a requested resource list.
///
/// Only the exact singleton `["view"]` selects the built-in role. Anything
/// else, including an empty list, becomes one custom read-only rule over the
/// list as given; the API server is left to reject contents it dislikes.
#[must_use]
pub fn resolve(requested: &[String]) -> RoleChoice {
    match requested {
        [only] if only == BUILT_IN_READ_ONLY => RoleChoice::BuiltIn,
        _ => RoleChoice::Custom(vec![PolicyRule::read_only(requested)]),
    }
}
