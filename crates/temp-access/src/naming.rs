//! Name allocation for grant objects.
//!
//! Every grant gets one random suffix; all of its cluster objects are named
//! `<prefix><suffix>` so that a listing of the cluster shows at a glance
//! which objects belong together and that they are temporary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of the grant's service account.
pub const IDENTITY_PREFIX: &str = "temp-sa-";
/// Prefix of the grant's custom cluster role.
pub const PERMISSION_SET_PREFIX: &str = "temp-role-";
/// Prefix of the grant's cluster role binding.
pub const BINDING_PREFIX: &str = "temp-binding-";
/// Prefix of the deletion job.
pub const SCHEDULED_UNIT_PREFIX: &str = "temp-deletion-job-";
/// Prefix of the service account the deletion job runs as.
pub const JANITOR_IDENTITY_PREFIX: &str = "temp-janitor-sa-";
/// Prefix of the cluster role granting the deletion job its deletes.
pub const JANITOR_PERMISSION_SET_PREFIX: &str = "temp-janitor-role-";
/// Prefix of the binding between the janitor service account and role.
pub const JANITOR_BINDING_PREFIX: &str = "temp-janitor-binding-";

/// Longest name a Job may carry (it is copied into a pod label).
pub const MAX_NAME_LEN: usize = 63;

/// All object names belonging to one grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantNames {
    /// The random suffix shared by every name.
    pub suffix: String,
    /// Service account name.
    pub identity: String,
    /// Custom cluster role name (only created for custom resource lists).
    pub permission_set: String,
    /// Cluster role binding name.
    pub binding: String,
    /// Deletion job name.
    pub scheduled_unit: String,
    /// Service account the deletion job runs as.
    pub janitor_identity: String,
    /// Cluster role holding the deletion job's permissions.
    pub janitor_permission_set: String,
    /// Binding between janitor service account and janitor role.
    pub janitor_binding: String,
}

impl GrantNames {
    /// Derives every name from a suffix.
    #[must_use]
    pub fn from_suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self {
            identity: format!("{IDENTITY_PREFIX}{suffix}"),
            permission_set: format!("{PERMISSION_SET_PREFIX}{suffix}"),
            binding: format!("{BINDING_PREFIX}{suffix}"),
            scheduled_unit: format!("{SCHEDULED_UNIT_PREFIX}{suffix}"),
            janitor_identity: format!("{JANITOR_IDENTITY_PREFIX}{suffix}"),
            janitor_permission_set: format!("{JANITOR_PERMISSION_SET_PREFIX}{suffix}"),
            janitor_binding: format!("{JANITOR_BINDING_PREFIX}{suffix}"),
            suffix,
        }
    }

    /// Recovers the grant names from the name of any object it produced.
    #[must_use]
    pub fn from_object_name(name: &str) -> Option<Self> {
        // Longest prefixes first: "temp-janitor-sa-" must not be read as "temp-sa-".
        let mut prefixes = [
            IDENTITY_PREFIX,
            PERMISSION_SET_PREFIX,
            BINDING_PREFIX,
            SCHEDULED_UNIT_PREFIX,
            JANITOR_IDENTITY_PREFIX,
            JANITOR_PERMISSION_SET_PREFIX,
            JANITOR_BINDING_PREFIX,
        ];
        prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));

        prefixes
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .filter(|suffix| !suffix.is_empty())
            .map(Self::from_suffix)
    }

    /// Every derived name, grant objects first.
    #[must_use]
    pub fn all(&self) -> [&str; 7] {
        [
            &self.identity,
            &self.permission_set,
            &self.binding,
            &self.scheduled_unit,
            &self.janitor_identity,
            &self.janitor_permission_set,
            &self.janitor_binding,
        ]
    }
}

/// Generates a fresh grant suffix.
#[must_use]
pub fn allocate_suffix() -> String {
    Uuid::new_v4().to_string()
}

/// Allocates names for a new grant.
#[must_use]
pub fn allocate() -> GrantNames {
    GrantNames::from_suffix(allocate_suffix())
}

/// Checks that `name` is a DNS-1123 label the API server will accept.
#[must_use]
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
