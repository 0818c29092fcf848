//! Self-cleanup unit: a job that waits out the grant's time-to-live and
//! then deletes the grant's objects.
//!
//! The unit is pure data. Everything it needs is captured by value when it
//! is built, so it keeps working after the provisioning process has exited.
//!
//! The job runs as a per-grant janitor service account whose cluster role
//! may only delete the grant's objects and the janitor role itself. The
//! janitor service account and binding are owned by the janitor role, so
//! deleting that role last lets the garbage collector remove them.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::gateway::{ObjectKind, ObjectRef, PermissionSet};
use crate::naming::GrantNames;
use crate::permissions::PolicyRule;

/// Image providing `sh` and `kubectl`.
pub const DEFAULT_CLEANUP_IMAGE: &str = "bitnami/kubectl:latest";

/// How long a finished job stays visible before the cluster removes it.
pub const DEFAULT_RETENTION_SECS: i64 = 30;

/// Name of the job's single container.
pub const CLEANUP_CONTAINER_NAME: &str = "deletion-container";

/// Verbs the janitor needs: `kubectl delete <kind> <name>` reads the object first.
const JANITOR_VERBS: [&str; 2] = ["get", "delete"];

/// Ordered list of independent, best-effort deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupAction {
    /// Objects to delete, in order.
    pub deletions: Vec<ObjectRef>,
}

impl CleanupAction {
    /// Renders the action as a shell script for the cleanup container.
    ///
    /// Commands are joined with `;` so one failed deletion never stops the rest.
    #[must_use]
    pub fn script(&self, delay: Duration) -> String {
        let mut commands = vec![format!("sleep {}", delay.num_seconds().max(0))];
        commands.extend(self.deletions.iter().map(kubectl_delete));
        commands.join("; ")
    }
}

fn kubectl_delete(target: &ObjectRef) -> String {
    let resource = target.kind.kube_kind().to_ascii_lowercase();
    match &target.scope {
        Some(scope) => format!(
            "kubectl delete {resource} {} -n {} --ignore-not-found",
            shell_quote(&target.name),
            shell_quote(scope)
        ),
        None => format!(
            "kubectl delete {resource} {} --ignore-not-found",
            shell_quote(&target.name)
        ),
    }
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Specification of the deletion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledUnitSpec {
    /// Job name.
    pub name: String,
    /// Namespace the job runs in.
    pub scope: String,
    /// Grant suffix, recorded as a label.
    pub grant: String,
    /// Time to wait before deleting anything.
    pub delay: Duration,
    /// Time the finished job is kept before the cluster removes it.
    pub retention: Duration,
    /// Service account the job runs as.
    pub runner: String,
    /// Container image.
    pub image: String,
    /// What the job does once the delay has elapsed.
    pub action: CleanupAction,
}

impl ScheduledUnitSpec {
    /// Container command: `sh -c <script>`.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            self.action.script(self.delay),
        ]
    }
}

/// Builds deletion jobs and the janitor role they run under.
#[derive(Debug, Clone)]
pub struct CleanupUnitBuilder {
    image: String,
    retention: Duration,
}

impl Default for CleanupUnitBuilder {
    fn default() -> Self {
        Self {
            image: DEFAULT_CLEANUP_IMAGE.to_string(),
            retention: Duration::seconds(DEFAULT_RETENTION_SECS),
        }
    }
}

impl CleanupUnitBuilder {
    /// Creates a builder with the default image and retention.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Overrides the retention window after completion.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Builds the deletion job for a grant.
    ///
    /// `permission_set` is the custom role to delete, if one was created.
    #[must_use]
    pub fn build(
        &self,
        scope: &str,
        ttl: Duration,
        names: &GrantNames,
        permission_set: Option<&str>,
    ) -> ScheduledUnitSpec {
        let mut deletions = vec![
            ObjectRef::identity(scope, &names.identity),
            ObjectRef::binding(&names.binding),
        ];
        if let Some(role) = permission_set {
            deletions.push(ObjectRef::permission_set(role));
        }
        deletions.push(ObjectRef::permission_set(&names.janitor_permission_set));

        ScheduledUnitSpec {
            name: names.scheduled_unit.clone(),
            scope: scope.to_string(),
            grant: names.suffix.clone(),
            delay: ttl,
            retention: self.retention,
            runner: names.janitor_identity.clone(),
            image: self.image.clone(),
            action: CleanupAction { deletions },
        }
    }

    /// Cluster role allowing exactly the deletions of `unit`.
    #[must_use]
    pub fn janitor_permission_set(&self, names: &GrantNames, unit: &ScheduledUnitSpec) -> PermissionSet {
        let mut rules: Vec<PolicyRule> = Vec::new();
        for kind in [ObjectKind::Identity, ObjectKind::Binding, ObjectKind::PermissionSet] {
            let targets: Vec<String> = unit
                .action
                .deletions
                .iter()
                .filter(|d| d.kind == kind)
                .map(|d| d.name.clone())
                .collect();
            if !targets.is_empty() {
                rules.push(PolicyRule::named(
                    kind.api_group(),
                    kind.resource(),
                    &JANITOR_VERBS,
                    targets,
                ));
            }
        }
        PermissionSet::new(&names.janitor_permission_set, &names.suffix, rules)
    }
}
