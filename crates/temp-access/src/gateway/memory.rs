//! In-memory cluster gateway.
//!
//! [`MemoryGateway`] keeps service accounts, cluster roles, bindings and
//! deletion jobs in process. It behaves like a strict API server:
//!
//! - bindings are rejected unless both the service account and the role exist
//! - tokens are rejected for missing service accounts or lifetimes under ten minutes
//! - deleting an owner garbage-collects its dependents
//!
//! Deletion jobs run against a manual clock: [`MemoryGateway::advance`]
//! executes every job whose delay has elapsed, authorizing each deletion
//! against the roles bound to the job's service account, and removes
//! finished jobs once their retention window has passed.
//!
//! Every call is recorded so tests can assert on ordering, and failures can
//! be injected per operation and namespace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::{
    Binding, ClusterGateway, Deletion, Identity, ObjectKind, ObjectRef, ObjectUid, PermissionSet,
};
use crate::cleanup::ScheduledUnitSpec;
use crate::error::{GatewayError, GatewayResult};
use crate::permissions::PolicyRule;

/// Roles every cluster ships with.
const BUILT_IN_ROLES: [&str; 4] = ["view", "edit", "admin", "cluster-admin"];

/// Shortest token lifetime the API server accepts.
const MIN_TOKEN_SECONDS: i64 = 600;

/// Gateway operations, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// `create_identity`
    CreateIdentity,
    /// `create_permission_set`
    CreatePermissionSet,
    /// `create_binding`
    CreateBinding,
    /// `issue_token`
    IssueToken,
    /// `create_scheduled_unit`
    CreateScheduledUnit,
    /// `delete_identity`
    DeleteIdentity,
    /// `delete_binding`
    DeleteBinding,
    /// `delete_permission_set`
    DeletePermissionSet,
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayCall {
    /// Service account creation.
    CreateIdentity {
        /// Namespace.
        scope: String,
        /// Name.
        name: String,
    },
    /// Cluster role creation.
    CreatePermissionSet {
        /// Name.
        name: String,
    },
    /// Cluster role binding creation.
    CreateBinding {
        /// Name.
        name: String,
        /// Namespace of the bound service account.
        scope: String,
        /// Referenced role.
        permission_set: String,
    },
    /// Token request.
    IssueToken {
        /// Namespace.
        scope: String,
        /// Service account.
        identity: String,
        /// Requested lifetime.
        expiration_seconds: i64,
    },
    /// Deletion job submission.
    CreateScheduledUnit {
        /// Namespace.
        scope: String,
        /// Name.
        name: String,
    },
    /// Service account deletion.
    DeleteIdentity {
        /// Namespace.
        scope: String,
        /// Name.
        name: String,
    },
    /// Cluster role binding deletion.
    DeleteBinding {
        /// Name.
        name: String,
    },
    /// Cluster role deletion.
    DeletePermissionSet {
        /// Name.
        name: String,
    },
}

impl GatewayCall {
    /// The operation this call performed.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            GatewayCall::CreateIdentity { .. } => Operation::CreateIdentity,
            GatewayCall::CreatePermissionSet { .. } => Operation::CreatePermissionSet,
            GatewayCall::CreateBinding { .. } => Operation::CreateBinding,
            GatewayCall::IssueToken { .. } => Operation::IssueToken,
            GatewayCall::CreateScheduledUnit { .. } => Operation::CreateScheduledUnit,
            GatewayCall::DeleteIdentity { .. } => Operation::DeleteIdentity,
            GatewayCall::DeleteBinding { .. } => Operation::DeleteBinding,
            GatewayCall::DeletePermissionSet { .. } => Operation::DeletePermissionSet,
        }
    }

    /// Namespace the call was made in, where one applies.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        match self {
            GatewayCall::CreateIdentity { scope, .. }
            | GatewayCall::CreateBinding { scope, .. }
            | GatewayCall::IssueToken { scope, .. }
            | GatewayCall::CreateScheduledUnit { scope, .. }
            | GatewayCall::DeleteIdentity { scope, .. } => Some(scope),
            GatewayCall::CreatePermissionSet { .. }
            | GatewayCall::DeleteBinding { .. }
            | GatewayCall::DeletePermissionSet { .. } => None,
        }
    }
}

/// A token handed out by the in-memory gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Namespace.
    pub scope: String,
    /// Service account.
    pub identity: String,
    /// Requested lifetime.
    pub expiration_seconds: i64,
    /// Clock reading at issuance.
    pub issued_at: DateTime<Utc>,
}

/// Lifecycle of a deletion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Waiting for its delay to elapse.
    Pending,
    /// Ran its deletions.
    Completed {
        /// When the deletions ran.
        finished_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct Stored<T> {
    uid: ObjectUid,
    owner: Option<ObjectUid>,
    value: T,
}

#[derive(Debug, Clone)]
struct UnitRecord {
    spec: ScheduledUnitSpec,
    submitted_at: DateTime<Utc>,
    state: UnitState,
}

impl UnitRecord {
    /// `None` when the delay runs past the end of the calendar; such a job never runs.
    fn due_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at.checked_add_signed(self.spec.delay)
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    operation: Operation,
    scope: Option<String>,
}

#[derive(Debug)]
struct ClusterState {
    now: DateTime<Utc>,
    next_uid: u64,
    identities: BTreeMap<(String, String), Stored<Identity>>,
    permission_sets: BTreeMap<String, Stored<PermissionSet>>,
    bindings: BTreeMap<String, Stored<Binding>>,
    units: BTreeMap<(String, String), UnitRecord>,
    calls: Vec<GatewayCall>,
    tokens: Vec<TokenRecord>,
    failures: Vec<FailureRule>,
}

impl ClusterState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            next_uid: 1,
            identities: BTreeMap::new(),
            permission_sets: BTreeMap::new(),
            bindings: BTreeMap::new(),
            units: BTreeMap::new(),
            calls: Vec::new(),
            tokens: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn next_uid(&mut self) -> ObjectUid {
        let uid = ObjectUid(format!("mem-{:08}", self.next_uid));
        self.next_uid += 1;
        uid
    }

    /// Records the call and applies any matching injected failure.
    fn record(&mut self, call: GatewayCall) -> GatewayResult<()> {
        let operation = call.operation();
        let scope = call.scope().map(ToString::to_string);
        self.calls.push(call);

        let injected = self.failures.iter().any(|rule| {
            rule.operation == operation
                && rule
                    .scope
                    .as_deref()
                    .map_or(true, |s| scope.as_deref() == Some(s))
        });
        if injected {
            return Err(GatewayError::Injected(format!(
                "{operation:?} in {}",
                scope.as_deref().unwrap_or("<cluster>")
            )));
        }
        Ok(())
    }

    fn role_exists(&self, name: &str) -> bool {
        BUILT_IN_ROLES.contains(&name) || self.permission_sets.contains_key(name)
    }

    fn role_rules(&self, name: &str) -> Vec<PolicyRule> {
        if name == "cluster-admin" {
            return vec![PolicyRule {
                api_groups: vec!["*".to_string()],
                resources: vec!["*".to_string()],
                verbs: vec!["*".to_string()],
                resource_names: Vec::new(),
            }];
        }
        self.permission_sets
            .get(name)
            .map(|s| s.value.rules.clone())
            .unwrap_or_default()
    }

    /// Whether `scope/identity` may perform `verb` on `target`.
    fn authorized(&self, scope: &str, identity: &str, verb: &str, target: &ObjectRef) -> bool {
        if !self
            .identities
            .contains_key(&(scope.to_string(), identity.to_string()))
        {
            return false;
        }
        self.bindings
            .values()
            .filter(|b| b.value.identity == identity && b.value.scope == scope)
            .flat_map(|b| self.role_rules(&b.value.permission_set))
            .any(|rule| {
                rule.allows(
                    verb,
                    target.kind.api_group(),
                    target.kind.resource(),
                    &target.name,
                )
            })
    }

    fn delete_identity(&mut self, scope: &str, name: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeleteIdentity {
            scope: scope.to_string(),
            name: name.to_string(),
        })?;
        let removed = self
            .identities
            .remove(&(scope.to_string(), name.to_string()))
            .ok_or_else(|| GatewayError::NotFound {
                kind: ObjectKind::Identity,
                name: name.to_string(),
            })?;
        self.collect_garbage(&removed.uid);
        Ok(())
    }

    fn delete_binding(&mut self, name: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeleteBinding {
            name: name.to_string(),
        })?;
        let removed = self
            .bindings
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound {
                kind: ObjectKind::Binding,
                name: name.to_string(),
            })?;
        self.collect_garbage(&removed.uid);
        Ok(())
    }

    fn delete_permission_set(&mut self, name: &str) -> GatewayResult<()> {
        self.record(GatewayCall::DeletePermissionSet {
            name: name.to_string(),
        })?;
        let removed = self
            .permission_sets
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound {
                kind: ObjectKind::PermissionSet,
                name: name.to_string(),
            })?;
        self.collect_garbage(&removed.uid);
        Ok(())
    }

    fn delete_object(&mut self, target: &ObjectRef) -> GatewayResult<()> {
        match target.deletion()? {
            Deletion::Identity { scope, name } => self.delete_identity(scope, name),
            Deletion::Binding(name) => self.delete_binding(name),
            Deletion::PermissionSet(name) => self.delete_permission_set(name),
        }
    }

    /// Removes service accounts and bindings owned by `owner`.
    fn collect_garbage(&mut self, owner: &ObjectUid) {
        let owned = |o: &Option<ObjectUid>| o.as_ref() == Some(owner);
        self.identities.retain(|_, stored| !owned(&stored.owner));
        self.bindings.retain(|_, stored| !owned(&stored.owner));
    }

    /// Runs due deletion jobs and drops finished ones past their retention.
    fn run_units(&mut self) -> usize {
        let now = self.now;
        let due: Vec<(String, String)> = self
            .units
            .iter()
            .filter(|(_, unit)| {
                unit.state == UnitState::Pending && unit.due_at().is_some_and(|due| due <= now)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &due {
            let Some(unit) = self.units.get(key).cloned() else {
                continue;
            };
            for target in &unit.spec.action.deletions {
                self.run_deletion(&unit.spec, target);
            }
            if let Some(stored) = self.units.get_mut(key) {
                stored.state = UnitState::Completed {
                    finished_at: unit.due_at().unwrap_or(now),
                };
            }
        }

        self.units.retain(|_, unit| match unit.state {
            UnitState::Completed { finished_at } => finished_at
                .checked_add_signed(unit.spec.retention)
                .map_or(true, |gone_at| gone_at > now),
            UnitState::Pending => true,
        });

        due.len()
    }

    fn run_deletion(&mut self, spec: &ScheduledUnitSpec, target: &ObjectRef) {
        // `--ignore-not-found` turns a missing object into a no-op.
        let exists = match target.kind {
            ObjectKind::Identity => target.scope.as_ref().is_some_and(|scope| {
                self.identities
                    .contains_key(&(scope.clone(), target.name.clone()))
            }),
            ObjectKind::Binding => self.bindings.contains_key(&target.name),
            ObjectKind::PermissionSet => self.permission_sets.contains_key(&target.name),
            ObjectKind::ScheduledUnit => false,
        };
        if !exists {
            return;
        }

        if !self.authorized(&spec.scope, &spec.runner, "delete", target) {
            tracing::warn!(
                unit = %spec.name,
                target = %target,
                "deletion job is not allowed to delete target"
            );
            return;
        }

        if let Err(err) = self.delete_object(target) {
            tracing::warn!(unit = %spec.name, target = %target, error = %err, "deletion failed");
        }
    }
}

/// In-process [`ClusterGateway`] with a manual clock.
#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<ClusterState>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    /// Creates an empty cluster whose clock starts at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates an empty cluster whose clock starts at `now`.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ClusterState::new(now)),
        }
    }

    /// Makes every call of `operation` fail.
    pub fn fail_on(&self, operation: Operation) {
        self.state.lock().failures.push(FailureRule {
            operation,
            scope: None,
        });
    }

    /// Makes calls of `operation` in namespace `scope` fail.
    pub fn fail_on_scope(&self, operation: Operation, scope: &str) {
        self.state.lock().failures.push(FailureRule {
            operation,
            scope: Some(scope.to_string()),
        });
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Current clock reading.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    /// Moves the clock forward and runs whatever became due.
    ///
    /// Returns the number of deletion jobs that executed.
    pub fn advance(&self, by: Duration) -> usize {
        let mut state = self.state.lock();
        state.now = state
            .now
            .checked_add_signed(by)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.run_units()
    }

    /// All calls made so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    /// All tokens issued so far.
    #[must_use]
    pub fn issued_tokens(&self) -> Vec<TokenRecord> {
        self.state.lock().tokens.clone()
    }

    /// Whether the service account exists.
    #[must_use]
    pub fn has_identity(&self, scope: &str, name: &str) -> bool {
        self.state
            .lock()
            .identities
            .contains_key(&(scope.to_string(), name.to_string()))
    }

    /// The stored service account, if present.
    #[must_use]
    pub fn identity(&self, scope: &str, name: &str) -> Option<Identity> {
        self.state
            .lock()
            .identities
            .get(&(scope.to_string(), name.to_string()))
            .map(|s| s.value.clone())
    }

    /// The stored custom cluster role, if present.
    #[must_use]
    pub fn permission_set(&self, name: &str) -> Option<PermissionSet> {
        self.state
            .lock()
            .permission_sets
            .get(name)
            .map(|s| s.value.clone())
    }

    /// The stored binding, if present.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<Binding> {
        self.state.lock().bindings.get(name).map(|s| s.value.clone())
    }

    /// The stored deletion job, if present.
    #[must_use]
    pub fn scheduled_unit(&self, scope: &str, name: &str) -> Option<ScheduledUnitSpec> {
        self.state
            .lock()
            .units
            .get(&(scope.to_string(), name.to_string()))
            .map(|u| u.spec.clone())
    }

    /// Lifecycle state of a deletion job, if it still exists.
    #[must_use]
    pub fn unit_state(&self, scope: &str, name: &str) -> Option<UnitState> {
        self.state
            .lock()
            .units
            .get(&(scope.to_string(), name.to_string()))
            .map(|u| u.state)
    }

    /// Every object currently stored (built-in roles excluded).
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectRef> {
        let state = self.state.lock();
        let mut objects: Vec<ObjectRef> = Vec::new();
        objects.extend(
            state
                .identities
                .keys()
                .map(|(scope, name)| ObjectRef::identity(scope, name)),
        );
        objects.extend(state.permission_sets.keys().map(|n| ObjectRef::permission_set(n)));
        objects.extend(state.bindings.keys().map(|n| ObjectRef::binding(n)));
        objects.extend(
            state
                .units
                .keys()
                .map(|(scope, name)| ObjectRef::scheduled_unit(scope, name)),
        );
        objects
    }

    /// Number of stored objects (built-in roles excluded).
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects().len()
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_identity(&self, identity: &Identity) -> GatewayResult<ObjectUid> {
        let mut state = self.state.lock();
        state.record(GatewayCall::CreateIdentity {
            scope: identity.scope.clone(),
            name: identity.name.clone(),
        })?;

        let key = (identity.scope.clone(), identity.name.clone());
        if state.identities.contains_key(&key) {
            return Err(GatewayError::AlreadyExists {
                kind: ObjectKind::Identity,
                name: identity.name.clone(),
            });
        }

        let uid = state.next_uid();
        let owner = identity.owner.as_ref().map(|o| o.uid.clone());
        state.identities.insert(
            key,
            Stored {
                uid: uid.clone(),
                owner,
                value: identity.clone(),
            },
        );
        Ok(uid)
    }

    async fn create_permission_set(&self, set: &PermissionSet) -> GatewayResult<ObjectUid> {
        let mut state = self.state.lock();
        state.record(GatewayCall::CreatePermissionSet {
            name: set.name.clone(),
        })?;

        if state.role_exists(&set.name) {
            return Err(GatewayError::AlreadyExists {
                kind: ObjectKind::PermissionSet,
                name: set.name.clone(),
            });
        }
        if let Some(index) = set.rules.iter().position(|r| r.resources.is_empty()) {
            return Err(GatewayError::Api {
                status: 422,
                reason: "Invalid".to_string(),
                message: format!(
                    "ClusterRole \"{}\" is invalid: rules[{index}].resources: Required value",
                    set.name
                ),
            });
        }

        let uid = state.next_uid();
        state.permission_sets.insert(
            set.name.clone(),
            Stored {
                uid: uid.clone(),
                owner: None,
                value: set.clone(),
            },
        );
        Ok(uid)
    }

    async fn create_binding(&self, binding: &Binding) -> GatewayResult<ObjectUid> {
        let mut state = self.state.lock();
        state.record(GatewayCall::CreateBinding {
            name: binding.name.clone(),
            scope: binding.scope.clone(),
            permission_set: binding.permission_set.clone(),
        })?;

        if state.bindings.contains_key(&binding.name) {
            return Err(GatewayError::AlreadyExists {
                kind: ObjectKind::Binding,
                name: binding.name.clone(),
            });
        }
        if !state.role_exists(&binding.permission_set) {
            return Err(GatewayError::NotFound {
                kind: ObjectKind::PermissionSet,
                name: binding.permission_set.clone(),
            });
        }
        if !state
            .identities
            .contains_key(&(binding.scope.clone(), binding.identity.clone()))
        {
            return Err(GatewayError::NotFound {
                kind: ObjectKind::Identity,
                name: binding.identity.clone(),
            });
        }

        let uid = state.next_uid();
        let owner = binding.owner.as_ref().map(|o| o.uid.clone());
        state.bindings.insert(
            binding.name.clone(),
            Stored {
                uid: uid.clone(),
                owner,
                value: binding.clone(),
            },
        );
        Ok(uid)
    }

    async fn issue_token(
        &self,
        scope: &str,
        identity: &str,
        expiration_seconds: i64,
    ) -> GatewayResult<String> {
        let mut state = self.state.lock();
        state.record(GatewayCall::IssueToken {
            scope: scope.to_string(),
            identity: identity.to_string(),
            expiration_seconds,
        })?;

        if !state
            .identities
            .contains_key(&(scope.to_string(), identity.to_string()))
        {
            return Err(GatewayError::NotFound {
                kind: ObjectKind::Identity,
                name: identity.to_string(),
            });
        }
        if expiration_seconds < MIN_TOKEN_SECONDS {
            return Err(GatewayError::Api {
                status: 422,
                reason: "Invalid".to_string(),
                message: "spec.expirationSeconds: may not specify a duration less than 10 minutes"
                    .to_string(),
            });
        }

        let issued_at = state.now;
        state.tokens.push(TokenRecord {
            scope: scope.to_string(),
            identity: identity.to_string(),
            expiration_seconds,
            issued_at,
        });
        Ok(format!("memory.{identity}.{}", Uuid::new_v4().simple()))
    }

    async fn create_scheduled_unit(&self, unit: &ScheduledUnitSpec) -> GatewayResult<ObjectUid> {
        let mut state = self.state.lock();
        state.record(GatewayCall::CreateScheduledUnit {
            scope: unit.scope.clone(),
            name: unit.name.clone(),
        })?;

        let key = (unit.scope.clone(), unit.name.clone());
        if state.units.contains_key(&key) {
            return Err(GatewayError::AlreadyExists {
                kind: ObjectKind::ScheduledUnit,
                name: unit.name.clone(),
            });
        }

        let uid = state.next_uid();
        let submitted_at = state.now;
        state.units.insert(
            key,
            UnitRecord {
                spec: unit.clone(),
                submitted_at,
                state: UnitState::Pending,
            },
        );
        Ok(uid)
    }

    async fn delete_identity(&self, scope: &str, name: &str) -> GatewayResult<()> {
        self.state.lock().delete_identity(scope, name)
    }

    async fn delete_binding(&self, name: &str) -> GatewayResult<()> {
        self.state.lock().delete_binding(name)
    }

    async fn delete_permission_set(&self, name: &str) -> GatewayResult<()> {
        self.state.lock().delete_permission_set(name)
    }
}
