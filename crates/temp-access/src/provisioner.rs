//! Credential provisioner: orchestrates the creation of one grant per scope.
//!
//! For each scope the provisioner runs, strictly in order:
//!
//! 1. parse the time-to-live
//! 2. allocate names
//! 3. create the service account
//! 4. create the custom cluster role (custom resource lists only)
//! 5. bind the service account to its role
//! 6. request a token valid for the time-to-live
//! 7. create the janitor objects and submit the deletion job
//!
//! Nothing is retried. When a step after the first creation fails, the
//! objects created so far are deleted again, newest first, unless rollback
//! is disabled.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::cleanup::CleanupUnitBuilder;
use crate::config::AccessConfig;
use crate::duration::{format_duration, parse_duration};
use crate::error::{AccessError, Result};
use crate::gateway::{
    Binding, ClusterGateway, Identity, ObjectKind, ObjectRef, OwnerReference, PermissionSet,
};
use crate::naming::{self, GrantNames};
use crate::permissions::{self, RoleChoice};

/// Provisioner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Image for the deletion job.
    pub cleanup_image: String,
    /// How long a finished deletion job is kept.
    pub cleanup_retention: Duration,
    /// Shortest accepted time-to-live.
    pub min_ttl: Duration,
    /// Longest accepted time-to-live.
    pub max_ttl: Duration,
    /// Delete already-created objects when a later step fails.
    pub rollback_on_failure: bool,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self::from(&AccessConfig::default())
    }
}

impl From<&AccessConfig> for ProvisionerConfig {
    fn from(config: &AccessConfig) -> Self {
        Self {
            cleanup_image: config.cleanup_image.clone(),
            cleanup_retention: config.cleanup_retention(),
            min_ttl: config.min_ttl(),
            max_ttl: config.max_ttl(),
            rollback_on_failure: config.rollback_on_failure,
        }
    }
}

/// A successfully provisioned grant.
#[derive(Debug, Clone)]
pub struct IssuedGrant {
    /// Namespace the service account lives in.
    pub scope: String,
    /// Names of every object belonging to the grant.
    pub names: GrantNames,
    /// Role the service account is bound to.
    pub role: RoleChoice,
    /// Bearer token; returned once and never stored.
    pub token: SecretString,
    /// Requested time-to-live.
    pub ttl: Duration,
    /// When the deletion job is due.
    pub expires_at: DateTime<Utc>,
}

impl IssuedGrant {
    /// Name of the cluster role the binding references.
    #[must_use]
    pub fn role_name(&self) -> &str {
        self.role.role_name(&self.names)
    }
}

/// Result of provisioning one scope of a batch.
#[derive(Debug)]
pub struct ScopeOutcome {
    /// The scope as requested.
    pub scope: String,
    /// The grant or the reason it failed.
    pub result: Result<IssuedGrant>,
}

impl ScopeOutcome {
    /// Returns true if the scope was provisioned.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Creates temporary, self-cleaning access grants.
pub struct CredentialProvisioner {
    gateway: Arc<dyn ClusterGateway>,
    config: ProvisionerConfig,
    cleanup: CleanupUnitBuilder,
}

impl std::fmt::Debug for CredentialProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvisioner")
            .field("gateway", &self.gateway.name())
            .field("config", &self.config)
            .finish()
    }
}

impl CredentialProvisioner {
    /// Creates a provisioner over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: ProvisionerConfig) -> Self {
        let cleanup = CleanupUnitBuilder::new()
            .with_image(config.cleanup_image.clone())
            .with_retention(config.cleanup_retention);
        Self {
            gateway,
            config,
            cleanup,
        }
    }

    /// Provisioner settings.
    #[must_use]
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Parses an expiration literal and checks it against the accepted time-to-live range.
    pub fn parse_ttl(&self, expiration: &str) -> Result<Duration> {
        let ttl = parse_duration(expiration)?;
        let invalid = |reason: String| AccessError::InvalidDuration {
            input: expiration.to_string(),
            reason,
        };
        if ttl <= Duration::zero() || ttl < self.config.min_ttl {
            return Err(invalid(format!(
                "must be at least {}",
                format_duration(self.config.min_ttl.max(Duration::seconds(1)))
            )));
        }
        if ttl > self.config.max_ttl {
            return Err(invalid(format!(
                "must be at most {}",
                format_duration(self.config.max_ttl)
            )));
        }
        Ok(ttl)
    }

    /// Provisions a grant for every scope, concurrently and independently.
    ///
    /// Outcomes are returned in input order; a failure in one scope never
    /// affects another.
    pub async fn create_temporary_access(
        &self,
        scopes: &[String],
        requested: &[String],
        expiration: &str,
    ) -> Vec<ScopeOutcome> {
        let outcomes = join_all(scopes.iter().map(|scope| async move {
            ScopeOutcome {
                scope: scope.clone(),
                result: self.provision(scope, requested, expiration).await,
            }
        }))
        .await;

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(
            scopes = outcomes.len(),
            failed,
            gateway = self.gateway.name(),
            "temporary access batch finished"
        );
        outcomes
    }

    /// Provisions one grant in `scope`.
    #[tracing::instrument(skip(self, requested), fields(gateway = self.gateway.name()), err)]
    pub async fn provision(
        &self,
        scope: &str,
        requested: &[String],
        expiration: &str,
    ) -> Result<IssuedGrant> {
        let ttl = self.parse_ttl(expiration)?;
        let names = naming::allocate();
        let mut created: Vec<ObjectRef> = Vec::new();

        match self.run_steps(scope, requested, ttl, &names, &mut created).await {
            Ok(grant) => {
                info!(
                    scope,
                    grant = %names.suffix,
                    role = grant.role_name(),
                    expires_at = %grant.expires_at,
                    "temporary access granted"
                );
                Ok(grant)
            }
            Err(err) => Err(self.compensate(scope, err, created).await),
        }
    }

    async fn run_steps(
        &self,
        scope: &str,
        requested: &[String],
        ttl: Duration,
        names: &GrantNames,
        created: &mut Vec<ObjectRef>,
    ) -> Result<IssuedGrant> {
        let gw = &self.gateway;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| AccessError::InvalidDuration {
                input: format_duration(ttl),
                reason: "expiry is out of range".to_string(),
            })?;

        gw.create_identity(&Identity::new(scope, &names.identity, &names.suffix))
            .await
            .map_err(|source| AccessError::IdentityCreationFailed {
                scope: scope.to_string(),
                identity: names.identity.clone(),
                source,
            })?;
        created.push(ObjectRef::identity(scope, &names.identity));

        let role = permissions::resolve(requested);
        if let RoleChoice::Custom(rules) = &role {
            let set = PermissionSet::new(&names.permission_set, &names.suffix, rules.clone());
            gw.create_permission_set(&set).await.map_err(|source| {
                AccessError::PermissionSetCreationFailed {
                    scope: scope.to_string(),
                    permission_set: names.permission_set.clone(),
                    source,
                }
            })?;
            created.push(ObjectRef::permission_set(&names.permission_set));
        }

        let binding = Binding::new(
            &names.binding,
            &names.identity,
            scope,
            role.role_name(names),
            &names.suffix,
        );
        gw.create_binding(&binding)
            .await
            .map_err(|source| AccessError::BindingCreationFailed {
                scope: scope.to_string(),
                binding: names.binding.clone(),
                source,
            })?;
        created.push(ObjectRef::binding(&names.binding));

        let token = gw
            .issue_token(scope, &names.identity, ttl.num_seconds())
            .await
            .map_err(|source| AccessError::TokenIssuanceFailed {
                scope: scope.to_string(),
                identity: names.identity.clone(),
                source,
            })?;

        self.schedule_cleanup(scope, ttl, names, &role, created)
            .await
            .map_err(|source| AccessError::CleanupSchedulingFailed {
                scope: scope.to_string(),
                unit: names.scheduled_unit.clone(),
                source,
            })?;

        Ok(IssuedGrant {
            scope: scope.to_string(),
            names: names.clone(),
            role,
            token: SecretString::new(token),
            ttl,
            expires_at,
        })
    }

    /// Creates the janitor role, service account and binding, then the job.
    async fn schedule_cleanup(
        &self,
        scope: &str,
        ttl: Duration,
        names: &GrantNames,
        role: &RoleChoice,
        created: &mut Vec<ObjectRef>,
    ) -> crate::GatewayResult<()> {
        let gw = &self.gateway;
        let custom_role = role.is_custom().then_some(names.permission_set.as_str());
        let unit = self.cleanup.build(scope, ttl, names, custom_role);

        let janitor_role = self.cleanup.janitor_permission_set(names, &unit);
        let uid = gw.create_permission_set(&janitor_role).await?;
        created.push(ObjectRef::permission_set(&names.janitor_permission_set));

        let owner = OwnerReference {
            kind: ObjectKind::PermissionSet,
            name: names.janitor_permission_set.clone(),
            uid,
        };

        let janitor = Identity::new(scope, &names.janitor_identity, &names.suffix)
            .owned_by(owner.clone());
        gw.create_identity(&janitor).await?;
        created.push(ObjectRef::identity(scope, &names.janitor_identity));

        let janitor_binding = Binding::new(
            &names.janitor_binding,
            &names.janitor_identity,
            scope,
            &names.janitor_permission_set,
            &names.suffix,
        )
        .owned_by(owner);
        gw.create_binding(&janitor_binding).await?;
        created.push(ObjectRef::binding(&names.janitor_binding));

        gw.create_scheduled_unit(&unit).await?;
        Ok(())
    }

    /// Deletes `created` newest first; wraps `err` if anything is left behind.
    async fn compensate(
        &self,
        scope: &str,
        err: AccessError,
        created: Vec<ObjectRef>,
    ) -> AccessError {
        if created.is_empty() {
            return err;
        }

        let leaked = if self.config.rollback_on_failure {
            let mut leaked = Vec::new();
            for object in created.into_iter().rev() {
                match self.gateway.delete_object(&object).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(scope, object = %object, error = %e, "rollback deletion failed");
                        leaked.push(object);
                    }
                }
            }
            leaked
        } else {
            created
        };

        if leaked.is_empty() {
            info!(scope, step = %err.step(), "rolled back partial grant");
            return err;
        }

        warn!(scope, leaked = leaked.len(), step = %err.step(), "partial grant left in cluster");
        AccessError::PartialGrantLeaked {
            scope: scope.to_string(),
            leaked,
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MemoryGateway, Operation};

    fn provisioner(gateway: Arc<MemoryGateway>) -> CredentialProvisioner {
        CredentialProvisioner::new(gateway, ProvisionerConfig::default())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_ttl_below_minimum_rejected() {
        let p = provisioner(Arc::new(MemoryGateway::new()));
        assert!(matches!(
            p.parse_ttl("5m"),
            Err(AccessError::InvalidDuration { .. })
        ));
        assert!(matches!(
            p.parse_ttl("0s"),
            Err(AccessError::InvalidDuration { .. })
        ));
        assert_eq!(p.parse_ttl("10m").unwrap().num_seconds(), 600);
    }

    #[tokio::test]
    async fn test_short_ttl_creates_nothing() {
        let gw = Arc::new(MemoryGateway::new());
        let err = provisioner(gw.clone())
            .provision("default", &strings(&["view"]), "1m")
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidDuration { .. }));
        assert!(gw.calls().is_empty());
    }

    #[test]
    fn test_ttl_above_maximum_rejected() {
        let p = provisioner(Arc::new(MemoryGateway::new()));
        assert!(p.parse_ttl("1193046h").is_ok());
        let err = p.parse_ttl("1193047h").unwrap_err();
        assert!(err.to_string().contains("at most"));
    }

    #[tokio::test]
    async fn test_huge_ttl_creates_nothing() {
        let gw = Arc::new(MemoryGateway::new());
        let err = provisioner(gw.clone())
            .provision("default", &strings(&["view"]), "3000000000h")
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidDuration { .. }));
        assert!(gw.calls().is_empty());
    }

    #[tokio::test]
    async fn test_janitor_objects_are_owned_by_janitor_role() {
        let gw = Arc::new(MemoryGateway::new());
        let grant = provisioner(gw.clone())
            .provision("default", &strings(&["pods"]), "15m")
            .await
            .unwrap();

        let janitor_role = gw.permission_set(&grant.names.janitor_permission_set).unwrap();
        assert_eq!(janitor_role.rules.len(), 3);

        let janitor = gw
            .identity("default", &grant.names.janitor_identity)
            .unwrap();
        let owner = janitor.owner.unwrap();
        assert_eq!(owner.name, grant.names.janitor_permission_set);

        let binding = gw.binding(&grant.names.janitor_binding).unwrap();
        assert_eq!(binding.permission_set, grant.names.janitor_permission_set);
        assert_eq!(binding.owner.unwrap().uid, owner.uid);
    }

    #[tokio::test]
    async fn test_identity_failure_needs_no_rollback() {
        let gw = Arc::new(MemoryGateway::new());
        gw.fail_on(Operation::CreateIdentity);
        let err = provisioner(gw.clone())
            .provision("default", &strings(&["view"]), "15m")
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::IdentityCreationFailed { .. }));
        assert!(!gw
            .calls()
            .iter()
            .any(|c| c.operation() == Operation::DeleteIdentity));
    }

    #[tokio::test]
    async fn test_debug_hides_token() {
        let gw = Arc::new(MemoryGateway::new());
        let grant = provisioner(gw)
            .provision("default", &strings(&["view"]), "15m")
            .await
            .unwrap();
        let debug = format!("{grant:?}");
        assert!(!debug.contains("memory."));
    }
}
