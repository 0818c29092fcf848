//! Provisioning scenarios against the in-memory cluster.

use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;
use secrecy::ExposeSecret;

use temp_access::gateway::{GatewayCall, Operation, UnitState};
use temp_access::{
    AccessError, CredentialProvisioner, MemoryGateway, ObjectRef, ProvisionStep,
    ProvisionerConfig, RoleChoice,
};

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn setup() -> (Arc<MemoryGateway>, CredentialProvisioner) {
    let gw = Arc::new(MemoryGateway::new());
    let provisioner = CredentialProvisioner::new(gw.clone(), ProvisionerConfig::default());
    (gw, provisioner)
}

fn position(calls: &[GatewayCall], wanted: impl Fn(&GatewayCall) -> bool) -> usize {
    calls
        .iter()
        .position(wanted)
        .unwrap_or_else(|| panic!("call not found in {calls:?}"))
}

#[tokio::test]
async fn test_view_grant_for_fifteen_minutes() {
    let (gw, provisioner) = setup();
    let grant = provisioner
        .provision("default", &strings(&["view"]), "15m")
        .await
        .unwrap();

    assert_eq!(grant.role, RoleChoice::BuiltIn);
    assert_eq!(grant.role_name(), "view");
    assert_eq!(grant.ttl.num_seconds(), 900);
    assert!(!grant.token.expose_secret().is_empty());

    let tokens = gw.issued_tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].expiration_seconds, 900);
    assert_eq!(tokens[0].identity, grant.names.identity);

    let unit = gw
        .scheduled_unit("default", &grant.names.scheduled_unit)
        .unwrap();
    assert_eq!(unit.delay.num_seconds(), 900);
    assert_eq!(unit.runner, grant.names.janitor_identity);

    assert!(gw.permission_set(&grant.names.permission_set).is_none());
    assert_eq!(gw.binding(&grant.names.binding).unwrap().permission_set, "view");

    let units = gw
        .calls()
        .into_iter()
        .filter(|c| c.operation() == Operation::CreateScheduledUnit)
        .count();
    assert_eq!(units, 1);
}

#[tokio::test]
async fn test_custom_resources_get_their_own_role() {
    let (gw, provisioner) = setup();
    let grant = provisioner
        .provision("default", &strings(&["pods", "deployments"]), "15m")
        .await
        .unwrap();

    let role = gw.permission_set(&grant.names.permission_set).unwrap();
    assert_eq!(role.rules.len(), 1);
    assert_eq!(role.rules[0].resources, strings(&["pods", "deployments"]));
    assert_eq!(role.rules[0].verbs, strings(&["get", "list", "watch"]));
    assert_eq!(role.rules[0].api_groups, strings(&["", "apps"]));

    let binding = gw.binding(&grant.names.binding).unwrap();
    assert_eq!(binding.permission_set, grant.names.permission_set);
    assert_eq!(binding.identity, grant.names.identity);

    let unit = gw
        .scheduled_unit("default", &grant.names.scheduled_unit)
        .unwrap();
    assert!(unit
        .action
        .deletions
        .contains(&ObjectRef::permission_set(&grant.names.permission_set)));
}

#[tokio::test]
async fn test_bad_expiration_creates_nothing() {
    let (gw, provisioner) = setup();
    let err = provisioner
        .provision("default", &strings(&["view"]), "notaduration")
        .await
        .unwrap_err();

    assert!(matches!(err, AccessError::InvalidDuration { .. }));
    assert_eq!(err.step(), ProvisionStep::ParseDuration);
    assert!(gw.calls().is_empty());
    assert_eq!(gw.object_count(), 0);
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let (gw, provisioner) = setup();
    let grant = provisioner
        .provision("default", &strings(&["pods"]), "1h")
        .await
        .unwrap();
    let names = &grant.names;
    let calls = gw.calls();

    let identity = position(&calls, |c| {
        matches!(c, GatewayCall::CreateIdentity { name, .. } if *name == names.identity)
    });
    let role = position(&calls, |c| {
        matches!(c, GatewayCall::CreatePermissionSet { name } if *name == names.permission_set)
    });
    let binding = position(&calls, |c| {
        matches!(c, GatewayCall::CreateBinding { name, .. } if *name == names.binding)
    });
    let token = position(&calls, |c| c.operation() == Operation::IssueToken);
    let unit = position(&calls, |c| c.operation() == Operation::CreateScheduledUnit);

    assert!(identity < binding);
    assert!(role < binding);
    assert!(binding < token);
    assert_eq!(unit, calls.len() - 1);
    assert!(token < unit);
}

#[tokio::test]
async fn test_one_failing_scope_does_not_affect_others() {
    let (gw, provisioner) = setup();
    gw.fail_on_scope(Operation::CreateIdentity, "broken");

    let outcomes = provisioner
        .create_temporary_access(&strings(&["team-a", "broken", "team-c"]), &strings(&["view"]), "15m")
        .await;

    let scopes: Vec<&str> = outcomes.iter().map(|o| o.scope.as_str()).collect();
    assert_eq!(scopes, ["team-a", "broken", "team-c"]);
    assert!(outcomes[0].is_ok());
    assert!(outcomes[2].is_ok());
    match &outcomes[1].result {
        Err(err @ AccessError::IdentityCreationFailed { .. }) => {
            assert_eq!(err.scope(), Some("broken"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(gw.issued_tokens().len(), 2);
}

#[tokio::test]
async fn test_batch_with_bad_expiration_fails_every_scope() {
    let (gw, provisioner) = setup();
    let outcomes = provisioner
        .create_temporary_access(&strings(&["a", "b"]), &strings(&["view"]), "15")
        .await;
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.result, Err(AccessError::InvalidDuration { .. }))));
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn test_grant_removes_itself_after_ttl() {
    let (gw, provisioner) = setup();
    let grant = provisioner
        .provision("default", &strings(&["pods"]), "15m")
        .await
        .unwrap();
    let names = grant.names.clone();
    assert_eq!(gw.object_count(), 7);

    assert_eq!(gw.advance(Duration::seconds(899)), 0);
    assert!(gw.has_identity("default", &names.identity));

    assert_eq!(gw.advance(Duration::seconds(1)), 1);
    assert!(!gw.has_identity("default", &names.identity));
    assert!(gw.binding(&names.binding).is_none());
    assert!(gw.permission_set(&names.permission_set).is_none());
    assert!(gw.permission_set(&names.janitor_permission_set).is_none());
    assert!(!gw.has_identity("default", &names.janitor_identity));
    assert!(gw.binding(&names.janitor_binding).is_none());
    assert!(matches!(
        gw.unit_state("default", &names.scheduled_unit),
        Some(UnitState::Completed { .. })
    ));

    gw.advance(Duration::seconds(29));
    assert!(gw.unit_state("default", &names.scheduled_unit).is_some());
    gw.advance(Duration::seconds(1));
    assert!(gw.unit_state("default", &names.scheduled_unit).is_none());
    assert_eq!(gw.object_count(), 0);
}

#[tokio::test]
async fn test_cleanup_leaves_other_grants_alone() {
    let (gw, provisioner) = setup();
    let short = provisioner
        .provision("default", &strings(&["view"]), "10m")
        .await
        .unwrap();
    let long = provisioner
        .provision("default", &strings(&["view"]), "1h")
        .await
        .unwrap();
    assert_ne!(short.names.suffix, long.names.suffix);

    gw.advance(Duration::minutes(10));
    assert!(!gw.has_identity("default", &short.names.identity));
    assert!(gw.has_identity("default", &long.names.identity));
    assert!(gw.binding(&long.names.binding).is_some());
}

#[tokio::test]
async fn test_cleanup_deletions_are_best_effort() {
    let (gw, provisioner) = setup();
    let grant = provisioner
        .provision("default", &strings(&["pods"]), "15m")
        .await
        .unwrap();
    gw.fail_on(Operation::DeleteBinding);

    gw.advance(Duration::minutes(15));
    assert!(!gw.has_identity("default", &grant.names.identity));
    assert!(gw.permission_set(&grant.names.permission_set).is_none());
    assert!(gw.permission_set(&grant.names.janitor_permission_set).is_none());
    assert!(gw.binding(&grant.names.binding).is_some());
}

#[tokio::test]
async fn test_failed_token_rolls_back() {
    let (gw, provisioner) = setup();
    gw.fail_on(Operation::IssueToken);

    let err = provisioner
        .provision("default", &strings(&["pods"]), "15m")
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::TokenIssuanceFailed { .. }));
    assert_eq!(err.step(), ProvisionStep::IssueToken);
    assert!(err.leaked().is_empty());
    assert_eq!(gw.object_count(), 0);
}

#[tokio::test]
async fn test_failed_job_rolls_back_janitor_objects() {
    let (gw, provisioner) = setup();
    gw.fail_on(Operation::CreateScheduledUnit);

    let err = provisioner
        .provision("default", &strings(&["view"]), "15m")
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::CleanupSchedulingFailed { .. }));
    assert_eq!(gw.object_count(), 0);

    let deletes: Vec<Operation> = gw
        .calls()
        .iter()
        .map(GatewayCall::operation)
        .filter(|op| {
            matches!(
                op,
                Operation::DeleteIdentity | Operation::DeleteBinding | Operation::DeletePermissionSet
            )
        })
        .collect();
    assert_eq!(
        deletes,
        vec![
            Operation::DeleteBinding,
            Operation::DeleteIdentity,
            Operation::DeletePermissionSet,
            Operation::DeleteBinding,
            Operation::DeleteIdentity,
        ]
    );
}

#[tokio::test]
async fn test_disabled_rollback_reports_leak() {
    let gw = Arc::new(MemoryGateway::new());
    let config = ProvisionerConfig {
        rollback_on_failure: false,
        ..ProvisionerConfig::default()
    };
    let provisioner = CredentialProvisioner::new(gw.clone(), config);
    gw.fail_on(Operation::CreateBinding);

    let err = provisioner
        .provision("default", &strings(&["pods"]), "15m")
        .await
        .unwrap_err();

    let AccessError::PartialGrantLeaked { scope, leaked, source } = &err else {
        panic!("expected a leak report, got {err}");
    };
    assert_eq!(scope, "default");
    assert!(matches!(**source, AccessError::BindingCreationFailed { .. }));
    assert_eq!(leaked.len(), 2);
    assert_eq!(err.step(), ProvisionStep::CreateBinding);
    assert_eq!(gw.object_count(), 2);
}

#[tokio::test]
async fn test_failed_rollback_reports_what_is_left() {
    let (gw, provisioner) = setup();
    gw.fail_on(Operation::IssueToken);
    gw.fail_on(Operation::DeleteIdentity);

    let err = provisioner
        .provision("default", &strings(&["view"]), "15m")
        .await
        .unwrap_err();

    let leaked = err.leaked();
    assert_eq!(leaked.len(), 1);
    assert!(leaked[0].name.starts_with("temp-sa-"));
    assert!(err.to_string().contains("objects left in the cluster"));
    assert_eq!(gw.object_count(), 1);
}

proptest! {
    #[test]
    fn test_token_and_unit_follow_ttl(minutes in 10i64..1440) {
        let (gw, provisioner) = setup();
        let expiration = format!("{minutes}m");
        let grant = futures::executor::block_on(
            provisioner.provision("default", &strings(&["view"]), &expiration),
        )
        .unwrap();

        prop_assert_eq!(grant.ttl.num_seconds(), minutes * 60);
        prop_assert_eq!(gw.issued_tokens()[0].expiration_seconds, minutes * 60);
        let unit = gw.scheduled_unit("default", &grant.names.scheduled_unit).unwrap();
        prop_assert_eq!(unit.delay.num_seconds(), minutes * 60);
    }
}
