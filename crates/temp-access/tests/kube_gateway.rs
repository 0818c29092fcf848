//! REST round trips against a local fake API server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Json;
use axum::Router;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tempfile::TempDir;

use temp_access::{
    AccessError, Binding, ClusterGateway, CredentialProvisioner, GatewayError, Identity, KubeGateway,
    ObjectKind, ProvisionerConfig,
};

const TOKEN: &str = "test-token";

#[derive(Default)]
struct FakeApi {
    objects: BTreeMap<String, Value>,
    requests: Vec<(Method, String, Value)>,
    next_uid: u64,
    fail_with: Option<StatusCode>,
    fail_post_suffix: Option<String>,
}

type Shared = Arc<Mutex<FakeApi>>;

fn status(code: StatusCode, reason: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        code,
        Json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "reason": reason,
            "message": message,
            "code": code.as_u16(),
        })),
    )
}

async fn handle(
    State(api): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let path = uri.path().to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let mut api = api.lock();
    api.requests.push((method.clone(), path.clone(), body.clone()));

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"));
    if !authorized {
        return status(StatusCode::FORBIDDEN, "Forbidden", "system:anonymous cannot do that");
    }
    if let Some(code) = api.fail_with {
        return status(code, "InternalError", "etcd unavailable");
    }
    if method == Method::POST
        && api
            .fail_post_suffix
            .as_deref()
            .is_some_and(|suffix| path.ends_with(suffix))
    {
        return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "admission webhook failed");
    }

    if method == Method::POST && path.ends_with("/token") {
        let account = path.trim_end_matches("/token");
        if !api.objects.contains_key(account) {
            return status(StatusCode::NOT_FOUND, "NotFound", "serviceaccount not found");
        }
        let name = account.rsplit('/').next().unwrap_or_default();
        return (
            StatusCode::CREATED,
            Json(json!({"status": {"token": format!("fake-token-{name}")}})),
        );
    }

    if method == Method::POST {
        let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let key = format!("{path}/{name}");
        if api.objects.contains_key(&key) {
            return status(StatusCode::CONFLICT, "AlreadyExists", "already exists");
        }
        api.next_uid += 1;
        let mut stored = body;
        stored["metadata"]["uid"] = json!(format!("uid-{}", api.next_uid));
        api.objects.insert(key, stored.clone());
        return (StatusCode::CREATED, Json(stored));
    }

    if method == Method::DELETE {
        return match api.objects.remove(&path) {
            Some(_) => (StatusCode::OK, Json(json!({"kind": "Status", "status": "Success"}))),
            None => status(StatusCode::NOT_FOUND, "NotFound", "not found"),
        };
    }

    status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "unsupported")
}

async fn start() -> (SocketAddr, Shared) {
    let api: Shared = Arc::new(Mutex::new(FakeApi::default()));
    let app = Router::new().fallback(handle).with_state(api.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, api)
}

fn gateway(addr: SocketAddr) -> KubeGateway {
    KubeGateway::new(format!("http://{addr}"), reqwest::Client::new())
        .with_bearer_token(SecretString::new(TOKEN.to_string()))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn test_provision_against_api_server() {
    let (addr, api) = start().await;
    let provisioner = CredentialProvisioner::new(Arc::new(gateway(addr)), ProvisionerConfig::default());

    let grant = provisioner
        .provision("team-a", &strings(&["pods", "deployments"]), "15m")
        .await
        .unwrap();
    assert_eq!(
        grant.token.expose_secret(),
        &format!("fake-token-{}", grant.names.identity)
    );

    let api = api.lock();
    let paths: Vec<String> = api
        .requests
        .iter()
        .map(|(method, path, _)| format!("{method} {path}"))
        .collect();
    let names = &grant.names;
    assert_eq!(
        paths,
        vec![
            "POST /api/v1/namespaces/team-a/serviceaccounts".to_string(),
            "POST /apis/rbac.authorization.k8s.io/v1/clusterroles".to_string(),
            "POST /apis/rbac.authorization.k8s.io/v1/clusterrolebindings".to_string(),
            format!("POST /api/v1/namespaces/team-a/serviceaccounts/{}/token", names.identity),
            "POST /apis/rbac.authorization.k8s.io/v1/clusterroles".to_string(),
            "POST /api/v1/namespaces/team-a/serviceaccounts".to_string(),
            "POST /apis/rbac.authorization.k8s.io/v1/clusterrolebindings".to_string(),
            "POST /apis/batch/v1/namespaces/team-a/jobs".to_string(),
        ]
    );

    let token_request = &api.requests[3].2;
    assert_eq!(token_request["spec"]["expirationSeconds"], 900);

    let role = &api.requests[1].2;
    assert_eq!(role["rules"][0]["resources"], json!(["pods", "deployments"]));

    let janitor_sa = &api.requests[5].2;
    assert_eq!(janitor_sa["metadata"]["ownerReferences"][0]["name"], names.janitor_permission_set.as_str());
    assert_eq!(janitor_sa["metadata"]["ownerReferences"][0]["uid"], "uid-4");

    let job = &api.requests[7].2;
    let command = job["spec"]["template"]["spec"]["containers"][0]["command"][2]
        .as_str()
        .unwrap();
    assert!(command.starts_with("sleep 900; "));
    assert!(command.contains(&names.permission_set));
}

#[tokio::test]
async fn test_conflict_maps_to_already_exists() {
    let (addr, _api) = start().await;
    let gw = gateway(addr);
    let sa = Identity::new("default", "temp-sa-dup", "dup");
    gw.create_identity(&sa).await.unwrap();
    let err = gw.create_identity(&sa).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::AlreadyExists {
            kind: ObjectKind::Identity,
            ..
        }
    ));
}

#[tokio::test]
async fn test_delete_missing_maps_to_not_found() {
    let (addr, _api) = start().await;
    let err = gateway(addr).delete_binding("temp-binding-gone").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_existing_binding() {
    let (addr, api) = start().await;
    let gw = gateway(addr);
    gw.create_identity(&Identity::new("default", "temp-sa-b", "b"))
        .await
        .unwrap();
    gw.create_binding(&Binding::new("temp-binding-b", "temp-sa-b", "default", "view", "b"))
        .await
        .unwrap();
    gw.delete_binding("temp-binding-b").await.unwrap();
    assert!(!api
        .lock()
        .objects
        .contains_key("/apis/rbac.authorization.k8s.io/v1/clusterrolebindings/temp-binding-b"));
}

#[tokio::test]
async fn test_missing_credentials_are_forbidden() {
    let (addr, _api) = start().await;
    let gw = KubeGateway::new(format!("http://{addr}"), reqwest::Client::new());
    let err = gw
        .create_identity(&Identity::new("default", "temp-sa-x", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(msg) if msg.contains("anonymous")));
}

#[tokio::test]
async fn test_server_error_maps_to_api_error() {
    let (addr, api) = start().await;
    api.lock().fail_with = Some(StatusCode::INTERNAL_SERVER_ERROR);
    let err = gateway(addr)
        .issue_token("default", "temp-sa-x", 900)
        .await
        .unwrap_err();
    match err {
        GatewayError::Api {
            status,
            reason,
            message,
        } => {
            assert_eq!(status, 500);
            assert_eq!(reason, "InternalError");
            assert_eq!(message, "etcd unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failed_job_rolls_back_over_rest() {
    let (addr, api) = start().await;
    api.lock().fail_post_suffix = Some("/jobs".to_string());
    let provisioner = CredentialProvisioner::new(Arc::new(gateway(addr)), ProvisionerConfig::default());

    let err = provisioner
        .provision("team-b", &strings(&["pods"]), "1h")
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::CleanupSchedulingFailed { .. }));

    let api = api.lock();
    assert!(api.objects.is_empty(), "left behind: {:?}", api.objects.keys());
    let deletes: Vec<&str> = api
        .requests
        .iter()
        .filter(|(method, _, _)| *method == Method::DELETE)
        .map(|(_, path, _)| path.rsplit('/').next().unwrap_or_default())
        .collect();
    assert_eq!(deletes.len(), 6);
    assert!(deletes[0].starts_with("temp-janitor-binding-"));
    assert!(deletes[5].starts_with("temp-sa-"));
}

#[tokio::test]
async fn test_from_kubeconfig() {
    let (addr, _api) = start().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config");
    std::fs::write(
        &path,
        format!(
            r#"
current-context: local
clusters:
  - name: local
    cluster:
      server: http://{addr}
contexts:
  - name: local
    context:
      cluster: local
      user: admin
users:
  - name: admin
    user:
      token: {TOKEN}
"#
        ),
    )
    .unwrap();

    let gw = KubeGateway::from_kubeconfig(&path, None, Duration::from_secs(5)).unwrap();
    assert_eq!(gw.server(), format!("http://{addr}"));
    let uid = gw
        .create_identity(&Identity::new("default", "temp-sa-k", "k"))
        .await
        .unwrap();
    assert_eq!(uid.0, "uid-1");
}
