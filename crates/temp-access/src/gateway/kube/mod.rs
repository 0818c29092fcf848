//! Kubernetes REST gateway.

pub mod manifests;
mod kubeconfig;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

pub use kubeconfig::{Kubeconfig, ResolvedContext};

use super::{Binding, ClusterGateway, Identity, ObjectKind, ObjectUid, PermissionSet};
use crate::cleanup::ScheduledUnitSpec;
use crate::error::{GatewayError, GatewayResult};

const CORE: &str = "/api/v1";
const RBAC: &str = "/apis/rbac.authorization.k8s.io/v1";
const BATCH: &str = "/apis/batch/v1";

/// `Status` object returned with API errors.
#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// [`ClusterGateway`] talking to a real API server.
#[derive(Debug, Clone)]
pub struct KubeGateway {
    server: String,
    client: Client,
    token: Option<SecretString>,
}

impl KubeGateway {
    /// Creates a gateway for `server` using a preconfigured HTTP client.
    pub fn new(server: impl Into<String>, client: Client) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            client,
            token: None,
        }
    }

    /// Sends `token` as a bearer credential on every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Builds a gateway from a kubeconfig file and optional context override.
    pub fn from_kubeconfig(
        path: &Path,
        context: Option<&str>,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let config = Kubeconfig::load(path)?;
        let resolved = config.resolve(context)?;
        Self::from_context(resolved, timeout)
    }

    /// Builds a gateway from a resolved context.
    pub fn from_context(context: ResolvedContext, timeout: Duration) -> GatewayResult<Self> {
        let client = context.http_client(timeout)?;
        tracing::debug!(context = %context.name, server = %context.server, "using kubeconfig context");
        let mut gateway = Self::new(context.server, client);
        gateway.token = context.token;
        Ok(gateway)
    }

    /// API server URL.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{path}", self.server))
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn post(&self, path: &str, kind: ObjectKind, name: &str, body: &Value) -> GatewayResult<Value> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        decode(response, kind, name).await
    }

    async fn delete(&self, path: &str, kind: ObjectKind, name: &str) -> GatewayResult<()> {
        let response = self
            .request(Method::DELETE, path)
            .json(&serde_json::json!({
                "kind": "DeleteOptions",
                "apiVersion": "v1",
                "propagationPolicy": "Background",
            }))
            .send()
            .await?;
        decode(response, kind, name).await.map(|_| ())
    }
}

/// Maps a response to its JSON body or a typed error.
async fn decode(response: reqwest::Response, kind: ObjectKind, name: &str) -> GatewayResult<Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let body: Status = serde_json::from_str(&text).unwrap_or_else(|_| Status {
        reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        message: text,
    });

    Err(match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound {
            kind,
            name: name.to_string(),
        },
        StatusCode::CONFLICT => GatewayError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Forbidden(body.message),
        _ => GatewayError::Api {
            status: status.as_u16(),
            reason: body.reason,
            message: body.message,
        },
    })
}

fn uid_of(body: &Value) -> GatewayResult<ObjectUid> {
    body["metadata"]["uid"]
        .as_str()
        .map(|uid| ObjectUid(uid.to_string()))
        .ok_or_else(|| GatewayError::MalformedResponse("created object has no metadata.uid".to_string()))
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    fn name(&self) -> &str {
        "kubernetes"
    }

    #[tracing::instrument(skip(self, identity), fields(name = %identity.name, namespace = %identity.scope), err)]
    async fn create_identity(&self, identity: &Identity) -> GatewayResult<ObjectUid> {
        let path = format!("{CORE}/namespaces/{}/serviceaccounts", identity.scope);
        let body = manifests::service_account(identity);
        uid_of(&self.post(&path, ObjectKind::Identity, &identity.name, &body).await?)
    }

    #[tracing::instrument(skip(self, set), fields(name = %set.name), err)]
    async fn create_permission_set(&self, set: &PermissionSet) -> GatewayResult<ObjectUid> {
        let path = format!("{RBAC}/clusterroles");
        let body = manifests::cluster_role(set);
        uid_of(&self.post(&path, ObjectKind::PermissionSet, &set.name, &body).await?)
    }

    #[tracing::instrument(skip(self, binding), fields(name = %binding.name), err)]
    async fn create_binding(&self, binding: &Binding) -> GatewayResult<ObjectUid> {
        let path = format!("{RBAC}/clusterrolebindings");
        let body = manifests::cluster_role_binding(binding);
        uid_of(&self.post(&path, ObjectKind::Binding, &binding.name, &body).await?)
    }

    #[tracing::instrument(skip(self), err)]
    async fn issue_token(
        &self,
        scope: &str,
        identity: &str,
        expiration_seconds: i64,
    ) -> GatewayResult<String> {
        let path = format!("{CORE}/namespaces/{scope}/serviceaccounts/{identity}/token");
        let body = manifests::token_request(expiration_seconds);
        let response = self.post(&path, ObjectKind::Identity, identity, &body).await?;
        response["status"]["token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse("token request returned no token".to_string()))
    }

    #[tracing::instrument(skip(self, unit), fields(name = %unit.name, namespace = %unit.scope), err)]
    async fn create_scheduled_unit(&self, unit: &ScheduledUnitSpec) -> GatewayResult<ObjectUid> {
        let path = format!("{BATCH}/namespaces/{}/jobs", unit.scope);
        let body = manifests::job(unit);
        uid_of(&self.post(&path, ObjectKind::ScheduledUnit, &unit.name, &body).await?)
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_identity(&self, scope: &str, name: &str) -> GatewayResult<()> {
        let path = format!("{CORE}/namespaces/{scope}/serviceaccounts/{name}");
        self.delete(&path, ObjectKind::Identity, name).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_binding(&self, name: &str) -> GatewayResult<()> {
        let path = format!("{RBAC}/clusterrolebindings/{name}");
        self.delete(&path, ObjectKind::Binding, name).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_permission_set(&self, name: &str) -> GatewayResult<()> {
        let path = format!("{RBAC}/clusterroles/{name}");
        self.delete(&path, ObjectKind::PermissionSet, name).await
    }
}
