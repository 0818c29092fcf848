//! Kubeconfig loading and context resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};

/// Environment variable naming the kubeconfig file.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Parsed kubeconfig file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Context used when none is requested.
    #[serde(default)]
    pub current_context: Option<String>,
    /// Named clusters.
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Named contexts.
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Named users.
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Directory the file was read from; relative paths resolve against it.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// `clusters[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    /// Entry name.
    pub name: String,
    /// Connection details.
    pub cluster: ClusterEntry,
}

/// Cluster connection details.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL.
    pub server: String,
    /// CA bundle file.
    #[serde(default)]
    pub certificate_authority: Option<String>,
    /// Inline base64 CA bundle.
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// `contexts[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    /// Entry name.
    pub name: String,
    /// Cluster and user references.
    pub context: ContextEntry,
}

/// Context: which cluster, as which user.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name.
    pub cluster: String,
    /// User entry name.
    pub user: String,
    /// Default namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// `users[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    /// Entry name.
    pub name: String,
    /// Credentials.
    #[serde(default)]
    pub user: UserEntry,
}

/// User credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// File holding a bearer token.
    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<String>,
    /// Client certificate file.
    #[serde(default)]
    pub client_certificate: Option<String>,
    /// Inline base64 client certificate.
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    /// Client key file.
    #[serde(default)]
    pub client_key: Option<String>,
    /// Inline base64 client key.
    #[serde(default)]
    pub client_key_data: Option<String>,
}

/// Everything needed to open a connection for one context.
#[derive(Debug)]
pub struct ResolvedContext {
    /// Context name.
    pub name: String,
    /// API server URL without trailing slash.
    pub server: String,
    /// PEM CA bundle.
    pub ca_pem: Option<Vec<u8>>,
    /// Skip server certificate verification.
    pub insecure: bool,
    /// Bearer token.
    pub token: Option<SecretString>,
    /// PEM client certificate followed by its key.
    pub identity_pem: Option<Vec<u8>>,
}

impl ResolvedContext {
    /// Builds an HTTP client for this context.
    pub fn http_client(&self, timeout: Duration) -> GatewayResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.insecure);

        if let Some(pem) = &self.ca_pem {
            let ca = reqwest::Certificate::from_pem(pem)
                .map_err(|e| GatewayError::Kubeconfig(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem).map_err(|e| {
                GatewayError::Kubeconfig(format!("invalid client certificate: {e}"))
            })?;
            builder = builder.identity(identity);
        }

        Ok(builder.build()?)
    }
}

impl Kubeconfig {
    /// Default kubeconfig location: `$KUBECONFIG` (first entry), else `~/.kube/config`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        if let Some(paths) = std::env::var_os(KUBECONFIG_ENV) {
            if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
                return Some(first);
            }
        }
        dirs::home_dir().map(|home| home.join(".kube").join("config"))
    }

    /// Reads and parses a kubeconfig file.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Kubeconfig(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parses kubeconfig YAML; relative paths resolve against the working directory.
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::Kubeconfig(format!("failed to parse kubeconfig: {e}")))
    }

    /// Resolves `context`, or the current context when `None`.
    pub fn resolve(&self, context: Option<&str>) -> GatewayResult<ResolvedContext> {
        let name = context
            .map(ToString::to_string)
            .or_else(|| self.current_context.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| GatewayError::Kubeconfig("no context selected".to_string()))?;

        let context = self
            .contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
            .ok_or_else(|| GatewayError::Kubeconfig(format!("context {name:?} not found")))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                GatewayError::Kubeconfig(format!("cluster {:?} not found", context.cluster))
            })?;

        let user = self
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| u.user.clone())
            .unwrap_or_default();

        if cluster.server.is_empty() {
            return Err(GatewayError::Kubeconfig(format!(
                "cluster {:?} has no server",
                context.cluster
            )));
        }

        let ca_pem = self.material(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
        )?;

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(file)) => {
                let raw = self.read_file(file)?;
                Some(String::from_utf8_lossy(&raw).trim().to_string())
            }
            (None, None) => None,
        };

        let cert = self.material(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
        )?;
        let key = self.material(user.client_key_data.as_deref(), user.client_key.as_deref())?;
        let identity_pem = match (cert, key) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            (None, None) => None,
            _ => {
                return Err(GatewayError::Kubeconfig(
                    "client certificate and key must be given together".to_string(),
                ))
            }
        };

        Ok(ResolvedContext {
            name,
            server: cluster.server.trim_end_matches('/').to_string(),
            ca_pem,
            insecure: cluster.insecure_skip_tls_verify,
            token: token.map(SecretString::new),
            identity_pem,
        })
    }

    /// Inline base64 data wins over a file path.
    fn material(&self, data: Option<&str>, file: Option<&str>) -> GatewayResult<Option<Vec<u8>>> {
        if let Some(data) = data {
            let decoded = STANDARD
                .decode(data.trim())
                .map_err(|e| GatewayError::Kubeconfig(format!("invalid base64 data: {e}")))?;
            return Ok(Some(decoded));
        }
        file.map(|f| self.read_file(f)).transpose()
    }

    fn read_file(&self, file: &str) -> GatewayResult<Vec<u8>> {
        let path = Path::new(file);
        let path = match (&self.base_dir, path.is_relative()) {
            (Some(base), true) => base.join(path),
            _ => path.to_path_buf(),
        };
        std::fs::read(&path).map_err(|e| {
            GatewayError::Kubeconfig(format!("failed to read {}: {e}", path.display()))
        })
    }
}
