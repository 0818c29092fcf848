//! Configuration loading.
//!
//! Files are parsed by extension (`.toml`, `.yaml`/`.yml`, `.json`) into a
//! JSON tree, overlaid with `PREFIX__FIELD` environment variables, and only
//! then deserialized into the target type. Nested fields use further `__`
//! separators (`PREFIX__SECTION__FIELD`).

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cleanup::{DEFAULT_CLEANUP_IMAGE, DEFAULT_RETENTION_SECS};
use crate::error::ConfigError;

/// Environment prefix for [`AccessConfig`] overrides.
pub const ENV_PREFIX: &str = "KUBE_TEMP_ACCESS";

/// Shortest token lifetime the API server accepts.
pub const DEFAULT_MIN_TTL_SECS: i64 = 600;

/// Longest token lifetime the API server accepts.
pub const DEFAULT_MAX_TTL_SECS: i64 = 1 << 32;

/// Expiration used when the caller gives none.
pub const DEFAULT_EXPIRATION: &str = "15m";

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Settings shared by the library and the command line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Kubeconfig file; `$KUBECONFIG` or `~/.kube/config` when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the current context when unset.
    pub context: Option<String>,
    /// Image for the deletion job.
    pub cleanup_image: String,
    /// Seconds a finished deletion job is kept.
    pub cleanup_retention_secs: i64,
    /// Shortest accepted time-to-live in seconds.
    pub min_ttl_secs: i64,
    /// Longest accepted time-to-live in seconds.
    pub max_ttl_secs: i64,
    /// Delete already-created objects when a later step fails.
    pub rollback_on_failure: bool,
    /// HTTP timeout for API server requests.
    pub request_timeout_secs: u64,
    /// Expiration used when none is given.
    pub default_expiration: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            cleanup_image: DEFAULT_CLEANUP_IMAGE.to_string(),
            cleanup_retention_secs: DEFAULT_RETENTION_SECS,
            min_ttl_secs: DEFAULT_MIN_TTL_SECS,
            max_ttl_secs: DEFAULT_MAX_TTL_SECS,
            rollback_on_failure: true,
            request_timeout_secs: 30,
            default_expiration: DEFAULT_EXPIRATION.to_string(),
        }
    }
}

impl AccessConfig {
    /// Default config file: `<config dir>/kube-temp-access/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kube-temp-access").join("config.toml"))
    }

    /// Loads `path`, or the default file if it exists, then applies environment overrides.
    ///
    /// An explicitly given path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        match file {
            Some(file) => load_with_env(&file, ENV_PREFIX),
            None => from_env(ENV_PREFIX),
        }
    }

    /// Retention window as a duration.
    #[must_use]
    pub fn cleanup_retention(&self) -> Duration {
        Duration::seconds(self.cleanup_retention_secs.max(0))
    }

    /// Minimum time-to-live as a duration.
    #[must_use]
    pub fn min_ttl(&self) -> Duration {
        Duration::seconds(self.min_ttl_secs.max(0))
    }

    /// Maximum time-to-live as a duration, capped at the API server ceiling.
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        Duration::seconds(self.max_ttl_secs.clamp(0, DEFAULT_MAX_TTL_SECS))
    }

    /// HTTP timeout.
    #[must_use]
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Loads a configuration file, choosing the parser by extension.
pub fn load_from_file<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let tree = read_tree(path)?;
    deserialize(tree, &path.display().to_string())
}

/// Loads a configuration file and overlays `PREFIX__FIELD` environment variables.
pub fn load_with_env<T: DeserializeOwned>(path: &Path, prefix: &str) -> ConfigResult<T> {
    let mut tree = read_tree(path)?;
    apply_env(&mut tree, prefix, std::env::vars());
    deserialize(tree, &path.display().to_string())
}

/// Builds a configuration from defaults and environment variables only.
pub fn from_env<T: DeserializeOwned>(prefix: &str) -> ConfigResult<T> {
    let mut tree = Value::Object(Map::new());
    apply_env(&mut tree, prefix, std::env::vars());
    deserialize(tree, "<env>")
}

fn read_tree(path: &Path) -> ConfigResult<Value> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parse_error = |reason: String| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    };

    match extension.as_str() {
        "toml" => {
            let value: toml::Value = toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
            serde_json::to_value(value).map_err(|e| parse_error(e.to_string()))
        }
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string())),
        "json" => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

fn deserialize<T: DeserializeOwned>(tree: Value, origin: &str) -> ConfigResult<T> {
    serde_json::from_value(tree).map_err(|e| ConfigError::Parse {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

/// Overlays matching variables onto `tree`. Keys are lowercased.
fn apply_env(tree: &mut Value, prefix: &str, vars: impl Iterator<Item = (String, String)>) {
    let marker = format!("{}__", prefix.to_ascii_uppercase());
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(&marker) else {
            continue;
        };
        let path: Vec<String> = rest
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        if !path.is_empty() {
            set_path(tree, &path, coerce(&raw));
        }
    }
}

fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let mut node = tree;
    for segment in &path[..path.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let (Value::Object(map), Some(last)) = (node, path.last()) {
        map.insert(last.clone(), value);
    }
}

fn coerce(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    Value::String(raw.to_string())
}
