//! Error types for the CLI

use temp_access::{ConfigError, GatewayError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error")]
    Config(#[from] ConfigError),

    #[error("Cluster connection error")]
    Gateway(#[from] GatewayError),

    #[error("No kubeconfig found; pass --kubeconfig or set KUBECONFIG")]
    NoKubeconfig,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Serialization(err.to_string())
    }
}
