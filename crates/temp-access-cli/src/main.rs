//! kube-temp-access: short-lived, self-revoking Kubernetes credentials

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use temp_access::AccessConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use temp_access_cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AccessConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    Ok(cli.command.execute(config).await?)
}
