//! `create`: provision temporary access in one or more namespaces.
//!
//! ```bash
//! kube-temp-access create -n team-a,team-b -r pods,deployments -e 1h
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use secrecy::ExposeSecret;
use serde::Serialize;
use temp_access::{
    format_duration, AccessConfig, ClusterGateway, CredentialProvisioner, KubeGateway,
    Kubeconfig, MemoryGateway, ProvisionerConfig, ScopeOutcome,
};

use crate::{output, CliError, Result};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Table,
    /// One JSON document with every scope
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    /// Path to the kubeconfig file (default: $KUBECONFIG or ~/.kube/config)
    #[arg(short, long)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespaces to grant access in, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "default")]
    pub namespace: Vec<String>,

    /// Resource kinds to grant read access to, comma separated ("view" uses the built-in role)
    #[arg(short, long, value_delimiter = ',', default_value = "view")]
    pub resources: Vec<String>,

    /// Lifetime of the access, e.g. "15m", "1h", "1h30m" (default from config: 15m)
    #[arg(short, long)]
    pub expiration: Option<String>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Provision against an in-memory cluster instead of a real one
    #[arg(long)]
    pub dry_run: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}

/// Machine-readable result for one namespace.
#[derive(Debug, Serialize)]
pub struct GrantReport {
    pub namespace: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub leaked: Vec<String>,
}

impl From<&ScopeOutcome> for GrantReport {
    fn from(outcome: &ScopeOutcome) -> Self {
        let mut report = GrantReport {
            namespace: outcome.scope.clone(),
            status: "failed",
            service_account: None,
            role: None,
            token: None,
            ttl_seconds: None,
            expires_at: None,
            cleanup_job: None,
            failed_step: None,
            error: None,
            leaked: Vec::new(),
        };
        match &outcome.result {
            Ok(grant) => {
                report.status = "granted";
                report.service_account = Some(grant.names.identity.clone());
                report.role = Some(grant.role_name().to_string());
                report.token = Some(grant.token.expose_secret().clone());
                report.ttl_seconds = Some(grant.ttl.num_seconds());
                report.expires_at = Some(grant.expires_at);
                report.cleanup_job = Some(grant.names.scheduled_unit.clone());
            }
            Err(err) => {
                report.failed_step = Some(err.step().to_string());
                report.error = Some(output::error_chain(err));
                report.leaked = err.leaked().iter().map(ToString::to_string).collect();
            }
        }
        report
    }
}

pub async fn execute(args: CreateArgs, mut config: AccessConfig) -> Result<ExitCode> {
    if args.namespace.iter().all(|n| n.trim().is_empty()) {
        return Err(CliError::InvalidArgument("no namespace given".to_string()));
    }
    if args.kubeconfig.is_some() {
        config.kubeconfig = args.kubeconfig.clone();
    }
    if args.context.is_some() {
        config.context = args.context.clone();
    }

    let gateway = gateway(&args, &config)?;
    let provisioner = CredentialProvisioner::new(gateway, ProvisionerConfig::from(&config));

    let expiration = args
        .expiration
        .clone()
        .unwrap_or_else(|| config.default_expiration.clone());
    let namespaces: Vec<String> = args
        .namespace
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();

    if args.output == OutputFormat::Table {
        output::info(&format!(
            "Granting {} access in {} for {expiration}...",
            args.resources.join(","),
            namespaces.join(", ")
        ));
    }

    let outcomes = provisioner
        .create_temporary_access(&namespaces, &args.resources, &expiration)
        .await;

    match args.output {
        OutputFormat::Table => print_table(&outcomes),
        OutputFormat::Json => print_json(&outcomes)?,
    }
    if args.dry_run {
        output::warn("Dry run: nothing was created in a real cluster");
    }

    if outcomes.iter().all(ScopeOutcome::is_ok) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn gateway(args: &CreateArgs, config: &AccessConfig) -> Result<Arc<dyn ClusterGateway>> {
    if args.dry_run {
        return Ok(Arc::new(MemoryGateway::new()));
    }

    let path = config
        .kubeconfig
        .clone()
        .or_else(Kubeconfig::default_path)
        .ok_or(CliError::NoKubeconfig)?;
    tracing::debug!(path = %path.display(), "loading kubeconfig");

    let gateway = KubeGateway::from_kubeconfig(
        &path,
        config.context.as_deref(),
        config.request_timeout(),
    )?;
    Ok(Arc::new(gateway))
}

fn print_table(outcomes: &[ScopeOutcome]) {
    for outcome in outcomes {
        output::namespace_header(&outcome.scope);
        match &outcome.result {
            Ok(grant) => {
                output::granted(&outcome.scope);
                output::field("Service account", &grant.names.identity);
                output::field("Role", grant.role_name());
                output::field(
                    "Expires",
                    &format!(
                        "{} (in {})",
                        grant.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        format_duration(grant.ttl)
                    ),
                );
                output::field("Cleanup job", &grant.names.scheduled_unit);
                output::token(grant.token.expose_secret());
            }
            Err(err) => {
                output::failed(&outcome.scope, err);
                if !err.leaked().is_empty() {
                    output::warn("These objects were left behind and must be deleted by hand:");
                    for object in err.leaked() {
                        output::leaked(&object.to_string());
                    }
                }
            }
        }
    }
}

fn print_json(outcomes: &[ScopeOutcome]) -> Result<()> {
    let reports: Vec<GrantReport> = outcomes.iter().map(GrantReport::from).collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
