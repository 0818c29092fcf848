//! CLI structure and argument parsing

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::commands::Commands;

/// Issue short-lived, self-revoking Kubernetes credentials
#[derive(Debug, Parser)]
#[command(name = "kube-temp-access")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Commands
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Log filter matching the verbosity flag.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
