//! Command implementations

pub mod create;

use std::process::ExitCode;

use clap::Subcommand;
use temp_access::AccessConfig;

use crate::Result;

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Create temporary access in one or more namespaces
    Create(create::CreateArgs),
}

impl Commands {
    pub async fn execute(self, config: AccessConfig) -> Result<ExitCode> {
        match self {
            Commands::Create(args) => create::execute(args, config).await,
        }
    }
}
