//! Command-line front end for temporary Kubernetes access.

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::Cli;
pub use commands::Commands;
pub use error::{CliError, Result};
