//! Terminal output for grant results

use std::error::Error;

use colored::Colorize;
use console::{style, Emoji};

static INFO: Emoji = Emoji("ℹ️ ", "");
static GRANTED: Emoji = Emoji("🔓", "+");
static WARNING: Emoji = Emoji("⚠️ ", "!");
static FAILED: Emoji = Emoji("❌", "x");
static LEAKED: Emoji = Emoji("🧹", "-");

/// Print a progress message
pub fn info(message: &str) {
    println!("{} {}", style(INFO).blue(), message);
}

/// Print the line announcing a granted namespace
pub fn granted(namespace: &str) {
    println!(
        "{} {}",
        style(GRANTED).green(),
        format!("Temporary access granted in {namespace}").green()
    );
}

/// Print a warning to stderr
pub fn warn(message: &str) {
    eprintln!("{} {}", style(WARNING).yellow(), message.yellow());
}

/// Print a failed namespace to stderr, followed by every cause in the error chain
pub fn failed(namespace: &str, err: &dyn Error) {
    eprintln!(
        "{} {}",
        style(FAILED).red(),
        format!("{namespace}: {}", error_chain(err)).red()
    );
}

/// Print a section header for one namespace
pub fn namespace_header(namespace: &str) {
    println!("\n{}\n", format!("Namespace {namespace}").bold().underline());
}

/// Print an aligned field of a grant
pub fn field(key: &str, value: &str) {
    println!("  {:<16}{}", format!("{key}:").bold(), value);
}

/// Print the bearer token on a line of its own so it can be copied or piped
pub fn token(token: &str) {
    println!("  {}", "Token:".bold());
    println!("{token}");
}

/// Print an object that must be deleted by hand
pub fn leaked(object: &str) {
    eprintln!("  {} {}", style(LEAKED).yellow(), object);
}

/// Joins an error and its sources with ": "
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_access::{AccessError, GatewayError};

    #[test]
    fn test_output_functions() {
        info("Granting view access");
        granted("default");
        warn("Dry run");
        namespace_header("default");
        field("Role", "view");
        token("eyJhbGciOi");
        leaked("serviceaccount default/temp-sa-1");
        failed("default", &GatewayError::Forbidden("no".to_string()));
    }

    #[test]
    fn test_error_chain_lists_each_cause_once() {
        let err = AccessError::TokenIssuanceFailed {
            scope: "default".to_string(),
            identity: "temp-sa-1".to_string(),
            source: GatewayError::Forbidden("tokens denied".to_string()),
        };
        let chain = error_chain(&err);
        assert_eq!(chain.matches("tokens denied").count(), 1);
        assert!(chain.starts_with("getting token for service account temp-sa-1"));
        assert!(chain.ends_with("Forbidden: tokens denied"));
    }
}
