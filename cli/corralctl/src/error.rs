//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Unknown backend '{0}'.")]
    UnknownBackend(String),

    #[error("No environment named '{0}' exists.")]
    NoEnvironment(String),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    // Check for specific error types and provide hints
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::UnknownBackend(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Valid backends are `mock` and `virsh`.".yellow()
                );
            }
            CliError::NoEnvironment(_) => {
                eprintln!("\n{}", "Hint: Run `corral up` to build it.".yellow());
            }
        }
    }
}
