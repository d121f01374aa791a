//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;
use virtuoso_ensure_state::Error as EngineError;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No machine given. Pass --machine or set `machine` in the config file.")]
    MissingMachine,

    #[error("Invalid state/action pair '{pair}': {reason}")]
    InvalidPair { pair: String, reason: String },
}

/// Hint shown below an error, if one applies.
fn hint(err: &anyhow::Error) -> Option<String> {
    if let Some(CliError::MissingMachine) = err.downcast_ref::<CliError>() {
        return Some("Hint: Run `ensure-state --help` for usage.".to_string());
    }

    match err.downcast_ref::<EngineError>()? {
        EngineError::InvalidVmBackend { .. } => {
            Some("Hint: Choose one of the registered backends with --backend.".to_string())
        }
        EngineError::BackendUnavailable { backend, .. } => Some(format!(
            "Hint: Check that the {backend} tools are installed and on PATH, or set their path in the config file."
        )),
        EngineError::VmNotFound { .. } => {
            Some("Hint: Machines can be addressed by name or UUID.".to_string())
        }
        EngineError::InvalidState { .. } => Some(
            "Hint: Run `ensure-state --list-actions` to see valid actions; the machine may have been changed by someone else."
                .to_string(),
        ),
        EngineError::StateTransition { .. } => Some(
            "Hint: Increase --settle-timeout-ms if the hypervisor is slow to report the new state."
                .to_string(),
        ),
        _ => None,
    }
}

/// Print an error in a user-friendly format.
///
/// With `verbose`, the full diagnostic chain is printed as well.
pub fn print_error(err: &anyhow::Error, verbose: bool) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        if !engine_err.is_domain() {
            eprintln!("Reason: {}", engine_err.reason_code());
        }
    }

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", hint.yellow());
    }

    if verbose {
        eprintln!("\n{:?}", err);
    }
}
