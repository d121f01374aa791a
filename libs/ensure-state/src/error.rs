//! Error taxonomy for convergence runs.

use thiserror::Error;

use crate::types::{Action, VmState};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that terminate a convergence run.
///
/// The first five variants are domain outcomes an operator can act on.
/// `Unsupported` marks a configuration or programming defect, while
/// `Hypervisor` and `Io` carry unexpected backend failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend selector does not name a registered backend.
    #[error(
        "specified backend ({selector}) is not a registered backend (registered: {})",
        .registered.join(", ")
    )]
    InvalidVmBackend {
        selector: String,
        registered: Vec<String>,
    },

    /// The backend could not confirm its host integration is usable.
    #[error("{backend} backend is unavailable: {detail}")]
    BackendUnavailable { backend: &'static str, detail: String },

    /// The name or UUID did not resolve to a machine.
    #[error("virtual machine '{vm}' was not found by the {backend} backend")]
    VmNotFound { backend: &'static str, vm: String },

    /// The action is not legal from the observed state.
    #[error("cannot {action} virtual machine '{vm}' while it is {state}")]
    InvalidState {
        vm: String,
        action: Action,
        state: VmState,
    },

    /// The backend attempted the transition but the target state was not observed.
    #[error(
        "failed to {action} virtual machine '{vm}': expected {expected}, observed {observed}{}",
        detail_suffix(.detail)
    )]
    StateTransition {
        vm: String,
        action: Action,
        expected: VmState,
        observed: VmState,
        detail: Option<String>,
    },

    /// The backend was asked for something it cannot do at all.
    #[error("{backend} backend does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    /// Unexpected failure inside a backend.
    #[error("{backend} backend failure: {message}")]
    Hypervisor {
        backend: &'static str,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(" ({detail})"),
        None => String::new(),
    }
}

impl Error {
    /// Create a backend failure from any displayable cause.
    pub fn hypervisor(backend: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Hypervisor {
            backend,
            message: message.to_string(),
        }
    }

    /// Name the machine in state errors by `name` instead of a backend key.
    pub fn for_vm(self, name: &str) -> Self {
        match self {
            Error::InvalidState { action, state, .. } => Error::InvalidState {
                vm: name.to_string(),
                action,
                state,
            },
            Error::StateTransition {
                action,
                expected,
                observed,
                detail,
                ..
            } => Error::StateTransition {
                vm: name.to_string(),
                action,
                expected,
                observed,
                detail,
            },
            other => other,
        }
    }

    /// Stable reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::InvalidVmBackend { .. } => "invalid_vm_backend",
            Error::BackendUnavailable { .. } => "backend_unavailable",
            Error::VmNotFound { .. } => "vm_not_found",
            Error::InvalidState { .. } => "invalid_state",
            Error::StateTransition { .. } => "state_transition_failed",
            Error::Unsupported { .. } => "unsupported_operation",
            Error::Hypervisor { .. } => "hypervisor_error",
            Error::Io(_) => "io_error",
        }
    }

    /// Returns true for the five expected domain outcomes.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::InvalidVmBackend { .. }
                | Error::BackendUnavailable { .. }
                | Error::VmNotFound { .. }
                | Error::InvalidState { .. }
                | Error::StateTransition { .. }
        )
    }
}
