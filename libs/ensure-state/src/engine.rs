//! Single-shot convergence.
//!
//! One run observes one machine and applies at most one action:
//!
//! 1. open the backend named by the selector
//! 2. resolve the machine
//! 3. read its state
//! 4. look the state up in the desired map; no entry means nothing to do
//! 5. reject the action if the backend's transition table forbids it
//! 6. apply it once
//!
//! Failures are returned immediately. Nothing is retried or rolled back;
//! running the tool again is the retry.

use tracing::{info, info_span};
use virtuoso_reconcile::SettlePolicy;

use crate::backend::{Backend, BackendContext, BackendRegistry};
use crate::error::{Error, Result};
use crate::types::{Action, DisplayMode, StateActionMap, VmState};
use crate::vm::VirtualMachine;

/// Input for one convergence run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergeRequest {
    /// Backend selector token.
    pub backend: String,
    /// Machine name or UUID.
    pub machine: String,
    /// Action to take for each observed state.
    pub desired: StateActionMap,
    /// Display front-end, used only when starting.
    pub display_mode: Option<DisplayMode>,
}

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No action is declared for the observed state.
    Unchanged { machine: String, state: VmState },
    /// `action` was applied to a machine observed in `from`.
    Transitioned {
        machine: String,
        action: Action,
        from: VmState,
    },
}

impl Outcome {
    pub fn changed(&self) -> bool {
        matches!(self, Outcome::Transitioned { .. })
    }
}

/// Runs convergence against backends from a registry.
#[derive(Debug)]
pub struct Engine {
    registry: BackendRegistry,
    settle: SettlePolicy,
}

impl Engine {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            settle: SettlePolicy::default(),
        }
    }

    /// Settle window handed to every backend this engine opens.
    pub fn with_settle(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Converge one machine. The backend lives only for this call.
    pub fn converge(&self, request: &ConvergeRequest) -> Result<Outcome> {
        let span = info_span!(
            "converge",
            backend = %request.backend,
            vm = %request.machine
        );
        let _enter = span.enter();

        let ctx = BackendContext {
            settle: self.settle,
            span: span.clone(),
        };
        let backend = self.registry.open(&request.backend, &ctx)?;

        converge_vm(
            backend.as_ref(),
            &request.machine,
            &request.desired,
            request.display_mode,
        )
    }
}

/// Converge a machine on an already constructed backend.
pub fn converge_vm(
    backend: &dyn Backend,
    machine: &str,
    desired: &StateActionMap,
    display_mode: Option<DisplayMode>,
) -> Result<Outcome> {
    let vm = VirtualMachine::find(machine, backend)?.with_display_mode(display_mode);
    let name = vm.name()?;
    let state = vm.state()?;

    let Some(action) = desired.get(state) else {
        info!(vm = %name, state = %state, "No action declared for current state");
        return Ok(Outcome::Unchanged {
            machine: name,
            state,
        });
    };

    if !backend.can_transition(state, action) {
        return Err(Error::InvalidState {
            vm: name,
            action,
            state,
        });
    }

    info!(vm = %name, state = %state, action = %action, "Applying action");
    vm.set_state(action).map_err(|e| e.for_vm(&name))?;
    info!(vm = %name, action = %action, "Action applied");

    Ok(Outcome::Transitioned {
        machine: name,
        action,
        from: state,
    })
}
