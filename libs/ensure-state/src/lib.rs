//! Converge a virtual machine to a declared runtime state.
//!
//! A run observes one machine through a hypervisor backend, looks the
//! observed state up in a caller supplied [`StateActionMap`] and applies at
//! most one action. Whether an action is legal is decided by the backend's
//! static [`TransitionTable`] before any hypervisor call is made.
//!
//! ```no_run
//! use virtuoso_ensure_state::{converge, Action, ConvergeRequest, StateActionMap, VmState};
//!
//! let desired: StateActionMap = [(VmState::PoweredOff, Action::Start)].into_iter().collect();
//! let outcome = converge(&ConvergeRequest {
//!     backend: "virtualbox".to_string(),
//!     machine: "build-agent".to_string(),
//!     desired,
//!     display_mode: None,
//! })?;
//! println!("{outcome:?}");
//! # Ok::<(), virtuoso_ensure_state::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`types`]: states, actions, display modes and the desired map
//! - [`transition`]: per-backend transition tables
//! - [`backend`]: the driver contract, registry and drivers
//! - [`vm`]: resolved machine handle
//! - [`engine`]: the convergence run
//! - [`error`]: error taxonomy

pub mod backend;
pub mod engine;
pub mod error;
pub mod transition;
pub mod types;
pub mod vm;

pub use backend::{Backend, BackendContext, BackendRegistry, DriverConfig, VmRef};
pub use engine::{converge_vm, ConvergeRequest, Engine, Outcome};
pub use error::{Error, Result};
pub use transition::TransitionTable;
pub use types::{Action, ActionOptions, Completion, DisplayMode, ParseError, StateActionMap, VmState};
pub use virtuoso_reconcile::SettlePolicy;
pub use vm::VirtualMachine;

/// Converge using the built-in drivers with default settings.
pub fn converge(request: &ConvergeRequest) -> Result<Outcome> {
    Engine::new(BackendRegistry::builtin(DriverConfig::default())).converge(request)
}
