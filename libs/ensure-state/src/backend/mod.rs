//! Hypervisor backend contract.
//!
//! A backend is bound to one hypervisor technology and exposes machine
//! lookup, state reads and state changes. Backends are selected by a
//! token through the [`BackendRegistry`]; each run constructs its own
//! instance and drops it at the end.
//!
//! ## Drivers
//!
//! - `virtualbox`: drives `VBoxManage`
//! - `firecracker`: talks to running Firecracker VMMs over their API sockets
//! - `mock`: in-memory backend for tests (not registered by default)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn, Span};
use virtuoso_reconcile::SettlePolicy;

use crate::error::{Error, Result};
use crate::transition::TransitionTable;
use crate::types::{Action, ActionOptions, Completion, VmState};

pub mod command;
pub mod firecracker;
pub mod mock;
pub mod virtualbox;

pub use firecracker::{Firecracker, FirecrackerConfig};
pub use mock::{MockBackend, MockTransition, MockVm};
pub use virtualbox::{VirtualBox, VirtualBoxConfig};

/// Opaque, backend-owned reference to one machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmRef(String);

impl VmRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The backend's key for this machine.
    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collaborators injected into a backend at construction.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Settle window used to confirm asynchronous transitions.
    pub settle: SettlePolicy,

    /// Span the backend logs under.
    pub span: Span,
}

impl Default for BackendContext {
    fn default() -> Self {
        Self {
            settle: SettlePolicy::default(),
            span: Span::none(),
        }
    }
}

/// Capabilities every hypervisor driver provides.
pub trait Backend: fmt::Debug {
    /// Short driver name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Resolve a name or UUID; `None` if no such machine exists.
    fn find(&self, name_or_uuid: &str) -> Result<Option<VmRef>>;

    /// Human readable name, if the backend has one.
    fn vm_name(&self, vm: &VmRef) -> Result<Option<String>>;

    /// Unique identifier. Uniqueness scope is up to the backend.
    fn vm_uuid(&self, vm: &VmRef) -> Result<String>;

    /// Current state, always read from the hypervisor.
    fn vm_state(&self, vm: &VmRef) -> Result<VmState>;

    /// Apply `action`. Fails with [`Error::InvalidState`] if the action is
    /// illegal from the current state and with [`Error::StateTransition`]
    /// if the target state is not observed.
    fn set_vm_state(&self, vm: &VmRef, action: Action, options: &ActionOptions) -> Result<()>;

    /// The driver's static transition table.
    fn transitions(&self) -> &TransitionTable;

    fn can_transition(&self, state: VmState, action: Action) -> bool {
        self.transitions().can_transition(state, action)
    }

    /// How this driver confirms `action`.
    fn completion(&self, action: Action) -> Completion {
        action.completion()
    }
}

/// Read the current state and reject `action` if it is not legal from it.
pub fn ensure_transition(backend: &dyn Backend, vm: &VmRef, action: Action) -> Result<VmState> {
    let state = backend.vm_state(vm)?;
    if !backend.can_transition(state, action) {
        return Err(Error::InvalidState {
            vm: vm.to_string(),
            action,
            state,
        });
    }
    Ok(state)
}

/// Confirm that `action` took effect according to its completion policy.
pub fn await_completion(
    backend: &dyn Backend,
    vm: &VmRef,
    action: Action,
    settle: &SettlePolicy,
) -> Result<()> {
    let target = match backend.completion(action) {
        Completion::Trusted => return Ok(()),
        Completion::FireAndForget => {
            debug!(vm = %vm, action = %action, "Request delivered; completion is up to the guest");
            return Ok(());
        }
        Completion::Settle(target) => target,
    };

    let mut observed = None;
    let outcome = settle.wait_until(|| {
        let state = backend.vm_state(vm)?;
        observed = Some(state);
        Ok::<_, Error>(state == target)
    })?;

    if outcome.is_reached() {
        debug!(
            vm = %vm,
            state = %target,
            attempts = outcome.attempts(),
            "Transition settled"
        );
        return Ok(());
    }

    let observed = match observed {
        Some(state) => state,
        None => backend.vm_state(vm)?,
    };
    warn!(
        vm = %vm,
        expected = %target,
        observed = %observed,
        elapsed_ms = outcome.elapsed().as_millis() as u64,
        "Transition did not settle"
    );
    Err(Error::StateTransition {
        vm: vm.to_string(),
        action,
        expected: target,
        observed,
        detail: Some(format!(
            "not observed within {}ms",
            outcome.elapsed().as_millis()
        )),
    })
}

/// Validate, issue and confirm a transition.
///
/// `request` performs the hypervisor call itself.
pub fn apply_transition<F>(
    backend: &dyn Backend,
    vm: &VmRef,
    action: Action,
    settle: &SettlePolicy,
    request: F,
) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let from = ensure_transition(backend, vm, action)?;
    debug!(vm = %vm, state = %from, action = %action, "Issuing transition");
    request()?;
    await_completion(backend, vm, action, settle)
}

/// Turn a rejected hypervisor request into the matching error.
///
/// Actions with an observable target report the state the machine was
/// left in; cooperative actions only have the backend's message.
pub fn request_failure(backend: &dyn Backend, vm: &VmRef, action: Action, detail: String) -> Error {
    let Some(expected) = action.target_state() else {
        return Error::hypervisor(backend.kind(), format!("{action} request failed: {detail}"));
    };

    match backend.vm_state(vm) {
        Ok(observed) => Error::StateTransition {
            vm: vm.to_string(),
            action,
            expected,
            observed,
            detail: Some(detail),
        },
        Err(err) => Error::hypervisor(
            backend.kind(),
            format!("{action} request failed: {detail}; state unreadable: {err}"),
        ),
    }
}

/// Driver settings for the built-in backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub virtualbox: VirtualBoxConfig,

    #[serde(default)]
    pub firecracker: FirecrackerConfig,
}

type Factory = Box<dyn Fn(&BackendContext) -> Result<Box<dyn Backend>>>;

/// Maps selector tokens to backend constructors.
pub struct BackendRegistry {
    factories: BTreeMap<String, Factory>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the `virtualbox` and `firecracker` drivers.
    pub fn builtin(config: DriverConfig) -> Self {
        let mut registry = Self::new();

        let vbox_config = config.virtualbox;
        registry.register(virtualbox::NAME, move |ctx| {
            Ok(Box::new(VirtualBox::new(vbox_config.clone(), ctx.clone())?) as Box<dyn Backend>)
        });

        let fc_config = config.firecracker;
        registry.register(firecracker::NAME, move |ctx| {
            Ok(Box::new(Firecracker::new(fc_config.clone(), ctx.clone())?) as Box<dyn Backend>)
        });

        registry
    }

    /// Register (or replace) a backend under `name`. Names are case-insensitive.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendContext) -> Result<Box<dyn Backend>> + 'static,
    {
        self.factories
            .insert(name.into().to_lowercase(), Box::new(factory));
    }

    /// Registered selector tokens, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, selector: &str) -> bool {
        self.factories.contains_key(&selector.to_lowercase())
    }

    /// Construct the backend named by `selector`.
    ///
    /// Unknown selectors fail before anything is constructed.
    pub fn open(&self, selector: &str, ctx: &BackendContext) -> Result<Box<dyn Backend>> {
        let Some(factory) = self.factories.get(&selector.to_lowercase()) else {
            return Err(Error::InvalidVmBackend {
                selector: selector.to_string(),
                registered: self.names(),
            });
        };

        debug!(backend = selector, "Constructing backend");
        let backend = factory(ctx)?;
        debug!(backend = backend.kind(), "Backend ready");
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_names() {
        let registry = BackendRegistry::builtin(DriverConfig::default());

        assert_eq!(registry.names(), vec!["firecracker", "virtualbox"]);
        assert!(registry.contains("VirtualBox"));
        assert!(!registry.contains("xen"));
    }

    #[test]
    fn test_unknown_selector_rejected() {
        let registry = BackendRegistry::builtin(DriverConfig::default());
        let err = registry.open("xen", &BackendContext::default()).unwrap_err();

        match err {
            Error::InvalidVmBackend {
                selector,
                registered,
            } => {
                assert_eq!(selector, "xen");
                assert_eq!(registered, vec!["firecracker", "virtualbox"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_register_replaces_and_lowercases() {
        let mut registry = BackendRegistry::new();
        let mock = MockBackend::new();
        registry.register("Mock", mock.factory());

        assert_eq!(registry.names(), vec!["mock"]);
        let backend = registry.open("MOCK", &BackendContext::default()).unwrap();
        assert_eq!(backend.kind(), "mock");
    }

    #[test]
    fn test_request_failure_reports_observed_state() {
        let mock = MockBackend::new().with_vm(MockVm::new("uuid-1").in_state(VmState::PoweredOff));
        let vm = VmRef::new("uuid-1");

        let err = request_failure(&mock, &vm, Action::Start, "locked".to_string());
        assert!(matches!(
            err,
            Error::StateTransition {
                expected: VmState::Running,
                observed: VmState::PoweredOff,
                ..
            }
        ));

        let err = request_failure(&mock, &vm, Action::Shutdown, "locked".to_string());
        assert!(matches!(err, Error::Hypervisor { .. }));
    }
}
