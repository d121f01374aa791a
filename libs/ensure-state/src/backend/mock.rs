//! In-memory backend for tests and development.
//!
//! Clones share state, so a test can hand a factory to the registry and
//! still inspect what the engine did afterwards.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use virtuoso_reconcile::SettlePolicy;

use super::{apply_transition, virtualbox, Backend, BackendContext, VmRef};
use crate::error::{Error, Result};
use crate::transition::TransitionTable;
use crate::types::{Action, ActionOptions, VmState};

/// How a mock machine reacts to a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTransition {
    /// The target state is visible on the next read.
    Immediate,
    /// The target state appears after this many state reads.
    Lagged(u32),
    /// The request is accepted but the state never changes.
    Stuck,
}

/// A scripted machine.
#[derive(Debug, Clone)]
pub struct MockVm {
    uuid: String,
    name: Option<String>,
    state: VmState,
    transition: MockTransition,
    pending: Option<(VmState, u32)>,
}

impl MockVm {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: None,
            state: VmState::PoweredOff,
            transition: MockTransition::Immediate,
            pending: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }

    pub fn transition(mut self, transition: MockTransition) -> Self {
        self.transition = transition;
        self
    }

    /// Observe the state, advancing any lagging transition by one read.
    fn observe(&mut self) -> VmState {
        if let Some((target, remaining)) = self.pending.take() {
            if remaining == 0 {
                self.state = target;
            } else {
                self.pending = Some((target, remaining - 1));
            }
        }
        self.state
    }

    /// Where the guest ends up after `action`, if it changes at all.
    fn destination(action: Action) -> Option<VmState> {
        match action {
            // Cooperative guests honor the power button.
            Action::Shutdown => Some(VmState::PoweredOff),
            other => other.target_state(),
        }
    }
}

#[derive(Debug)]
struct MockState {
    vms: Vec<MockVm>,
    available: bool,
    constructions: u32,
    lookups: Vec<String>,
    applied: Vec<(String, Action, ActionOptions)>,
}

/// In-memory backend.
#[derive(Debug, Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<MockState>>,
    transitions: TransitionTable,
    settle: SettlePolicy,
}

impl MockBackend {
    /// An available backend with no machines, using VirtualBox's transition rules.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                vms: Vec::new(),
                available: true,
                constructions: 0,
                lookups: Vec::new(),
                applied: Vec::new(),
            })),
            transitions: virtualbox::transition_table(),
            settle: SettlePolicy::immediate(),
        }
    }

    pub fn with_vm(self, vm: MockVm) -> Self {
        self.lock().vms.push(vm);
        self
    }

    pub fn with_transitions(mut self, transitions: TransitionTable) -> Self {
        self.transitions = transitions;
        self
    }

    /// Make construction through [`MockBackend::factory`] fail.
    pub fn unavailable(self) -> Self {
        self.lock().available = false;
        self
    }

    /// A registry factory producing handles onto this backend.
    pub fn factory(&self) -> impl Fn(&BackendContext) -> Result<Box<dyn Backend>> + 'static {
        let backend = self.clone();
        move |ctx: &BackendContext| {
            let mut state = backend.lock();
            state.constructions += 1;
            if !state.available {
                return Err(Error::BackendUnavailable {
                    backend: "mock",
                    detail: "mock backend configured as unavailable".to_string(),
                });
            }
            drop(state);

            let mut handle = backend.clone();
            handle.settle = ctx.settle;
            Ok(Box::new(handle) as Box<dyn Backend>)
        }
    }

    /// How many times the factory was invoked.
    pub fn constructions(&self) -> u32 {
        self.lock().constructions
    }

    /// Identifiers passed to `find`.
    pub fn lookups(&self) -> Vec<String> {
        self.lock().lookups.clone()
    }

    /// Actions issued to the hypervisor, in order.
    pub fn applied(&self) -> Vec<Action> {
        self.lock().applied.iter().map(|(_, action, _)| *action).collect()
    }

    /// Options passed with each issued action.
    pub fn applied_options(&self) -> Vec<ActionOptions> {
        self.lock().applied.iter().map(|(_, _, options)| *options).collect()
    }

    /// Current state of a machine without advancing lagging transitions.
    pub fn state_of(&self, uuid: &str) -> Option<VmState> {
        self.lock()
            .vms
            .iter()
            .find(|vm| vm.uuid == uuid)
            .map(|vm| vm.state)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_machine<T>(&self, vm: &VmRef, f: impl FnOnce(&mut MockVm) -> T) -> Result<T> {
        let mut state = self.lock();
        state
            .vms
            .iter_mut()
            .find(|m| m.uuid == vm.key())
            .map(f)
            .ok_or_else(|| Error::VmNotFound {
                backend: "mock",
                vm: vm.to_string(),
            })
    }

    fn request(&self, vm: &VmRef, action: Action, options: &ActionOptions) -> Result<()> {
        self.lock()
            .applied
            .push((vm.key().to_string(), action, *options));

        self.with_machine(vm, |machine| {
            let Some(target) = MockVm::destination(action) else {
                return;
            };
            match machine.transition {
                MockTransition::Immediate => machine.state = target,
                MockTransition::Lagged(reads) => machine.pending = Some((target, reads)),
                MockTransition::Stuck => {}
            }
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn find(&self, name_or_uuid: &str) -> Result<Option<VmRef>> {
        let mut state = self.lock();
        state.lookups.push(name_or_uuid.to_string());
        let found = state
            .vms
            .iter()
            .find(|vm| vm.uuid == name_or_uuid || vm.name.as_deref() == Some(name_or_uuid))
            .map(|vm| VmRef::new(vm.uuid.clone()));
        debug!(vm = name_or_uuid, found = found.is_some(), "[MOCK] Looked up machine");
        Ok(found)
    }

    fn vm_name(&self, vm: &VmRef) -> Result<Option<String>> {
        self.with_machine(vm, |machine| machine.name.clone())
    }

    fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        self.with_machine(vm, |machine| machine.uuid.clone())
    }

    fn vm_state(&self, vm: &VmRef) -> Result<VmState> {
        self.with_machine(vm, MockVm::observe)
    }

    fn set_vm_state(&self, vm: &VmRef, action: Action, options: &ActionOptions) -> Result<()> {
        apply_transition(self, vm, action, &self.settle, || {
            self.request(vm, action, options)
        })
    }

    fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }
}
