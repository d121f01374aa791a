//! Resolved handle to one virtual machine.

use std::fmt;

use crate::backend::{Backend, VmRef};
use crate::error::{Error, Result};
use crate::types::{Action, ActionOptions, DisplayMode, VmState};

/// A machine resolved on one backend for the duration of a run.
///
/// Nothing is cached: every accessor asks the backend.
pub struct VirtualMachine<'a> {
    backend: &'a dyn Backend,
    requested: String,
    vm: VmRef,
    display_mode: Option<DisplayMode>,
}

impl<'a> VirtualMachine<'a> {
    /// Resolve `name_or_uuid`, failing with [`Error::VmNotFound`].
    pub fn find(name_or_uuid: &str, backend: &'a dyn Backend) -> Result<Self> {
        Self::try_find(name_or_uuid, backend)?.ok_or_else(|| Error::VmNotFound {
            backend: backend.kind(),
            vm: name_or_uuid.to_string(),
        })
    }

    pub fn try_find(name_or_uuid: &str, backend: &'a dyn Backend) -> Result<Option<Self>> {
        Ok(backend.find(name_or_uuid)?.map(|vm| Self {
            backend,
            requested: name_or_uuid.to_string(),
            vm,
            display_mode: None,
        }))
    }

    /// Display front-end to use if the machine gets started.
    pub fn with_display_mode(mut self, display_mode: Option<DisplayMode>) -> Self {
        self.display_mode = display_mode;
        self
    }

    /// Identifier as supplied by the caller.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// Human readable name, or the UUID if the backend has none.
    pub fn name(&self) -> Result<String> {
        match self.backend.vm_name(&self.vm)? {
            Some(name) => Ok(name),
            None => self.uuid(),
        }
    }

    pub fn uuid(&self) -> Result<String> {
        self.backend.vm_uuid(&self.vm)
    }

    /// Current state, read from the backend.
    pub fn state(&self) -> Result<VmState> {
        self.backend.vm_state(&self.vm)
    }

    /// Hand `action` to the backend without any checks of its own.
    pub fn set_state(&self, action: Action) -> Result<()> {
        let options = ActionOptions::for_action(action, self.display_mode);
        self.backend.set_vm_state(&self.vm, action, &options)
    }
}

impl fmt::Debug for VirtualMachine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("backend", &self.backend.kind())
            .field("requested", &self.requested)
            .field("vm", &self.vm)
            .field("display_mode", &self.display_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockVm};

    #[test]
    fn test_find_by_name_or_uuid() {
        let mock = MockBackend::new().with_vm(MockVm::new("u1").named("web"));

        let by_name = VirtualMachine::find("web", &mock).unwrap();
        let by_uuid = VirtualMachine::find("u1", &mock).unwrap();

        assert_eq!(by_name.uuid().unwrap(), "u1");
        assert_eq!(by_uuid.name().unwrap(), "web");
        assert_eq!(by_name.requested(), "web");
    }

    #[test]
    fn test_missing_machine() {
        let mock = MockBackend::new();

        let err = VirtualMachine::find("ghost", &mock).unwrap_err();
        assert!(matches!(err, Error::VmNotFound { backend: "mock", ref vm } if vm == "ghost"));
        assert!(VirtualMachine::try_find("ghost", &mock).unwrap().is_none());
    }

    #[test]
    fn test_name_falls_back_to_uuid() {
        let mock = MockBackend::new().with_vm(MockVm::new("u1"));
        let vm = VirtualMachine::find("u1", &mock).unwrap();

        assert_eq!(vm.name().unwrap(), "u1");
    }

    #[test]
    fn test_state_is_reread() {
        let mock = MockBackend::new().with_vm(MockVm::new("u1").in_state(VmState::PoweredOff));
        let vm = VirtualMachine::find("u1", &mock).unwrap();
        assert_eq!(vm.state().unwrap(), VmState::PoweredOff);

        let other = VirtualMachine::find("u1", &mock).unwrap();
        other.set_state(Action::Start).unwrap();

        assert_eq!(vm.state().unwrap(), VmState::Running);
    }

    #[test]
    fn test_display_mode_only_sent_with_start() {
        let mock = MockBackend::new().with_vm(MockVm::new("u1").in_state(VmState::PoweredOff));
        let vm = VirtualMachine::find("u1", &mock)
            .unwrap()
            .with_display_mode(Some(DisplayMode::Gui));

        vm.set_state(Action::Start).unwrap();
        vm.set_state(Action::Pause).unwrap();

        let options = mock.applied_options();
        assert_eq!(options[0].display_mode, Some(DisplayMode::Gui));
        assert_eq!(options[1].display_mode, None);
    }
}
