//! VirtualBox driver.
//!
//! Every operation shells out to `VBoxManage`. Machines are addressed by
//! UUID once resolved, so renames during a run do not matter.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::command::{CommandOutput, CommandRunner, SystemRunner};
use super::{apply_transition, request_failure, Backend, BackendContext, VmRef};
use crate::error::{Error, Result};
use crate::transition::TransitionTable;
use crate::types::{Action, ActionOptions, DisplayMode, VmState};

/// Selector token for this driver.
pub const NAME: &str = "virtualbox";

/// Front-end used by `startvm` when no display mode is requested.
pub const DEFAULT_DISPLAY_MODE: DisplayMode = DisplayMode::Headless;

/// VirtualBox driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBoxConfig {
    /// Path to (or name of) the `VBoxManage` binary.
    #[serde(default = "default_vboxmanage")]
    pub vboxmanage: PathBuf,
}

fn default_vboxmanage() -> PathBuf {
    PathBuf::from("VBoxManage")
}

impl Default for VirtualBoxConfig {
    fn default() -> Self {
        Self {
            vboxmanage: default_vboxmanage(),
        }
    }
}

/// Transitions VirtualBox accepts.
pub fn transition_table() -> TransitionTable {
    use VmState::*;

    TransitionTable::builder()
        .allow(Action::Start, &[PoweredOff, Saved, Aborted, Teleported])
        .allow(Action::StartPaused, &[PoweredOff, Saved, Aborted, Teleported])
        .allow(Action::Pause, &[Running, Teleporting, LiveSnapshotting])
        .allow(Action::Resume, &[Paused, TeleportingPausedVm])
        .allow(Action::Reset, &[Running, Paused])
        .allow(Action::Shutdown, &[Running])
        .allow(Action::Sleep, &[Running])
        .allow(Action::SaveState, &[Running, Paused])
        .allow(
            Action::Stop,
            &[
                Running,
                Paused,
                Stuck,
                Teleporting,
                LiveSnapshotting,
                TeleportingPausedVm,
            ],
        )
        .build()
}

/// Machine details from `showvminfo --machinereadable`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MachineInfo {
    name: Option<String>,
    uuid: String,
    state: VmState,
}

/// VirtualBox backend.
#[derive(Debug)]
pub struct VirtualBox {
    config: VirtualBoxConfig,
    runner: Box<dyn CommandRunner>,
    transitions: TransitionTable,
    version: String,
    ctx: BackendContext,
}

impl VirtualBox {
    /// Connect to the local VirtualBox installation.
    pub fn new(config: VirtualBoxConfig, ctx: BackendContext) -> Result<Self> {
        Self::with_runner(config, ctx, Box::new(SystemRunner))
    }

    /// Connect using a custom command runner.
    ///
    /// Fails with [`Error::BackendUnavailable`] unless `VBoxManage --version`
    /// reports a version.
    pub fn with_runner(
        config: VirtualBoxConfig,
        ctx: BackendContext,
        runner: Box<dyn CommandRunner>,
    ) -> Result<Self> {
        let version = {
            let _enter = ctx.span.enter();
            detect_version(&config, runner.as_ref())?
        };

        ctx.span.in_scope(|| {
            info!(
                vboxmanage = %config.vboxmanage.display(),
                version = %version,
                "VirtualBox backend available"
            );
        });

        Ok(Self {
            config,
            runner,
            transitions: transition_table(),
            version,
            ctx,
        })
    }

    /// Version reported by `VBoxManage`.
    pub fn version(&self) -> &str {
        &self.version
    }

    fn vboxmanage(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner
            .run(&self.config.vboxmanage, args)
            .map_err(|e| Error::hypervisor(NAME, format!("failed to run VBoxManage: {e}")))
    }

    fn show(&self, key: &str) -> Result<Option<MachineInfo>> {
        let output = self.vboxmanage(&["showvminfo", key, "--machinereadable"])?;
        if !output.success {
            debug!(vm = key, detail = %output.failure_detail(), "showvminfo failed");
            return Ok(None);
        }
        parse_machine_info(&output.stdout).map(Some)
    }

    fn show_resolved(&self, vm: &VmRef) -> Result<MachineInfo> {
        self.show(vm.key())?.ok_or_else(|| Error::VmNotFound {
            backend: NAME,
            vm: vm.to_string(),
        })
    }

    fn request(&self, vm: &VmRef, action: Action, options: &ActionOptions) -> Result<()> {
        let mode = options.display_mode.unwrap_or(DEFAULT_DISPLAY_MODE);
        let start = vec!["startvm", vm.key(), "--type", mode.as_str()];
        let steps = match action {
            Action::Start => vec![start],
            // VBoxManage has no paused power-up; pause right after starting.
            Action::StartPaused => vec![start, vec!["controlvm", vm.key(), "pause"]],
            other => vec![vec!["controlvm", vm.key(), controlvm_verb(other)]],
        };

        for args in steps {
            let output = self.vboxmanage(&args)?;
            if !output.success {
                return Err(request_failure(self, vm, action, output.failure_detail()));
            }
        }
        Ok(())
    }
}

impl Backend for VirtualBox {
    fn kind(&self) -> &'static str {
        NAME
    }

    fn find(&self, name_or_uuid: &str) -> Result<Option<VmRef>> {
        let _enter = self.ctx.span.enter();
        let found = self.show(name_or_uuid)?;
        debug!(vm = name_or_uuid, found = found.is_some(), "Looked up machine");
        Ok(found.map(|info| VmRef::new(info.uuid)))
    }

    fn vm_name(&self, vm: &VmRef) -> Result<Option<String>> {
        Ok(self.show_resolved(vm)?.name)
    }

    fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        Ok(self.show_resolved(vm)?.uuid)
    }

    fn vm_state(&self, vm: &VmRef) -> Result<VmState> {
        Ok(self.show_resolved(vm)?.state)
    }

    fn set_vm_state(&self, vm: &VmRef, action: Action, options: &ActionOptions) -> Result<()> {
        let _enter = self.ctx.span.enter();
        apply_transition(self, vm, action, &self.ctx.settle, || {
            self.request(vm, action, options)
        })
    }

    fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }
}

fn detect_version(config: &VirtualBoxConfig, runner: &dyn CommandRunner) -> Result<String> {
    let unavailable = |detail: String| Error::BackendUnavailable {
        backend: NAME,
        detail,
    };

    let output = runner.run(&config.vboxmanage, &["--version"]).map_err(|e| {
        unavailable(format!(
            "failed to run {}: {e}",
            config.vboxmanage.display()
        ))
    })?;

    if !output.success {
        return Err(unavailable(format!(
            "{} --version {}",
            config.vboxmanage.display(),
            output.failure_detail()
        )));
    }

    match output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(version) => Ok(version.to_string()),
        None => Err(unavailable("VBoxManage reported no version".to_string())),
    }
}

fn controlvm_verb(action: Action) -> &'static str {
    match action {
        Action::Pause => "pause",
        Action::Resume => "resume",
        Action::Reset => "reset",
        Action::Shutdown => "acpipowerbutton",
        Action::Sleep => "acpisleepbutton",
        Action::SaveState => "savestate",
        Action::Stop => "poweroff",
        Action::Start | Action::StartPaused => "startvm",
    }
}

/// Parse `key="value"` lines. Keys and values may both be quoted.
fn parse_machine_readable(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (unquote(key).to_string(), unquote(value).to_string()))
        .collect()
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

fn parse_machine_info(text: &str) -> Result<MachineInfo> {
    let fields = parse_machine_readable(text);

    let uuid = fields
        .get("UUID")
        .filter(|uuid| !uuid.is_empty())
        .cloned()
        .ok_or_else(|| Error::hypervisor(NAME, "showvminfo output has no UUID"))?;

    let raw_state = fields
        .get("VMState")
        .ok_or_else(|| Error::hypervisor(NAME, format!("showvminfo output for {uuid} has no VMState")))?;
    let state = parse_vbox_state(raw_state).ok_or_else(|| {
        Error::hypervisor(NAME, format!("unrecognized machine state '{raw_state}'"))
    })?;

    let name = fields
        .get("name")
        .filter(|name| !name.is_empty())
        .cloned();

    Ok(MachineInfo { name, uuid, state })
}

/// Map a `VMState` value onto the shared state set.
fn parse_vbox_state(raw: &str) -> Option<VmState> {
    let state = match raw.to_ascii_lowercase().as_str() {
        "poweroff" => VmState::PoweredOff,
        "gurumeditation" => VmState::Stuck,
        "deletingsnapshotlive" => VmState::DeletingSnapshotOnline,
        "deletingsnapshotlivepaused" => VmState::DeletingSnapshotPaused,
        "aborted-saved" => VmState::Aborted,
        other => return other.parse().ok(),
    };
    Some(state)
}
