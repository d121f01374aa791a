//! Firecracker driver.
//!
//! Controls microVMs whose VMM is already running, through the API socket
//! each VMM exposes under `<instances_dir>/<id>/firecracker.socket`.
//!
//! The API client is async; the driver owns a current-thread Tokio runtime
//! and blocks on each call so the backend contract stays synchronous.
//!
//! ## Supported actions
//!
//! - `start`: `InstanceStart`, trusted on success
//! - `pause` / `resume`: `PATCH /vm`, confirmed within the settle window
//! - `shutdown`: `SendCtrlAltDel`, fire-and-forget
//!
//! Firecracker has no stop, reset, sleep or save-state action; those are
//! absent from the transition table and rejected before any API call.

mod api;
#[cfg(test)]
mod fake;

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use super::command::{CommandRunner, SystemRunner};
use super::{apply_transition, request_failure, Backend, BackendContext, VmRef};
use crate::error::{Error, Result};
use crate::transition::TransitionTable;
use crate::types::{Action, ActionOptions, VmState};

pub use api::{ApiError, FirecrackerClient, InstanceInfo};

/// Selector token for this driver.
pub const NAME: &str = "firecracker";

/// API socket file name inside an instance directory.
const SOCKET_NAME: &str = "firecracker.socket";

/// `app_name` every VMM reports unless configured otherwise.
const DEFAULT_APP_NAME: &str = "Firecracker";

/// Default timeout for Firecracker API operations.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Firecracker driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Path to the firecracker binary (used for the availability check).
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Directory holding one sub-directory per instance.
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/bin/firecracker")
}

fn default_instances_dir() -> PathBuf {
    PathBuf::from("/var/lib/virtuoso/instances")
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            instances_dir: default_instances_dir(),
        }
    }
}

/// Transitions Firecracker accepts.
pub fn transition_table() -> TransitionTable {
    TransitionTable::builder()
        .allow(Action::Start, &[VmState::PoweredOff])
        .allow(Action::Pause, &[VmState::Running])
        .allow(Action::Resume, &[VmState::Paused])
        .allow(Action::Shutdown, &[VmState::Running])
        .build()
}

/// Firecracker backend.
#[derive(Debug)]
pub struct Firecracker {
    config: FirecrackerConfig,
    runtime: Runtime,
    transitions: TransitionTable,
    version: String,
    ctx: BackendContext,
}

impl Firecracker {
    pub fn new(config: FirecrackerConfig, ctx: BackendContext) -> Result<Self> {
        Self::with_runner(config, ctx, &SystemRunner)
    }

    /// Construct, probing `firecracker --version` through `runner`.
    pub fn with_runner(
        config: FirecrackerConfig,
        ctx: BackendContext,
        runner: &dyn CommandRunner,
    ) -> Result<Self> {
        let version = detect_version(&config, runner)?;
        let runtime = Builder::new_current_thread().enable_all().build()?;

        ctx.span.in_scope(|| {
            info!(
                version = %version,
                instances_dir = %config.instances_dir.display(),
                "Firecracker backend available"
            );
        });

        Ok(Self {
            config,
            runtime,
            transitions: transition_table(),
            version,
            ctx,
        })
    }

    /// Version reported by the firecracker binary.
    pub fn version(&self) -> &str {
        &self.version
    }

    fn socket_path(&self, instance_id: &str) -> PathBuf {
        self.config
            .instances_dir
            .join(instance_id)
            .join(SOCKET_NAME)
    }

    fn client(&self, vm: &VmRef) -> FirecrackerClient {
        FirecrackerClient::new(self.socket_path(vm.key()))
    }

    /// Block on an API call, bounded by [`API_TIMEOUT`].
    fn call<T, F>(&self, fut: F) -> std::result::Result<T, ApiError>
    where
        F: Future<Output = std::result::Result<T, ApiError>>,
    {
        self.runtime.block_on(async {
            tokio::time::timeout(API_TIMEOUT, fut)
                .await
                .map_err(|_| ApiError::Timeout(API_TIMEOUT))?
        })
    }

    fn info_at(&self, socket: &Path) -> std::result::Result<InstanceInfo, ApiError> {
        let client = FirecrackerClient::new(socket);
        self.call(client.get_instance_info())
    }

    fn info(&self, vm: &VmRef) -> Result<InstanceInfo> {
        let socket = self.socket_path(vm.key());
        self.info_at(&socket).map_err(|e| match e {
            ApiError::SocketNotFound(_) => Error::VmNotFound {
                backend: NAME,
                vm: vm.to_string(),
            },
            other => Error::hypervisor(NAME, other),
        })
    }

    /// Scan instance directories for a VMM reporting `wanted` as id or app name.
    fn scan(&self, wanted: &str) -> Result<Option<VmRef>> {
        let entries = match fs::read_dir(&self.config.instances_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let socket = entry.path().join(SOCKET_NAME);
            if !socket.exists() {
                continue;
            }

            match self.info_at(&socket) {
                Ok(info) if info.id == wanted || configured_name(&info) == Some(wanted) => {
                    let key = entry.file_name().to_string_lossy().into_owned();
                    return Ok(Some(VmRef::new(key)));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(socket = %socket.display(), error = %e, "Skipping unreachable VMM");
                }
            }
        }

        Ok(None)
    }

    fn request(&self, vm: &VmRef, action: Action) -> Result<()> {
        let client = self.client(vm);
        let result = match action {
            Action::Start => self.call(client.start_instance()),
            Action::Pause => self.call(client.pause()),
            Action::Resume => self.call(client.resume()),
            Action::Shutdown => self.call(client.send_ctrl_alt_del()),
            other => {
                return Err(Error::Unsupported {
                    backend: NAME,
                    operation: other.to_string(),
                })
            }
        };

        result.map_err(|e| request_failure(self, vm, action, e.to_string()))
    }
}

impl Backend for Firecracker {
    fn kind(&self) -> &'static str {
        NAME
    }

    fn find(&self, name_or_uuid: &str) -> Result<Option<VmRef>> {
        let _enter = self.ctx.span.enter();

        // Instance directories are named after the instance id.
        let direct = self.socket_path(name_or_uuid);
        if is_plain_name(name_or_uuid) && direct.exists() {
            debug!(vm = name_or_uuid, "Found instance directory");
            return Ok(Some(VmRef::new(name_or_uuid)));
        }

        let found = self.scan(name_or_uuid)?;
        debug!(vm = name_or_uuid, found = found.is_some(), "Scanned instances");
        Ok(found)
    }

    fn vm_name(&self, vm: &VmRef) -> Result<Option<String>> {
        let info = self.info(vm)?;
        Ok(configured_name(&info).map(str::to_string))
    }

    fn vm_uuid(&self, vm: &VmRef) -> Result<String> {
        Ok(self.info(vm)?.id)
    }

    fn vm_state(&self, vm: &VmRef) -> Result<VmState> {
        let info = self.info(vm)?;
        parse_state(&info.state).ok_or_else(|| {
            Error::hypervisor(NAME, format!("unrecognized instance state '{}'", info.state))
        })
    }

    /// Display mode is ignored: Firecracker guests have no display.
    fn set_vm_state(&self, vm: &VmRef, action: Action, _options: &ActionOptions) -> Result<()> {
        let _enter = self.ctx.span.enter();
        apply_transition(self, vm, action, &self.ctx.settle, || self.request(vm, action))
    }

    fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }
}

/// The VMM's app name, unless it is empty or Firecracker's default.
fn configured_name(info: &InstanceInfo) -> Option<&str> {
    let name = info.app_name.as_str();
    (!name.is_empty() && name != DEFAULT_APP_NAME).then_some(name)
}

/// Reject identifiers that would escape the instances directory.
fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

fn parse_state(raw: &str) -> Option<VmState> {
    match raw {
        "Not started" => Some(VmState::PoweredOff),
        "Running" => Some(VmState::Running),
        "Paused" => Some(VmState::Paused),
        _ => None,
    }
}

fn detect_version(config: &FirecrackerConfig, runner: &dyn CommandRunner) -> Result<String> {
    let unavailable = |detail: String| Error::BackendUnavailable {
        backend: NAME,
        detail,
    };

    let output = runner
        .run(&config.binary, &["--version"])
        .map_err(|e| unavailable(format!("failed to run {}: {e}", config.binary.display())))?;

    if !output.success {
        return Err(unavailable(format!(
            "{} --version {}",
            config.binary.display(),
            output.failure_detail()
        )));
    }

    parse_version(&output.stdout)
        .ok_or_else(|| unavailable("firecracker reported no version".to_string()))
}

/// Extract the version from output such as `Firecracker v1.7.0`.
fn parse_version(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let version = line
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))
        .unwrap_or(line);
    Some(version.to_string())
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::fake::FakeVmm;
    use super::*;
    use crate::backend::command::CommandOutput;
    use virtuoso_reconcile::SettlePolicy;

    #[derive(Debug)]
    struct FakeBinary(Option<&'static str>);

    impl CommandRunner for FakeBinary {
        fn run(&self, _program: &Path, args: &[&str]) -> io::Result<CommandOutput> {
            assert_eq!(args, ["--version"]);
            Ok(match self.0 {
                Some(stdout) => CommandOutput {
                    success: true,
                    code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
                None => CommandOutput {
                    success: false,
                    code: Some(127),
                    ..Default::default()
                },
            })
        }
    }

    fn backend(instances_dir: &Path) -> Firecracker {
        let config = FirecrackerConfig {
            instances_dir: instances_dir.to_path_buf(),
            ..Default::default()
        };
        Firecracker::with_runner(
            config,
            BackendContext::default(),
            &FakeBinary(Some("Firecracker v1.7.0\n\n")),
        )
        .unwrap()
    }

    #[test]
    fn test_version_detected() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(backend(dir.path()).version(), "1.7.0");
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = Firecracker::with_runner(
            FirecrackerConfig::default(),
            BackendContext::default(),
            &FakeBinary(None),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { backend: NAME, .. }));

        let err = Firecracker::with_runner(
            FirecrackerConfig::default(),
            BackendContext::default(),
            &FakeBinary(Some("")),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }

    #[test]
    fn test_find_missing_instance() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("vm-1")).unwrap();

        let fc = backend(dir.path());
        assert!(fc.find("vm-1").unwrap().is_none());
        assert!(fc.find("../etc").unwrap().is_none());
    }

    #[test]
    fn test_find_without_instances_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fc = backend(&dir.path().join("missing"));

        assert!(fc.find("vm-1").unwrap().is_none());
    }

    #[test]
    fn test_vanished_socket_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fc = backend(dir.path());

        let err = fc.vm_state(&VmRef::new("vm-1")).unwrap_err();
        assert_eq!(err.reason_code(), "vm_not_found");
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("Not started"), Some(VmState::PoweredOff));
        assert_eq!(parse_state("Running"), Some(VmState::Running));
        assert_eq!(parse_state("Paused"), Some(VmState::Paused));
        assert_eq!(parse_state("Exploded"), None);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("Firecracker v1.7.0\n").as_deref(), Some("1.7.0"));
        assert_eq!(parse_version("1.4.1").as_deref(), Some("1.4.1"));
        assert_eq!(parse_version("\n  \n"), None);
    }

    #[test]
    fn test_table_has_no_stop() {
        let table = transition_table();

        assert!(table.sources(Action::Stop).is_none());
        assert!(table.sources(Action::StartPaused).is_none());
        assert!(table.can_transition(VmState::PoweredOff, Action::Start));
        assert!(table.can_transition(VmState::Paused, Action::Resume));
        assert!(!table.can_transition(VmState::Running, Action::Resume));
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("vm-1"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("a/b"));
    }

    fn live_backend(instances_dir: &Path) -> Firecracker {
        let config = FirecrackerConfig {
            instances_dir: instances_dir.to_path_buf(),
            ..Default::default()
        };
        let ctx = BackendContext {
            settle: SettlePolicy::new(Duration::from_millis(1), Duration::from_millis(50)),
            ..Default::default()
        };
        Firecracker::with_runner(config, ctx, &FakeBinary(Some("Firecracker v1.7.0"))).unwrap()
    }

    #[test]
    fn test_find_by_directory_and_reported_identity() {
        let dir = tempfile::tempdir().unwrap();
        FakeVmm::spawn(dir.path(), "vm-1", "web-7", "Running").app_name("build-agent");
        let fc = live_backend(dir.path());

        assert_eq!(fc.find("vm-1").unwrap(), Some(VmRef::new("vm-1")));
        assert_eq!(fc.find("web-7").unwrap(), Some(VmRef::new("vm-1")));
        assert_eq!(fc.find("build-agent").unwrap(), Some(VmRef::new("vm-1")));
        assert_eq!(fc.find("db-3").unwrap(), None);

        let vm = VmRef::new("vm-1");
        assert_eq!(fc.vm_uuid(&vm).unwrap(), "web-7");
        assert_eq!(fc.vm_name(&vm).unwrap().as_deref(), Some("build-agent"));
    }

    #[test]
    fn test_default_app_name_is_not_a_name() {
        let dir = tempfile::tempdir().unwrap();
        FakeVmm::spawn(dir.path(), "vm-1", "web-7", "Running");
        let fc = live_backend(dir.path());

        assert_eq!(fc.vm_name(&VmRef::new("vm-1")).unwrap(), None);
        assert_eq!(fc.find(DEFAULT_APP_NAME).unwrap(), None);
    }

    #[test]
    fn test_state_mapping() {
        let dir = tempfile::tempdir().unwrap();
        FakeVmm::spawn(dir.path(), "a", "a", "Not started");
        FakeVmm::spawn(dir.path(), "b", "b", "Running");
        FakeVmm::spawn(dir.path(), "c", "c", "Paused");
        let fc = live_backend(dir.path());

        assert_eq!(fc.vm_state(&VmRef::new("a")).unwrap(), VmState::PoweredOff);
        assert_eq!(fc.vm_state(&VmRef::new("b")).unwrap(), VmState::Running);
        assert_eq!(fc.vm_state(&VmRef::new("c")).unwrap(), VmState::Paused);
    }

    #[test]
    fn test_start_issues_instance_start() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Not started");
        let fc = live_backend(dir.path());
        let vm = VmRef::new("vm-1");

        fc.set_vm_state(&vm, Action::Start, &ActionOptions::default())
            .unwrap();

        let mutations = vmm.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].0, "PUT");
        assert_eq!(mutations[0].1, "/actions");
        assert_eq!(mutations[0].2["action_type"], "InstanceStart");
        assert_eq!(vmm.state(), "Running");
    }

    #[test]
    fn test_pause_and_resume_settle() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Running");
        let fc = live_backend(dir.path());
        let vm = VmRef::new("vm-1");

        fc.set_vm_state(&vm, Action::Pause, &ActionOptions::default())
            .unwrap();
        assert_eq!(fc.vm_state(&vm).unwrap(), VmState::Paused);

        fc.set_vm_state(&vm, Action::Resume, &ActionOptions::default())
            .unwrap();
        assert_eq!(fc.vm_state(&vm).unwrap(), VmState::Running);

        let bodies: Vec<_> = vmm
            .mutations()
            .into_iter()
            .map(|(method, path, body)| (method, path, body["state"].as_str().map(str::to_string)))
            .collect();
        assert_eq!(
            bodies,
            vec![
                ("PATCH".to_string(), "/vm".to_string(), Some("Paused".to_string())),
                ("PATCH".to_string(), "/vm".to_string(), Some("Resumed".to_string())),
            ]
        );
    }

    #[test]
    fn test_pause_that_never_settles_fails() {
        let dir = tempfile::tempdir().unwrap();
        FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Running").ignoring("Paused");
        let fc = live_backend(dir.path());

        let err = fc
            .set_vm_state(&VmRef::new("vm-1"), Action::Pause, &ActionOptions::default())
            .unwrap_err();

        assert!(matches!(
            err,
            Error::StateTransition {
                expected: VmState::Paused,
                observed: VmState::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_shutdown_is_fire_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Running");
        let fc = live_backend(dir.path());

        fc.set_vm_state(&VmRef::new("vm-1"), Action::Shutdown, &ActionOptions::default())
            .unwrap();

        assert_eq!(vmm.mutations()[0].2["action_type"], "SendCtrlAltDel");
        assert_eq!(vmm.state(), "Running");
    }

    #[test]
    fn test_api_fault_reports_observed_state() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Not started");
        vmm.fail_next(400, "Cannot start microvm that was already started");
        let fc = live_backend(dir.path());

        let err = fc
            .set_vm_state(&VmRef::new("vm-1"), Action::Start, &ActionOptions::default())
            .unwrap_err();

        match err {
            Error::StateTransition {
                expected,
                observed,
                detail,
                ..
            } => {
                assert_eq!(expected, VmState::Running);
                assert_eq!(observed, VmState::PoweredOff);
                assert!(detail.unwrap().contains("Cannot start microvm"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_action_never_reaches_api() {
        let dir = tempfile::tempdir().unwrap();
        let vmm = FakeVmm::spawn(dir.path(), "vm-1", "vm-1", "Running");
        let fc = live_backend(dir.path());

        let err = fc
            .set_vm_state(&VmRef::new("vm-1"), Action::Stop, &ActionOptions::default())
            .unwrap_err();

        assert!(matches!(err, Error::InvalidState { action: Action::Stop, .. }));
        assert!(vmm.mutations().is_empty());
    }
}
