//! Closed vocabularies for machine states, operator actions and start options.
//!
//! States are nouns observed from a backend; actions are verbs the operator
//! asks for. Both parse from the kebab-case tokens used in configuration and
//! also accept the CamelCase spellings VirtualBox users are used to
//! (`PoweredOff`, `powerUp`, `saveState`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing state, action or option tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown virtual machine state: '{0}'")]
    UnknownState(String),

    #[error("unknown action: '{0}'")]
    UnknownAction(String),

    #[error("unknown display mode: '{0}' (expected gui, headless, sdl or separate)")]
    UnknownDisplayMode(String),

    #[error("invalid state/action pair '{0}': expected STATE=ACTION")]
    InvalidPair(String),
}

/// Lowercase a token and drop separators so `PoweredOff`, `powered-off`
/// and `powered_off` compare equal.
fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Runtime state of a virtual machine as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum VmState {
    PoweredOff,
    Saved,
    Teleported,
    Aborted,
    Running,
    Paused,
    Stuck,
    Teleporting,
    LiveSnapshotting,
    Starting,
    Stopping,
    Saving,
    Restoring,
    TeleportingPausedVm,
    TeleportingIn,
    DeletingSnapshotOnline,
    DeletingSnapshotPaused,
    RestoringSnapshot,
    DeletingSnapshot,
    SettingUp,
}

impl VmState {
    /// Every state, in declaration order.
    pub const ALL: [VmState; 20] = [
        VmState::PoweredOff,
        VmState::Saved,
        VmState::Teleported,
        VmState::Aborted,
        VmState::Running,
        VmState::Paused,
        VmState::Stuck,
        VmState::Teleporting,
        VmState::LiveSnapshotting,
        VmState::Starting,
        VmState::Stopping,
        VmState::Saving,
        VmState::Restoring,
        VmState::TeleportingPausedVm,
        VmState::TeleportingIn,
        VmState::DeletingSnapshotOnline,
        VmState::DeletingSnapshotPaused,
        VmState::RestoringSnapshot,
        VmState::DeletingSnapshot,
        VmState::SettingUp,
    ];

    /// The configuration token for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::PoweredOff => "powered-off",
            VmState::Saved => "saved",
            VmState::Teleported => "teleported",
            VmState::Aborted => "aborted",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Stuck => "stuck",
            VmState::Teleporting => "teleporting",
            VmState::LiveSnapshotting => "live-snapshotting",
            VmState::Starting => "starting",
            VmState::Stopping => "stopping",
            VmState::Saving => "saving",
            VmState::Restoring => "restoring",
            VmState::TeleportingPausedVm => "teleporting-paused-vm",
            VmState::TeleportingIn => "teleporting-in",
            VmState::DeletingSnapshotOnline => "deleting-snapshot-online",
            VmState::DeletingSnapshotPaused => "deleting-snapshot-paused",
            VmState::RestoringSnapshot => "restoring-snapshot",
            VmState::DeletingSnapshot => "deleting-snapshot",
            VmState::SettingUp => "setting-up",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        VmState::ALL
            .into_iter()
            .find(|state| normalize(state.as_str()) == wanted)
            .ok_or_else(|| ParseError::UnknownState(s.to_string()))
    }
}

impl TryFrom<String> for VmState {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a backend confirms that an action took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The hypervisor's own success signal is trusted.
    Trusted,

    /// The call returns early; poll until the machine reports this state.
    Settle(VmState),

    /// Completion depends on the guest and cannot be observed synchronously.
    /// Reported as success once the request is delivered.
    FireAndForget,
}

/// An operator intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum Action {
    /// Power the machine up (or restore it from a saved state).
    Start,
    /// Power the machine up and pause it before the guest runs.
    StartPaused,
    Pause,
    Resume,
    /// Hard reset of a live machine. A paused machine stays paused.
    Reset,
    /// Press the ACPI power button and let the guest shut itself down.
    Shutdown,
    /// Press the ACPI sleep button.
    Sleep,
    /// Save the machine state to disk and stop it.
    SaveState,
    /// Pull the virtual power cord.
    Stop,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 9] = [
        Action::Start,
        Action::StartPaused,
        Action::Pause,
        Action::Resume,
        Action::Reset,
        Action::Shutdown,
        Action::Sleep,
        Action::SaveState,
        Action::Stop,
    ];

    /// The configuration token for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::StartPaused => "start-paused",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Reset => "reset",
            Action::Shutdown => "shutdown",
            Action::Sleep => "sleep",
            Action::SaveState => "save-state",
            Action::Stop => "stop",
        }
    }

    /// The state the machine is expected to end up in, if it is observable
    /// and does not depend on where the machine started.
    pub fn target_state(&self) -> Option<VmState> {
        match self {
            Action::Start | Action::Resume => Some(VmState::Running),
            Action::StartPaused | Action::Pause => Some(VmState::Paused),
            Action::SaveState => Some(VmState::Saved),
            Action::Stop => Some(VmState::PoweredOff),
            Action::Reset | Action::Shutdown | Action::Sleep => None,
        }
    }

    /// Default completion policy for this action.
    ///
    /// `Shutdown` and `Sleep` only press a button; the guest decides if and
    /// when to honor it, so they succeed once the request is delivered.
    /// They must not be polled like `Stop`: a guest ignoring ACPI is not a
    /// failed run.
    ///
    /// `Reset` keeps the machine in the state it was reset from, so there is
    /// no single state to wait for; the hypervisor's answer is trusted.
    pub fn completion(&self) -> Completion {
        match self {
            Action::Start | Action::Reset => Completion::Trusted,
            Action::Shutdown | Action::Sleep => Completion::FireAndForget,
            Action::StartPaused | Action::Pause => Completion::Settle(VmState::Paused),
            Action::Resume => Completion::Settle(VmState::Running),
            Action::SaveState => Completion::Settle(VmState::Saved),
            Action::Stop => Completion::Settle(VmState::PoweredOff),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        let alias = match wanted.as_str() {
            "powerup" => Some(Action::Start),
            "poweruppaused" => Some(Action::StartPaused),
            "powerbutton" => Some(Action::Shutdown),
            "sleepbutton" => Some(Action::Sleep),
            "poweroff" => Some(Action::Stop),
            _ => None,
        };

        alias
            .or_else(|| {
                Action::ALL
                    .into_iter()
                    .find(|action| normalize(action.as_str()) == wanted)
            })
            .ok_or_else(|| ParseError::UnknownAction(s.to_string()))
    }
}

impl TryFrom<String> for Action {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Front-end used when a machine is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum DisplayMode {
    Gui,
    Headless,
    Sdl,
    Separate,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Gui => "gui",
            DisplayMode::Headless => "headless",
            DisplayMode::Sdl => "sdl",
            DisplayMode::Separate => "separate",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "gui" => Ok(DisplayMode::Gui),
            "headless" => Ok(DisplayMode::Headless),
            "sdl" => Ok(DisplayMode::Sdl),
            "separate" => Ok(DisplayMode::Separate),
            _ => Err(ParseError::UnknownDisplayMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for DisplayMode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Options passed along with an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionOptions {
    /// Display front-end; only meaningful when starting the machine.
    pub display_mode: Option<DisplayMode>,
}

impl ActionOptions {
    /// Build the options for `action`, dropping hints it does not use.
    pub fn for_action(action: Action, display_mode: Option<DisplayMode>) -> Self {
        match action {
            Action::Start | Action::StartPaused => Self { display_mode },
            _ => Self::default(),
        }
    }
}

/// Desired behavior per observed state: if the machine is in a keyed state,
/// take the mapped action. States without an entry need no action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateActionMap(BTreeMap<VmState, Action>);

impl StateActionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `action` for `state`, replacing any previous entry.
    pub fn insert(&mut self, state: VmState, action: Action) -> Option<Action> {
        self.0.insert(state, action)
    }

    /// The action declared for `state`, if any.
    pub fn get(&self, state: VmState) -> Option<Action> {
        self.0.get(&state).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VmState, Action)> + '_ {
        self.0.iter().map(|(state, action)| (*state, *action))
    }

    /// Parse a `STATE=ACTION` pair, e.g. `powered-off=start`.
    pub fn parse_pair(pair: &str) -> Result<(VmState, Action), ParseError> {
        let Some((state, action)) = pair.split_once('=') else {
            return Err(ParseError::InvalidPair(pair.to_string()));
        };

        Ok((state.trim().parse()?, action.trim().parse()?))
    }
}

impl FromIterator<(VmState, Action)> for StateActionMap {
    fn from_iter<I: IntoIterator<Item = (VmState, Action)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<(VmState, Action)> for StateActionMap {
    fn extend<I: IntoIterator<Item = (VmState, Action)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}
