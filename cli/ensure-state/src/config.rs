//! Configuration file handling.
//!
//! The file is optional. Values given on the command line always win, and
//! `--if` entries are merged over the file's `[states]` table.
//!
//! ```toml
//! backend = "virtualbox"
//! machine = "build-agent"
//! display_mode = "headless"
//!
//! [states]
//! powered-off = "start"
//! paused = "resume"
//!
//! [settle]
//! interval_ms = 500
//! timeout_ms = 30000
//!
//! [virtualbox]
//! vboxmanage = "/usr/bin/VBoxManage"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use virtuoso_ensure_state::backend::{FirecrackerConfig, VirtualBoxConfig};
use virtuoso_ensure_state::{DisplayMode, DriverConfig, StateActionMap};
use virtuoso_reconcile::SettlePolicy;

/// Configuration file name.
const CONFIG_FILE: &str = "config.toml";

/// Default location of the configuration file.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "virtuoso", "ensure-state").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Backend selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Machine name or UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,

    /// Display front-end used when starting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_mode: Option<DisplayMode>,

    /// Action to take per observed state.
    #[serde(default)]
    pub states: StateActionMap,

    #[serde(default)]
    pub settle: SettlePolicy,

    #[serde(default)]
    pub virtualbox: VirtualBoxConfig,

    #[serde(default)]
    pub firecracker: FirecrackerConfig,
}

impl Config {
    /// Load an explicitly named file; it must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        match default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Driver settings for the backend registry.
    pub fn drivers(&self) -> DriverConfig {
        DriverConfig {
            virtualbox: self.virtualbox.clone(),
            firecracker: self.firecracker.clone(),
        }
    }
}
