//! Command line surface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::debug;
use virtuoso_ensure_state::backend::virtualbox;
use virtuoso_ensure_state::{
    Action, BackendRegistry, ConvergeRequest, DisplayMode, Engine, Outcome, StateActionMap,
    VmState,
};
use virtuoso_reconcile::SettlePolicy;

use crate::config::{self, Config};
use crate::error::CliError;
use crate::logging::LogFormat;

/// Converge a virtual machine to a declared runtime state.
///
/// The machine's current state is looked up in the `--if` map; if an action
/// is declared for it, that one action is applied. Otherwise nothing happens.
#[derive(Debug, Parser)]
#[command(name = "ensure-state")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: the user config directory).
    #[arg(short, long, env = "ENSURE_STATE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Hypervisor backend (default: virtualbox).
    #[arg(short, long, env = "ENSURE_STATE_BACKEND")]
    pub backend: Option<String>,

    /// Virtual machine name or UUID.
    #[arg(short, long, env = "ENSURE_STATE_MACHINE")]
    pub machine: Option<String>,

    /// Action to take when the machine is in a state, e.g. `powered-off=start`.
    #[arg(long = "if", value_name = "STATE=ACTION", value_parser = parse_if)]
    pub if_state: Vec<(VmState, Action)>,

    /// Display front-end used when starting the machine.
    #[arg(long, env = "ENSURE_STATE_DISPLAY_MODE", value_name = "MODE")]
    pub display_mode: Option<DisplayMode>,

    /// Delay between state checks while a transition settles.
    #[arg(long, env = "ENSURE_STATE_SETTLE_INTERVAL_MS", value_name = "MS")]
    pub settle_interval_ms: Option<u64>,

    /// Maximum time a transition may take to settle.
    #[arg(long, env = "ENSURE_STATE_SETTLE_TIMEOUT_MS", value_name = "MS")]
    pub settle_timeout_ms: Option<u64>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "ENSURE_STATE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print the recognized machine states and exit.
    #[arg(long, conflicts_with = "list_actions")]
    pub list_states: bool,

    /// Print the recognized actions and exit.
    #[arg(long)]
    pub list_actions: bool,
}

fn parse_if(pair: &str) -> Result<(VmState, Action), CliError> {
    StateActionMap::parse_pair(pair).map_err(|e| CliError::InvalidPair {
        pair: pair.to_string(),
        reason: e.to_string(),
    })
}

/// Everything needed for one run, after merging flags over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub request: ConvergeRequest,
    pub settle: SettlePolicy,
    pub config: Config,
}

impl Cli {
    /// Merge command line values over `config`.
    pub fn settings(&self, config: Config) -> Result<Settings> {
        let machine = self
            .machine
            .clone()
            .or_else(|| config.machine.clone())
            .ok_or(CliError::MissingMachine)?;

        let backend = self
            .backend
            .clone()
            .or_else(|| config.backend.clone())
            .unwrap_or_else(|| virtualbox::NAME.to_string());

        let mut desired = config.states.clone();
        desired.extend(self.if_state.iter().copied());

        let mut settle = config.settle;
        if let Some(ms) = self.settle_interval_ms {
            settle.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.settle_timeout_ms {
            settle.timeout = Duration::from_millis(ms);
        }

        Ok(Settings {
            request: ConvergeRequest {
                backend,
                machine,
                desired,
                display_mode: self.display_mode.or(config.display_mode),
            },
            settle,
            config,
        })
    }

    /// Run the CLI.
    pub fn run(self) -> Result<()> {
        if self.list_states {
            for state in VmState::ALL {
                println!("{state}");
            }
            return Ok(());
        }
        if self.list_actions {
            for action in Action::ALL {
                println!("{action}");
            }
            return Ok(());
        }

        let file = Config::load(self.config.as_deref())?;
        let settings = self.settings(file)?;
        debug!(
            config = ?self.config.clone().or_else(config::default_path),
            backend = %settings.request.backend,
            entries = settings.request.desired.len(),
            "Settings resolved"
        );

        let registry = BackendRegistry::builtin(settings.config.drivers());
        let outcome = Engine::new(registry)
            .with_settle(settings.settle)
            .converge(&settings.request)?;

        print_outcome(&outcome);
        Ok(())
    }
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Unchanged { machine, state } => {
            println!("{} {} is {}, nothing to do", "ok".green(), machine.bold(), state);
        }
        Outcome::Transitioned {
            machine,
            action,
            from,
        } => {
            println!(
                "{} {} was {}, applied {}",
                "changed".yellow(),
                machine.bold(),
                from,
                action.to_string().cyan()
            );
        }
    }
}
