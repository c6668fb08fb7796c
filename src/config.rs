//! Validated runtime configuration.
//!
//! All of it comes from the command line (there is no config file) and none
//! of it changes after startup.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Longest supported idle timeout, in seconds (a little over three years).
pub const TIMEOUT_MAX_SECONDS: u64 = 100_000_000;

/// Longest supported grace period, in milliseconds.
pub const GRACE_MAX_MS: u64 = TIMEOUT_MAX_SECONDS * 1000;

/// Which signal suspends the target.
///
/// SIGTSTP is a request the target may catch or ignore; SIGSTOP cannot be
/// caught and always stops the process. Either way SIGCONT resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PauseMethod {
    #[default]
    #[value(name = "SIGTSTP")]
    Tstp,
    #[value(name = "SIGSTOP")]
    Stop,
}

impl PauseMethod {
    /// The signal dispatched to pause the target.
    pub fn signal(self) -> Signal {
        match self {
            Self::Tstp => Signal::SIGTSTP,
            Self::Stop => Signal::SIGSTOP,
        }
    }
}

impl fmt::Display for PauseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tstp => "SIGTSTP",
            Self::Stop => "SIGSTOP",
        })
    }
}

/// What the tool supervises: a command it spawns and owns, or an existing
/// process it only references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Command(String),
    Pid(i32),
}

/// Errors constructing a [`Config`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("either a shell command to run or --pid is required")]
    NoTarget,

    #[error("a shell command and --pid are mutually exclusive")]
    BothTargets,

    #[error("--pid must be at least 1, got {0}")]
    BadPid(i32),
}

/// Validated configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// User idle time after which the command may run.
    pub idle_timeout: Duration,

    /// Initial unrestricted window, so a target that fails fast does so in
    /// plain sight.
    pub grace_period: Duration,

    /// Base delay between activity checks.
    pub poll_interval: Duration,

    /// How the target gets suspended.
    pub pause_method: PauseMethod,

    /// Suppress all normal status output.
    pub quiet: bool,

    /// The process (or command) under supervision.
    pub target: TargetSpec,
}

impl Config {
    /// Build from parsed flag values. `command` words are joined into a
    /// single shell command line.
    pub fn new(
        timeout_seconds: u64,
        grace_ms: u64,
        pause_method: PauseMethod,
        quiet: bool,
        command: Vec<String>,
        pid: Option<i32>,
    ) -> Result<Self, ConfigError> {
        let target = match (command.is_empty(), pid) {
            (false, Some(_)) => return Err(ConfigError::BothTargets),
            (true, None) => return Err(ConfigError::NoTarget),
            (true, Some(pid)) if pid < 1 => return Err(ConfigError::BadPid(pid)),
            (true, Some(pid)) => TargetSpec::Pid(pid),
            (false, None) => TargetSpec::Command(command.join(" ")),
        };

        Ok(Self {
            idle_timeout: Duration::from_secs(timeout_seconds),
            grace_period: Duration::from_millis(grace_ms),
            poll_interval: Duration::from_millis(1000),
            pause_method,
            quiet,
            target,
        })
    }
}
