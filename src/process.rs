//! Monitored-target lifecycle: spawning, liveness polling, reaping.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

/// The process under supervision.
///
/// An owned target was spawned by us: we reap it, and its exit code is
/// authoritative. A referenced target belongs to someone else: liveness is
/// checked with a null-signal probe, and since no exit code is obtainable its
/// disappearance counts as success.
pub enum Target {
    Owned { child: Child, pid: i32 },
    External { pid: i32 },
}

impl Target {
    /// Spawn `command` through the shell and take ownership of it.
    pub fn spawn(command: &str, quiet: bool) -> Result<Self> {
        debug!("starting {command:?}");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .with_context(|| format!("failed to start {command:?}"))?;
        let Some(pid) = child.id() else {
            bail!("{command:?} exited before it could be monitored");
        };
        let pid = i32::try_from(pid).context("child PID out of range")?;
        if !quiet {
            println!("Started {command:?} with PID {pid}");
        }
        Ok(Self::Owned { child, pid })
    }

    /// Reference an already-running process without owning it.
    pub fn external(pid: i32) -> Self {
        Self::External { pid }
    }

    pub fn pid(&self) -> i32 {
        match self {
            Self::Owned { pid, .. } | Self::External { pid } => *pid,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned { .. })
    }

    /// Non-blocking completion check.
    ///
    /// Owned: reap via `try_wait`; a stopped child produces no exit status,
    /// so a paused target is never mistaken for a finished one. External:
    /// probe with the null signal; once the PID is gone the target counts as
    /// finished with code 0.
    pub fn try_finished(&mut self) -> Result<Option<i32>> {
        match self {
            Self::Owned { child, pid } => {
                let status = child
                    .try_wait()
                    .with_context(|| format!("failed to poll PID {pid}"))?;
                Ok(status.map(exit_code))
            }
            Self::External { pid } => match kill(Pid::from_raw(*pid), None) {
                Ok(()) => Ok(None),
                Err(Errno::ESRCH) => Ok(Some(0)),
                // Alive but owned by another user. Still answers the only
                // question the probe asks.
                Err(Errno::EPERM) => Ok(None),
                Err(errno) => bail!("failed to probe PID {pid}: {errno}"),
            },
        }
    }

    /// Block until the target exits and return its exit code.
    ///
    /// Only an owned target is actually waited on; a referenced process is
    /// left to its real parent and reports 0.
    pub async fn wait(&mut self) -> Result<i32> {
        match self {
            Self::Owned { child, pid } => {
                let status = child
                    .wait()
                    .await
                    .with_context(|| format!("failed to wait for PID {pid}"))?;
                let code = exit_code(status);
                debug!("PID {pid} has finished with exit code {code}");
                Ok(code)
            }
            Self::External { .. } => Ok(0),
        }
    }
}

/// The code this program should propagate for a finished child: its own exit
/// code, or 128+N when signal N killed it (shell convention).
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
