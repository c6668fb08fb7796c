//! Pause/resume signal dispatch with error classification.
//!
//! A failed signal to the supervised process is unrecoverable for this tool:
//! retrying risks leaving the target half-suspended, so every failure here is
//! reported upward and ends the program.

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

use crate::config::PauseMethod;
use crate::proc_tree;

/// A signal that could not be delivered, classified from the OS error.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no permission to send {signal} to PID {pid}")]
    PermissionDenied { signal: Signal, pid: i32 },

    #[error("failed to send {signal}: PID {pid} no longer exists")]
    ProcessGone { signal: Signal, pid: i32 },

    #[error("{signal} is not a valid signal on this system")]
    InvalidSignal { signal: Signal },

    #[error("failed to send {signal} to PID {pid}: {errno}")]
    Other {
        signal: Signal,
        pid: i32,
        errno: Errno,
    },
}

/// Operations the control loop performs on the monitored process tree.
///
/// Seam for tests: the loop's decision logic can be exercised against a
/// recording fake instead of live processes.
pub trait ProcessControl {
    /// Suspend `root` and all of its descendants.
    fn pause_tree(&mut self, root: i32) -> Result<()>;

    /// Wake `root` and all of its descendants back up.
    fn resume_tree(&mut self, root: i32) -> Result<()>;

    /// Deliver an arbitrary signal to one process.
    fn deliver(&mut self, pid: i32, signal: Signal) -> Result<()>;
}

/// Sends pause/resume signals to real processes.
pub struct SignalDispatcher {
    pause_signal: Signal,
    quiet: bool,
}

impl SignalDispatcher {
    pub fn new(method: PauseMethod, quiet: bool) -> Self {
        Self {
            pause_signal: method.signal(),
            quiet,
        }
    }

    /// Send `signal` to `pid`, classifying any failure.
    fn send(&self, pid: i32, signal: Signal) -> Result<(), DispatchError> {
        debug!("sending {signal} to PID {pid}");
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::EPERM) => Err(DispatchError::PermissionDenied { signal, pid }),
            Err(Errno::ESRCH) => Err(DispatchError::ProcessGone { signal, pid }),
            Err(Errno::EINVAL) => Err(DispatchError::InvalidSignal { signal }),
            Err(errno) => Err(DispatchError::Other { signal, pid, errno }),
        }
    }

    fn pause(&self, pid: i32) -> Result<(), DispatchError> {
        if !self.quiet {
            println!("Pausing PID {pid}");
        }
        self.send(pid, self.pause_signal)
    }

    fn resume(&self, pid: i32) -> Result<(), DispatchError> {
        if !self.quiet {
            println!("Resuming PID {pid}");
        }
        self.send(pid, Signal::SIGCONT)
    }
}

impl ProcessControl for SignalDispatcher {
    /// Root first, then descendants in discovery order. The descendant set is
    /// re-enumerated on every call; children can have come and gone since the
    /// last cycle.
    fn pause_tree(&mut self, root: i32) -> Result<()> {
        self.pause(root)?;
        for pid in proc_tree::descendants(root)? {
            self.pause(pid)?;
        }
        Ok(())
    }

    fn resume_tree(&mut self, root: i32) -> Result<()> {
        self.resume(root)?;
        for pid in proc_tree::descendants(root)? {
            self.resume(pid)?;
        }
        Ok(())
    }

    fn deliver(&mut self, pid: i32, signal: Signal) -> Result<()> {
        self.send(pid, signal)?;
        Ok(())
    }
}
