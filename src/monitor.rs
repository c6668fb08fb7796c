//! The idle-driven control loop.
//!
//! One logical thread of control: poll the idle source, decide whether the
//! target should be paused or running, sleep, repeat. The only asynchrony is
//! OS signal delivery, consumed as stream events inside the same `select!`
//! that performs the sleep, so a termination request cancels whatever sleep
//! is pending and is handled on the next pass through the loop.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

use crate::config::Config;
use crate::idle::IdleSource;
use crate::process::Target;
use crate::signals::ProcessControl;

/// Poll delay before monitoring starts: short, so a target that fails right
/// away is noticed right away.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What one activity check decided to do with the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseAction {
    /// Leave the target as it is.
    Stay,
    /// User became active: suspend the target.
    Pause,
    /// User has been away long enough: wake the target back up.
    Resume,
}

/// Pause/resume decision for one idle reading.
///
/// Pause when the user is active (idle below the timeout) and the target is
/// running; resume when the user has been idle at least the timeout and the
/// target is paused. Anything else keeps the current state, so repeated
/// readings on the same side of the timeout never re-dispatch a signal.
fn next_action(paused: bool, idle: Duration, idle_timeout: Duration) -> PauseAction {
    if idle >= idle_timeout {
        if paused {
            PauseAction::Resume
        } else {
            PauseAction::Stay
        }
    } else if paused {
        PauseAction::Stay
    } else {
        PauseAction::Pause
    }
}

/// Next sleep while the user is active: long enough that the next check
/// lands right where the idle timeout could first be reached, shortened by
/// however long the pause signaling itself took, and never below the base
/// polling interval.
fn active_sleep(
    idle_timeout: Duration,
    idle: Duration,
    pause_overhead: Duration,
    poll_interval: Duration,
) -> Duration {
    idle_timeout
        .saturating_sub(idle)
        .saturating_sub(pause_overhead)
        .max(poll_interval)
}

/// Drives the monitored target until it exits or a termination request is
/// handled: polls the idle source, pauses and resumes the process tree, and
/// forwards interruptions.
pub struct Supervisor<C> {
    config: Config,
    target: Target,
    idle_source: Box<dyn IdleSource>,
    control: C,
    monitoring_started: bool,
    paused: bool,
    interrupted: bool,
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn new(
        config: Config,
        target: Target,
        idle_source: Box<dyn IdleSource>,
        control: C,
    ) -> Self {
        Self {
            config,
            target,
            idle_source,
            control,
            monitoring_started: false,
            paused: false,
            interrupted: false,
        }
    }

    /// Run the control loop; returns the exit code to propagate.
    pub async fn run(mut self) -> Result<i32> {
        let mut sigint = signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;

        let started_at = Instant::now();
        let mut sleep_time = STARTUP_POLL_INTERVAL;
        debug!("starting to monitor user activity");

        loop {
            if self.interrupted {
                return self.handle_interruption().await;
            }

            if !self.monitoring_started {
                let elapsed = started_at.elapsed();
                debug!("{}ms elapsed since the command started", elapsed.as_millis());
                if elapsed >= self.config.grace_period {
                    self.monitoring_started = true;
                }
            }

            let idle = self
                .monitoring_started
                .then(|| self.idle_source.idle_time());

            // Checked after the idle query, so the target keeps running while
            // the query round-trips, and before any pause decision, so a
            // target that just finished is never signaled.
            if let Some(code) = self.target.try_finished()? {
                debug!("PID {} has finished", self.target.pid());
                return Ok(code);
            }

            if let Some(idle) = idle {
                sleep_time = self.check_activity(idle)?;
            }

            debug!("sleeping for {}ms", sleep_time.as_millis());
            tokio::select! {
                () = tokio::time::sleep(sleep_time) => {}
                _ = sigint.recv() => self.forward_interrupt(Signal::SIGINT)?,
                _ = sigterm.recv() => self.forward_interrupt(Signal::SIGTERM)?,
            }
        }
    }

    /// One pause/resume decision; returns the next sleep delay.
    fn check_activity(&mut self, idle: Duration) -> Result<Duration> {
        let timeout = self.config.idle_timeout;
        match next_action(self.paused, idle, timeout) {
            PauseAction::Resume => {
                debug!(
                    "idle time {}ms, idle timeout {}ms, resuming command",
                    idle.as_millis(),
                    timeout.as_millis()
                );
                if !self.config.quiet {
                    println!("Lack of user activity detected.");
                }
                self.control.resume_tree(self.target.pid())?;
                self.paused = false;
                Ok(self.config.poll_interval)
            }
            PauseAction::Pause => {
                debug!("idle time {}ms, user is active", idle.as_millis());
                let pause_started_at = Instant::now();
                self.control.pause_tree(self.target.pid())?;
                self.paused = true;
                Ok(active_sleep(
                    timeout,
                    idle,
                    pause_started_at.elapsed(),
                    self.config.poll_interval,
                ))
            }
            PauseAction::Stay if self.paused => {
                // Still paused, user still around. Idle keeps growing toward
                // the timeout, so the sleep shrinks with it each iteration.
                Ok(active_sleep(
                    timeout,
                    idle,
                    Duration::ZERO,
                    self.config.poll_interval,
                ))
            }
            PauseAction::Stay => Ok(self.config.poll_interval),
        }
    }

    /// Forward a termination request to the target and flag it for the loop.
    ///
    /// This runs in loop context, not in a signal handler: the signal arrived
    /// as a stream event, so dispatching and logging here is safe.
    fn forward_interrupt(&mut self, sig: Signal) -> Result<()> {
        if !self.config.quiet {
            println!("Received {sig}, sending {sig} to the command and waiting for it to finish.");
        }
        self.control.deliver(self.target.pid(), sig)?;
        self.interrupted = true;
        Ok(())
    }

    /// Finish up after a forwarded termination request.
    ///
    /// A paused target cannot act on the forwarded signal, so it is resumed
    /// first. Only an owned target is then waited on; a referenced process is
    /// left to its owner.
    async fn handle_interruption(&mut self) -> Result<i32> {
        if self.paused {
            debug!("command was paused, resuming it so it can handle the interruption");
            self.control.resume_tree(self.target.pid())?;
            self.paused = false;
        }
        self.target.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PauseMethod, TargetSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const MAX: Duration = Duration::MAX;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Dispatched {
        Pause,
        Resume,
        Deliver(Signal),
    }

    #[derive(Clone, Default)]
    struct RecordingControl {
        log: Arc<Mutex<Vec<Dispatched>>>,
    }

    impl RecordingControl {
        fn dispatched(&self) -> Vec<Dispatched> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ProcessControl for RecordingControl {
        fn pause_tree(&mut self, _root: i32) -> Result<()> {
            self.log.lock().unwrap().push(Dispatched::Pause);
            Ok(())
        }

        fn resume_tree(&mut self, _root: i32) -> Result<()> {
            self.log.lock().unwrap().push(Dispatched::Resume);
            Ok(())
        }

        fn deliver(&mut self, _pid: i32, signal: Signal) -> Result<()> {
            self.log.lock().unwrap().push(Dispatched::Deliver(signal));
            Ok(())
        }
    }

    /// Replays a fixed sequence of readings, repeating the last one, and
    /// counts how often it was asked.
    struct ScriptedIdle {
        readings: Vec<Duration>,
        queries: Arc<AtomicUsize>,
    }

    impl ScriptedIdle {
        fn new(readings: Vec<Duration>) -> (Self, Arc<AtomicUsize>) {
            let queries = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    readings,
                    queries: queries.clone(),
                },
                queries,
            )
        }
    }

    impl IdleSource for ScriptedIdle {
        fn idle_time(&mut self) -> Duration {
            let index = self.queries.fetch_add(1, Ordering::Relaxed);
            self.readings[index.min(self.readings.len() - 1)]
        }
    }

    fn test_config(timeout: Duration, grace: Duration, poll: Duration) -> Config {
        Config {
            idle_timeout: timeout,
            grace_period: grace,
            poll_interval: poll,
            pause_method: PauseMethod::Tstp,
            quiet: true,
            target: TargetSpec::Command(String::new()),
        }
    }

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_next_action_decision_table() {
        let timeout = Duration::from_millis(300_000);

        // User inactive: resume only if paused.
        assert_eq!(next_action(true, timeout, timeout), PauseAction::Resume);
        assert_eq!(next_action(true, MAX, timeout), PauseAction::Resume);
        assert_eq!(next_action(false, timeout, timeout), PauseAction::Stay);

        // User active: pause only if running.
        assert_eq!(
            next_action(false, Duration::from_millis(299_999), timeout),
            PauseAction::Pause
        );
        assert_eq!(next_action(false, Duration::ZERO, timeout), PauseAction::Pause);
        assert_eq!(next_action(true, Duration::ZERO, timeout), PauseAction::Stay);
    }

    #[test]
    fn test_repeated_inactive_readings_never_resume() {
        // Never paused means nothing to resume, however long the user is away.
        for _ in 0..5 {
            assert_eq!(next_action(false, MAX, SEC), PauseAction::Stay);
        }
    }

    #[test]
    fn test_active_sleep_targets_timeout_boundary() {
        let timeout = Duration::from_millis(300_000);
        let poll = SEC;

        // Plain case: sleep until idle could first reach the timeout.
        assert_eq!(
            active_sleep(timeout, Duration::from_millis(120_000), Duration::ZERO, poll),
            Duration::from_millis(180_000)
        );

        // Signaling overhead comes out of the sleep.
        assert_eq!(
            active_sleep(
                timeout,
                Duration::from_millis(120_000),
                Duration::from_millis(2_500),
                poll
            ),
            Duration::from_millis(177_500)
        );
    }

    #[test]
    fn test_active_sleep_never_below_poll_interval() {
        let timeout = SEC;
        let poll = SEC;
        assert_eq!(
            active_sleep(timeout, Duration::from_millis(999), Duration::ZERO, poll),
            poll
        );
        assert_eq!(active_sleep(timeout, timeout, SEC, poll), poll);
    }

    #[tokio::test]
    async fn test_grace_period_defers_idle_queries_and_pausing() {
        let (idle, queries) = ScriptedIdle::new(vec![Duration::ZERO]);
        let control = RecordingControl::default();
        let config = test_config(SEC, Duration::from_secs(60), Duration::from_millis(30));
        let target = Target::spawn("sleep 0.4", true).unwrap();

        let supervisor = Supervisor::new(config, target, Box::new(idle), control.clone());
        let code = supervisor.run().await.unwrap();

        assert_eq!(code, 0);
        // The target exited inside the grace period: the user was "active"
        // the whole time, yet nothing was queried or paused.
        assert_eq!(queries.load(Ordering::Relaxed), 0);
        assert!(control.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_idle_user_leaves_target_running_and_propagates_code() {
        let (idle, _) = ScriptedIdle::new(vec![MAX]);
        let control = RecordingControl::default();
        let config = test_config(SEC, Duration::ZERO, Duration::from_millis(30));
        let target = Target::spawn("exit 7", true).unwrap();

        let supervisor = Supervisor::new(config, target, Box::new(idle), control.clone());
        let code = supervisor.run().await.unwrap();

        assert_eq!(code, 7);
        assert!(control.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_pause_then_resume_cycle() {
        // Two active readings (second one while already paused, which must
        // not re-pause), then permanently idle.
        let (idle, _) = ScriptedIdle::new(vec![Duration::ZERO, Duration::ZERO, MAX]);
        let control = RecordingControl::default();
        let config = test_config(
            Duration::from_millis(200),
            Duration::ZERO,
            Duration::from_millis(50),
        );
        let target = Target::spawn("sleep 1", true).unwrap();

        let supervisor = Supervisor::new(config, target, Box::new(idle), control.clone());
        let code = supervisor.run().await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            control.dispatched(),
            vec![Dispatched::Pause, Dispatched::Resume]
        );
    }

    #[tokio::test]
    async fn test_external_target_exit_is_code_zero() {
        let child = std::process::Command::new("sleep")
            .arg("0.3")
            .spawn()
            .unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        // Reap from a helper thread so the PID actually disappears.
        let reaper = std::thread::spawn(move || {
            let mut child = child;
            child.wait().unwrap();
        });

        let (idle, _) = ScriptedIdle::new(vec![MAX]);
        let control = RecordingControl::default();
        let config = test_config(SEC, Duration::ZERO, Duration::from_millis(30));

        let supervisor =
            Supervisor::new(config, Target::external(pid), Box::new(idle), control.clone());
        let code = supervisor.run().await.unwrap();

        assert_eq!(code, 0);
        assert!(control.dispatched().is_empty());
        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn test_interruption_resumes_paused_target_before_waiting() {
        let (idle, _) = ScriptedIdle::new(vec![Duration::ZERO]);
        let control = RecordingControl::default();
        let config = test_config(SEC, Duration::ZERO, Duration::from_millis(30));
        let target = Target::spawn("exit 3", true).unwrap();

        let mut supervisor = Supervisor::new(config, target, Box::new(idle), control.clone());
        supervisor.paused = true;
        supervisor.interrupted = true;

        let code = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .expect("interruption handling hung")
            .unwrap();

        // Resume must come before the wait, and the target's own exit code
        // is what propagates.
        assert_eq!(code, 3);
        assert_eq!(control.dispatched(), vec![Dispatched::Resume]);
    }
}
