//! idlerun - run a command only while the user is away.
//!
//! Watches how long the desktop session has been idle and suspends the
//! supervised command (and its descendants) whenever the user is active,
//! resuming it once they have been idle long enough. Long-running batch jobs
//! get the machine to themselves exactly when nobody else wants it.

mod config;
mod idle;
mod monitor;
mod proc_tree;
mod process;
mod signals;

use std::io::IsTerminal;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, GRACE_MAX_MS, PauseMethod, TIMEOUT_MAX_SECONDS, TargetSpec};
use crate::monitor::Supervisor;
use crate::process::Target;
use crate::signals::SignalDispatcher;

/// Run a shell command, pausing it whenever the user is active.
#[derive(Parser, Debug)]
#[command(name = "idlerun")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// User idle time in seconds after which the command may run.
    #[arg(
        short = 't',
        long,
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..=TIMEOUT_MAX_SECONDS)
    )]
    timeout: u64,

    /// Initial delay in milliseconds before monitoring starts. The command
    /// runs unrestricted during it, which helps to catch quick errors.
    #[arg(
        short = 'a',
        long = "start-monitor-after",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(0..=GRACE_MAX_MS)
    )]
    start_monitor_after: u64,

    /// Signal used to pause the command.
    #[arg(
        short = 'm',
        long,
        value_enum,
        ignore_case = true,
        default_value_t = PauseMethod::Tstp
    )]
    pause_method: PauseMethod,

    /// Monitor an existing process instead of starting one.
    #[arg(
        short = 'p',
        long,
        conflicts_with = "command",
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    pid: Option<i32>,

    /// Enable verbose output for monitoring.
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Enable debugging output.
    #[arg(long, conflicts_with = "quiet")]
    debug: bool,

    /// Suppress all program output except errors.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Shell command to run, with its arguments.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required_unless_present = "pid"
    )]
    command: Vec<String>,
}

impl Args {
    /// Filter level the verbosity flags map to.
    fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // --help and --version land here too; only real usage errors
            // exit non-zero.
            let ok = matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            );
            let _ = err.print();
            exit(i32::from(!ok));
        }
    };

    if let Err(err) = init_logging(&args) {
        eprintln!("{err:#}");
        exit(1);
    }

    let config = match Config::new(
        args.timeout,
        args.start_monitor_after,
        args.pause_method,
        args.quiet,
        args.command,
        args.pid,
    ) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            exit(1);
        }
    };

    match run(config).await {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err:#}");
            exit(1);
        }
    }
}

/// Diagnostics go to stderr, colorized when that is a terminal; normal
/// status lines go to stdout separately.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idlerun={}", args.log_level()))
        .context("invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<i32> {
    // Probe for an idle source before starting the target, so the one-time
    // fail-open warning comes out ahead of any command output.
    let idle_source = idle::detect();

    let target = match &config.target {
        TargetSpec::Command(command) => Target::spawn(command, config.quiet)?,
        TargetSpec::Pid(pid) => Target::external(*pid),
    };

    let dispatcher = SignalDispatcher::new(config.pause_method, config.quiet);
    Supervisor::new(config, target, idle_source, dispatcher)
        .run()
        .await
}
