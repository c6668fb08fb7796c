//! User idle-time detection via the X11 MIT-SCREEN-SAVER extension.
//!
//! The X server tracks milliseconds since the last keyboard or mouse input;
//! one round trip reads it back. When no display (or no extension) is
//! available there is nothing to measure, and the oracle reports the user as
//! permanently idle so the supervised command keeps running: a batch job
//! finishing while the user happens to be around beats a batch job never
//! finishing at all.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::screensaver::{self, ConnectionExt as _};
use x11rb::protocol::xproto::Window;
use x11rb::rust_connection::RustConnection;

/// Idle time reported when no idle source exists: effectively infinite, so
/// every timeout comparison sees an inactive user.
pub const IDLE_TIME_UNAVAILABLE: Duration = Duration::MAX;

/// Source of "time since last user input" readings.
///
/// Seam for tests: the control loop takes any source, real or scripted.
pub trait IdleSource {
    /// Current idle time, or [`IDLE_TIME_UNAVAILABLE`] when unknown.
    fn idle_time(&mut self) -> Duration;
}

/// Errors probing for an idle-time source.
#[derive(Error, Debug)]
pub enum IdleError {
    #[error("could not open an X11 display: {0}")]
    Connect(#[from] x11rb::errors::ConnectError),

    #[error("X server does not support the MIT-SCREEN-SAVER extension")]
    ExtensionMissing,

    #[error("X11 request failed: {0}")]
    Request(#[from] x11rb::errors::ConnectionError),

    #[error("X11 reply failed: {0}")]
    Reply(#[from] x11rb::errors::ReplyError),
}

/// Idle readings from the X server's screensaver extension.
pub struct ScreenSaverIdle {
    conn: RustConnection,
    root: Window,
}

impl ScreenSaverIdle {
    /// Connect to the display and verify the extension works.
    pub fn connect() -> Result<Self, IdleError> {
        let (conn, screen_num) = x11rb::connect(None)?;
        if conn
            .extension_information(screensaver::X11_EXTENSION_NAME)?
            .is_none()
        {
            return Err(IdleError::ExtensionMissing);
        }
        let root = conn.setup().roots[screen_num].root;

        // Probe once up front so a broken extension surfaces at startup
        // instead of mid-monitoring.
        conn.screensaver_query_info(root)?.reply()?;

        Ok(Self { conn, root })
    }

    fn query(&self) -> Result<Duration, IdleError> {
        let reply = self.conn.screensaver_query_info(self.root)?.reply()?;
        Ok(Duration::from_millis(u64::from(reply.ms_since_user_input)))
    }
}

impl IdleSource for ScreenSaverIdle {
    fn idle_time(&mut self) -> Duration {
        self.query().unwrap_or_else(|err| {
            warn!("idle time query failed ({err}), treating the user as idle");
            IDLE_TIME_UNAVAILABLE
        })
    }
}

/// Stands in when no real source exists; always reports the user as idle.
pub struct AlwaysIdle;

impl IdleSource for AlwaysIdle {
    fn idle_time(&mut self) -> Duration {
        IDLE_TIME_UNAVAILABLE
    }
}

/// Detect the best available idle source.
///
/// Falls back to [`AlwaysIdle`] with a one-time warning when X11 idle
/// detection is unavailable; the command then runs unrestricted.
pub fn detect() -> Box<dyn IdleSource> {
    match ScreenSaverIdle::connect() {
        Ok(source) => Box::new(source),
        Err(err) => {
            warn!(
                "no available method for detecting user idle time ({err}); \
                 the user will be considered idle so the command can finish"
            );
            Box::new(AlwaysIdle)
        }
    }
}
