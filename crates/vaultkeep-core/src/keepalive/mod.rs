//! Session keepalive.
//!
//! PasswordVault drops a session after 20 minutes without a request. The
//! keepalive is a detached copy of this program that pings the vault every
//! 15 to 19 minutes (randomised) until a hard timeout of ~9 hours, or until
//! the token disappears or stops working.
//!
//! - `watchdog`: the loop and the detached process entry point
//! - `process`: spawning, finding and stopping the detached process
//! - `log`: the append-only audit log the watchdog writes

pub mod log;
pub mod process;
pub mod watchdog;

pub use log::KeepaliveLog;
pub use process::{
    process_alive, stop_requested, LaunchError, ProcessLauncher, WatchdogArgs, WatchdogHandle,
    WatchdogLauncher,
};
pub use watchdog::{run_from_args, ExitReason, Watchdog, WatchdogReport};
