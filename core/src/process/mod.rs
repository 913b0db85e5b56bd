//! Platform-specific process plumbing
//!
//! Everything that touches OS-specific process APIs lives here, behind the
//! [`Terminator`] strategy and a handful of free functions used at spawn and
//! exit time. The supervisor in [`crate::cmd`] only ever deals with pids.
//!
//! ## Platform Support
//!
//! - **Unix**: the child is placed in its own process group at spawn time and
//!   termination signals the whole group.
//! - **Windows**: there is no process group to signal; the process is opened by
//!   pid and terminated directly. Descendants it spawned may survive.

use crate::Result;
use std::fmt;
use std::sync::Arc;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use self::unix::{exit_signal, force_kill_group, isolate, ProcessGroupTerminator};
#[cfg(windows)]
pub use self::windows::{exit_signal, force_kill_group, isolate, DirectKillTerminator};

/// Strategy for asking a running process to terminate
///
/// Implementations deliver the request and return; they never wait for the
/// process to exit.
pub trait Terminator: Send + Sync + fmt::Debug {
    /// Request termination of the process identified by `pid`
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Terminator for the platform this crate was built for
pub fn default_terminator() -> Arc<dyn Terminator> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupTerminator)
    }
    #[cfg(windows)]
    {
        Arc::new(DirectKillTerminator)
    }
}
