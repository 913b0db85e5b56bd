//! Unix termination via process groups
//!
//! Every child is made the leader of a new process group (`setpgid(0, 0)` in
//! the child before `exec`). Termination then signals the negative pid, which
//! reaches the child and anything it spawned. Signaling only the child is not
//! enough: a grandchild that inherited the stdout/stderr pipes keeps them open
//! and the supervisor's wait for end-of-output would never return.

use super::Terminator;
use crate::{CmdError, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, error};

/// Put the command's child in its own process group
pub fn isolate(command: &mut Command) {
    command.process_group(0);
}

/// Signal number that terminated the process, if any
pub fn exit_signal(status: &ExitStatus) -> Option<i32> {
    status.signal()
}

/// Terminator sending SIGTERM to the process group led by the pid
#[derive(Copy, Clone, Debug, Default)]
pub struct ProcessGroupTerminator;

impl Terminator for ProcessGroupTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }
}

/// Send SIGKILL to the process group led by the pid
pub fn force_kill_group(pid: u32) -> Result<()> {
    signal_group(pid, Signal::SIGKILL)
}

fn signal_group(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| CmdError::Termination(format!("pid {} out of range", pid)))?;
    debug!("Sending {:?} to process group {}", signal, raw);

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            // Group already gone: the process exited on its own
            debug!("Process group {} already exited", raw);
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {:?} to process group {}: {}", signal, raw, e);
            Err(CmdError::Termination(format!(
                "Failed to send {:?} to process group {}: {}",
                signal, raw, e
            )))
        }
    }
}
