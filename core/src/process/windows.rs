//! Windows termination by pid
//!
//! Windows has no process groups in the POSIX sense, so termination opens the
//! process by pid and calls `TerminateProcess` on it. This is weaker than the
//! Unix strategy: children spawned by the target are not terminated and may
//! keep the output pipes open until they exit.

#![allow(unsafe_code)]

use super::Terminator;
use crate::{CmdError, Result};
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, error};
use ::windows::Win32::Foundation::CloseHandle;
use ::windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

/// No isolation is applied on Windows
pub fn isolate(_command: &mut Command) {}

/// Windows exit statuses never carry a signal
pub fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Terminator that kills the target process directly
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectKillTerminator;

impl Terminator for DirectKillTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        debug!("Terminating process {}", pid);
        // SAFETY: the handle is checked by OpenProcess and closed before return.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, false, pid).map_err(|e| {
                CmdError::Termination(format!("Failed to open process {}: {}", pid, e))
            })?;
            let result = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
            result.map_err(|e| {
                error!("Failed to terminate process {}: {}", pid, e);
                CmdError::Termination(format!("Failed to terminate process {}: {}", pid, e))
            })
        }
    }
}

/// Without process groups a forced kill is the same as termination
pub fn force_kill_group(pid: u32) -> Result<()> {
    DirectKillTerminator.terminate(pid)
}
