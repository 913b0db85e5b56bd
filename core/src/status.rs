//! Point-in-time status of a supervised command

use crate::output::Output;
use serde::Serialize;

/// Snapshot of a command's identity, completion state and captured output
///
/// Returned by value from [`crate::Cmd::status`]; holding one never keeps the
/// command's internal state locked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// OS process id, present once the process has actually been spawned
    pub pid: Option<u32>,
    /// True only if the process exited on its own: not stopped, not signaled,
    /// not cancelled by a deadline
    pub complete: bool,
    /// Exit code, when the process exited with one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal number (POSIX only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Why the process could not be spawned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stdout: Output,
    pub stderr: Output,
}

impl Status {
    /// Whether the spawn itself failed
    pub fn spawn_failed(&self) -> bool {
        self.pid.is_none() && self.error.is_some()
    }
}
