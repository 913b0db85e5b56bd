//! Loading command definitions from TOML
//!
//! A [`CommandSpec`] describes one command to supervise. Keys are camelCase:
//!
//! ```toml
//! command = "ffmpeg"
//! args = ["-re", "-i", "in.mp4", "-f", "flv", "out.flv"]
//! workingDirectory = "/srv/media"
//! timeoutMs = 30000
//! capture = "latest"
//! mergeStderr = false
//!
//! [environment]
//! PATH = "/usr/bin"
//! ```

use crate::output::CapturePolicy;
use crate::{Cmd, CmdError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Definition of one supervised command
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommandSpec {
    /// Executable name or path
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Replaces the inherited environment when non-empty
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Kill the process this many milliseconds after the command is built
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub capture: CapturePolicy,
    /// Capture stderr into the stdout sink
    #[serde(default)]
    pub merge_stderr: bool,
}

impl CommandSpec {
    /// Check the spec for values that can never run
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(CmdError::Validation("command: cannot be empty".to_string()));
        }
        for key in self.environment.keys() {
            if key.is_empty() {
                return Err(CmdError::Validation(
                    "environment: variable name cannot be empty".to_string(),
                ));
            }
            if key.contains('=') {
                return Err(CmdError::Validation(format!(
                    "environment.{}: variable name cannot contain '='",
                    key
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(CmdError::Validation(
                "timeoutMs: must be greater than 0".to_string(),
            ));
        }
        if let Some(dir) = &self.working_directory {
            if dir.as_os_str().is_empty() {
                return Err(CmdError::Validation(
                    "workingDirectory: cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parse and validate a spec from TOML text
pub fn parse_spec_str(s: &str) -> Result<CommandSpec> {
    let spec: CommandSpec = toml::from_str(s)?;
    spec.validate()?;
    Ok(spec)
}

/// Load and validate a spec from a TOML file
pub fn load_spec_from_toml_path(path: impl AsRef<Path>) -> Result<CommandSpec> {
    let path = path.as_ref();
    debug!("Loading command spec from {}", path.display());
    let text = fs::read_to_string(path).map_err(|e| {
        CmdError::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_spec_str(&text)
}

impl Cmd {
    /// Build an unstarted command from a validated spec
    pub fn from_spec(spec: &CommandSpec) -> Result<Self> {
        spec.validate()?;
        let cmd = match spec.timeout_ms {
            Some(ms) => Cmd::new_with_timeout(
                Duration::from_millis(ms),
                spec.command.clone(),
                spec.args.iter().cloned(),
            ),
            None => Cmd::new(spec.command.clone(), spec.args.iter().cloned()),
        };
        let cmd = cmd.with_capture(spec.capture);
        let cmd = if spec.merge_stderr { cmd.merge_output() } else { cmd };
        if let Some(dir) = &spec.working_directory {
            cmd.set_dir(dir.clone())?;
        }
        cmd.set_env(spec.environment.clone())?;
        Ok(cmd)
    }
}
