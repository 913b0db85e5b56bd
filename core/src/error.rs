//! Error types for process supervision

use thiserror::Error;

/// Errors surfaced by [`crate::Cmd`] and its supporting modules
///
/// Spawn failures are not represented here: they are recorded on the
/// [`crate::Status`] of the command instead of being returned from a call.
#[derive(Error, Debug)]
pub enum CmdError {
    #[error("command not running")]
    NotRunning,

    #[error("command already started")]
    AlreadyStarted,

    #[error("Termination error: {0}")]
    Termination(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CmdError {
    /// Stable error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CmdError::NotRunning => "GCMD001",
            CmdError::AlreadyStarted => "GCMD002",
            CmdError::Termination(_) => "GCMD003",
            CmdError::Configuration(_) => "GCMD004",
            CmdError::Validation(_) => "GCMD005",
            CmdError::Initialization(_) => "GCMD006",
            CmdError::Io(_) => "GCMD007",
            CmdError::Toml(_) => "GCMD008",
            CmdError::Other(_) => "GCMD999",
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, CmdError>;

impl From<&str> for CmdError {
    fn from(s: &str) -> Self {
        CmdError::Other(s.to_string())
    }
}

impl From<String> for CmdError {
    fn from(s: String) -> Self {
        CmdError::Other(s)
    }
}
