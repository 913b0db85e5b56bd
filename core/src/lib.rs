//! Asynchronous supervision of a single external process
//!
//! Start a subprocess without blocking, poll its status and captured output at
//! any time, and stop it early. A background Tokio task owns the wait on the
//! process; see [`Cmd`].
//!
//! ```rust,no_run
//! use gcmd_core::{CapturePolicy, Cmd};
//!
//! # async fn run() -> gcmd_core::Result<()> {
//! let cmd = Cmd::new("echo", ["hello"]).with_capture(CapturePolicy::History);
//! let status = cmd.start().await;
//! assert!(status.complete);
//! assert_eq!(status.stdout.lines(), Some(&["hello".to_string()][..]));
//! # Ok(())
//! # }
//! ```

pub mod cmd;
pub mod config;
pub mod error;
pub mod output;
pub mod process;
pub mod status;

pub use cmd::{Cmd, Completion};
pub use config::CommandSpec;
pub use error::{CmdError, Result};
pub use output::{CapturePolicy, LatestChunk, LineHistory, Output, OutputSink};
pub use process::{default_terminator, Terminator};
pub use status::Status;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CmdError::Initialization(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
