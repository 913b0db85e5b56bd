//! gcmd binary
//!
//! Runs one command in the background and reports its status until it exits.

use clap::Parser;
use gcmd_cli::{run, Cli, Commands};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = gcmd_core::utils::init_tracing(&cli.log_level) {
        eprintln!("{}", e);
    }

    let result = match &cli.command {
        Commands::Run(args) => run(args).await,
    };

    match result {
        Ok(status) if status.complete => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
