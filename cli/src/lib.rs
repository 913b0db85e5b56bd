//! Command-line front end for gcmd
//!
//! Parses `gcmd run` arguments into a [`CommandSpec`], drives a [`Cmd`] to
//! completion while printing its status on every poll tick, and reports the
//! final outcome.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use gcmd_core::config::load_spec_from_toml_path;
use gcmd_core::{CapturePolicy, Cmd, CommandSpec, Output, Status};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gcmd")]
#[command(about = "Run a command in the background and watch it until it finishes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command, printing its status until it exits
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// TOML file describing the command (CMD must then be omitted)
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    pub config: Option<PathBuf>,

    /// Working directory of the process
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Environment variable for the process; any use replaces the inherited environment
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,

    /// Kill the process after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Stop the process after this many milliseconds
    #[arg(long)]
    pub stop_after_ms: Option<u64>,

    /// Keep every output line instead of only the latest chunk
    #[arg(long)]
    pub history: bool,

    /// Interval between status reports
    #[arg(long, default_value_t = 1000)]
    pub poll_ms: u64,

    /// Print statuses as JSON
    #[arg(long)]
    pub json: bool,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    pub command: Vec<String>,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Merge the config file (if any) with command-line overrides
pub fn build_spec(args: &RunArgs) -> anyhow::Result<CommandSpec> {
    let mut spec = match &args.config {
        Some(path) => load_spec_from_toml_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let Some((command, rest)) = args.command.split_first() else {
                bail!("no command given; pass CMD or --config");
            };
            CommandSpec {
                command: command.clone(),
                args: rest.to_vec(),
                ..Default::default()
            }
        }
    };

    if let Some(dir) = &args.dir {
        spec.working_directory = Some(dir.clone());
    }
    spec.environment.extend(args.env.iter().cloned());
    if args.timeout_ms.is_some() {
        spec.timeout_ms = args.timeout_ms;
    }
    if args.history {
        spec.capture = CapturePolicy::History;
    }
    spec.validate()?;
    Ok(spec)
}

fn describe_output(output: &Output) -> String {
    match output {
        Output::None => "-".to_string(),
        Output::Lines(lines) => match lines.last() {
            Some(last) => format!("{} lines, last: {:?}", lines.len(), last),
            None => "0 lines".to_string(),
        },
        Output::Latest(chunk) => format!("{:?}", chunk.trim_end()),
    }
}

/// Render a status as a single line
pub fn format_status(status: &Status, json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string(status)?);
    }
    let pid = status
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    let mut line = format!(
        "pid={} complete={} stdout={} stderr={}",
        pid,
        status.complete,
        describe_output(&status.stdout),
        describe_output(&status.stderr)
    );
    if let Some(code) = status.exit_code {
        line.push_str(&format!(" exit={}", code));
    }
    if let Some(signal) = status.signal {
        line.push_str(&format!(" signal={}", signal));
    }
    if let Some(error) = &status.error {
        line.push_str(&format!(" error={:?}", error));
    }
    Ok(line)
}

async fn stop_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run the command described by `args` and return its final status
pub async fn run(args: &RunArgs) -> anyhow::Result<Status> {
    let spec = build_spec(args)?;
    let cmd = Cmd::from_spec(&spec)?;
    info!("Running {} {:?}", spec.command, spec.args);

    let completion = cmd.start();
    let mut ticker = interval(Duration::from_millis(args.poll_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;
    let mut stop_at = args
        .stop_after_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let status = loop {
        tokio::select! {
            status = completion.wait() => break status,
            _ = stop_timer(stop_at), if stop_at.is_some() => {
                stop_at = None;
                if let Err(e) = cmd.stop() {
                    warn!("Failed to stop {}: {}", spec.command, e);
                }
            }
            _ = ticker.tick() => {
                println!("{}", format_status(&cmd.status(), args.json)?);
            }
        }
    };
    println!("{}", format_status(&status, args.json)?);
    Ok(status)
}
