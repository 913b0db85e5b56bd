//! The process supervisor
//!
//! A [`Cmd`] owns one external process from configuration to completion. The
//! blocking part of the lifecycle (spawn, wait, drain output) runs on a Tokio
//! task; callers interact through cheap, non-blocking calls:
//!
//! ```text
//! NotStarted → Starting → Running → { Completed | Stopped | Signaled | SpawnFailed } → Done
//! ```
//!
//! - [`Cmd::start`] spawns the background task once and returns a
//!   [`Completion`] that resolves with the final [`Status`].
//! - [`Cmd::status`] returns a snapshot at any time without waiting.
//! - [`Cmd::stop`] asks the platform [`Terminator`] to end the process.
//!
//! All mutable state sits behind a single private mutex. Output is frozen into
//! the stored status exactly once, by the first reader that observes the
//! process as done, and the sinks are released at that point.

use crate::output::{CapturePolicy, OutputSink};
use crate::process::{self, Terminator};
use crate::status::Status;
use crate::{CmdError, Result};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long output readers may keep running once the process has exited.
/// A descendant holding the pipes open must not hang finalization.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// External trigger that kills the process when it fires
#[derive(Debug, Clone)]
enum Trigger {
    Deadline(Instant),
    Token(CancellationToken),
}

impl Trigger {
    fn has_fired(&self) -> bool {
        match self {
            Trigger::Deadline(deadline) => Instant::now() >= *deadline,
            Trigger::Token(token) => token.is_cancelled(),
        }
    }

    async fn fired(trigger: Option<Trigger>) {
        match trigger {
            Some(Trigger::Deadline(deadline)) => tokio::time::sleep_until(deadline).await,
            Some(Trigger::Token(token)) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
struct State {
    /// `start` has been called
    launched: bool,
    /// The OS process exists
    started: bool,
    stopped: bool,
    /// The process has been reaped; output may still be draining
    exited: bool,
    done: bool,
    finalized: bool,
    status: Status,
    stdout: Option<Arc<dyn OutputSink>>,
    stderr: Option<Arc<dyn OutputSink>>,
    env: Vec<(String, String)>,
    dir: Option<PathBuf>,
    terminator: Arc<dyn Terminator>,
}

/// Configuration copied out of [`State`] when the background task starts
struct Launch {
    stdout: Option<Arc<dyn OutputSink>>,
    stderr: Option<Arc<dyn OutputSink>>,
    env: Vec<(String, String)>,
    dir: Option<PathBuf>,
}

#[derive(Debug)]
struct Inner {
    program: String,
    args: Vec<String>,
    trigger: Option<Trigger>,
    state: Mutex<State>,
    done_tx: watch::Sender<Option<Status>>,
}

/// Supervisor for a single external process
///
/// Cloning a `Cmd` yields another handle to the same process.
#[derive(Clone)]
pub struct Cmd {
    inner: Arc<Inner>,
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("program", &self.inner.program)
            .field("args", &self.inner.args)
            .finish_non_exhaustive()
    }
}

impl Cmd {
    /// Create a supervisor for `program` with the given arguments
    ///
    /// Both output streams are captured with [`CapturePolicy::Latest`] unless
    /// reconfigured before [`Cmd::start`].
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(program.into(), args, None)
    }

    /// Create a supervisor whose process is killed once `deadline` passes
    pub fn new_with_deadline<I, S>(deadline: Instant, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(program.into(), args, Some(Trigger::Deadline(deadline)))
    }

    /// Like [`Cmd::new_with_deadline`] with the deadline `timeout` from now
    pub fn new_with_timeout<I, S>(timeout: Duration, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new_with_deadline(Instant::now() + timeout, program, args)
    }

    /// Create a supervisor whose process is killed when `token` is cancelled
    pub fn new_with_cancel<I, S>(
        token: CancellationToken,
        program: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(program.into(), args, Some(Trigger::Token(token)))
    }

    fn build<I, S>(program: String, args: I, trigger: Option<Trigger>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (done_tx, _) = watch::channel(None);
        let state = State {
            launched: false,
            started: false,
            stopped: false,
            exited: false,
            done: false,
            finalized: false,
            status: Status::default(),
            stdout: CapturePolicy::Latest.sink(),
            stderr: CapturePolicy::Latest.sink(),
            env: Vec::new(),
            dir: None,
            terminator: process::default_terminator(),
        };
        Self {
            inner: Arc::new(Inner {
                program,
                args: args.into_iter().map(Into::into).collect(),
                trigger,
                state: Mutex::new(state),
                done_tx,
            }),
        }
    }

    /// Capture both streams separately with `policy`
    pub fn with_capture(self, policy: CapturePolicy) -> Self {
        self.configure(|state| {
            state.stdout = policy.sink();
            state.stderr = policy.sink();
        })
    }

    /// Use `sink` for standard output
    pub fn with_stdout(self, sink: Arc<dyn OutputSink>) -> Self {
        self.configure(|state| state.stdout = Some(sink))
    }

    /// Use `sink` for standard error
    ///
    /// With `None`, standard error shares the standard output sink. A stream
    /// is only discarded when neither sink is set.
    pub fn with_stderr(self, sink: Option<Arc<dyn OutputSink>>) -> Self {
        self.configure(|state| state.stderr = sink)
    }

    /// Send standard error into the standard output sink
    pub fn merge_output(self) -> Self {
        self.configure(|state| state.stderr = None)
    }

    /// Do not capture either stream
    pub fn discard_output(self) -> Self {
        self.with_capture(CapturePolicy::Discard)
    }

    /// Replace the platform terminator used by [`Cmd::stop`]
    pub fn with_terminator(self, terminator: Arc<dyn Terminator>) -> Self {
        self.configure(|state| state.terminator = terminator)
    }

    fn configure(self, apply: impl FnOnce(&mut State)) -> Self {
        {
            let mut state = self.inner.lock();
            if state.launched {
                warn!("Ignoring output configuration for '{}': already started", self.inner.program);
            } else {
                apply(&mut state);
            }
        }
        self
    }

    /// Set the working directory of the process
    pub fn set_dir(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let mut state = self.inner.lock();
        if state.launched {
            return Err(CmdError::AlreadyStarted);
        }
        state.dir = Some(dir.into());
        Ok(())
    }

    /// Set the process environment
    ///
    /// A non-empty set replaces the inherited environment entirely; an empty
    /// one leaves the inherited environment in place.
    pub fn set_env<I, K, V>(&self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut state = self.inner.lock();
        if state.launched {
            return Err(CmdError::AlreadyStarted);
        }
        state.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Ok(())
    }

    /// Start the process on a background task
    ///
    /// Calling this again returns a handle to the same completion without
    /// spawning another process. Outside a Tokio runtime the command finishes
    /// immediately as a spawn failure.
    pub fn start(&self) -> Completion {
        let completion = self.done();
        let launch = {
            let mut state = self.inner.lock();
            if state.launched {
                return completion;
            }
            state.launched = true;
            // A single configured sink receives both streams
            Launch {
                stdout: state.stdout.clone().or_else(|| state.stderr.clone()),
                stderr: state.stderr.clone().or_else(|| state.stdout.clone()),
                env: state.env.clone(),
                dir: state.dir.clone(),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(inner.run(launch));
            }
            Err(e) => {
                error!("Cannot start '{}': {}", self.inner.program, e);
                self.inner
                    .fail_spawn(format!("no Tokio runtime available: {}", e));
            }
        }
        completion
    }

    /// Request termination of the running process
    ///
    /// Returns immediately; the background task observes the exit. Repeated
    /// calls, and calls after the process finished, are no-ops. Fails with
    /// [`CmdError::NotRunning`] if the process was never successfully spawned.
    pub fn stop(&self) -> Result<()> {
        let (pid, terminator) = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Ok(());
            }
            if !state.started {
                return Err(CmdError::NotRunning);
            }
            if state.done {
                return Ok(());
            }
            if state.exited {
                // Reaped but still draining: the group id may already be reused
                debug!("'{}' already exited, not signalling", self.inner.program);
                return Ok(());
            }
            let Some(pid) = state.status.pid else {
                return Err(CmdError::NotRunning);
            };
            state.stopped = true;
            (pid, state.terminator.clone())
        };

        info!("Stopping '{}' (pid {})", self.inner.program, pid);
        terminator.terminate(pid)
    }

    /// Current status, without blocking
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// A handle resolving once the command is done
    ///
    /// Usable before [`Cmd::start`]; it resolves only after a start.
    pub fn done(&self) -> Completion {
        Completion {
            rx: self.inner.done_tx.subscribe(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().status.pid
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Status {
        let mut state = self.lock();
        if state.done {
            if !state.finalized {
                let stdout = state.stdout.take();
                let stderr = state.stderr.take();
                // A process that never spawned has nothing to show
                if state.started {
                    if let Some(sink) = stdout {
                        state.status.stdout = sink.finish();
                    }
                    if let Some(sink) = stderr {
                        state.status.stderr = sink.finish();
                    }
                }
                state.finalized = true;
                debug!("Output of '{}' frozen", self.program);
            }
            return state.status.clone();
        }
        if !state.started {
            return state.status.clone();
        }

        let mut status = state.status.clone();
        if let Some(sink) = &state.stdout {
            status.stdout = sink.read();
        }
        if let Some(sink) = &state.stderr {
            status.stderr = sink.read();
        }
        status
    }

    fn fail_spawn(&self, reason: String) {
        {
            let mut state = self.lock();
            state.status.error = Some(reason);
            state.done = true;
        }
        self.publish();
    }

    fn publish(&self) {
        let status = self.status();
        self.done_tx.send_replace(Some(status));
    }

    async fn run(self: Arc<Self>, launch: Launch) {
        if self.trigger.as_ref().is_some_and(Trigger::has_fired) {
            warn!("'{}' cancelled before it was spawned", self.program);
            self.fail_spawn("cancelled before start".to_string());
            return;
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        process::isolate(&mut command);
        command.stdin(Stdio::null());
        command.stdout(piped_if(launch.stdout.is_some()));
        command.stderr(piped_if(launch.stderr.is_some()));
        if !launch.env.is_empty() {
            command.env_clear();
            command.envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        if let Some(dir) = &launch.dir {
            command.current_dir(dir);
        }
        command.kill_on_drop(true);

        debug!("Spawning '{}' {:?}", self.program, self.args);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn '{}': {}", self.program, e);
                self.fail_spawn(format!("Failed to spawn '{}': {}", self.program, e));
                return;
            }
        };

        let pid = child.id();
        {
            let mut state = self.lock();
            state.status.pid = pid;
            state.started = true;
        }
        info!("Started '{}' with pid {:?}", self.program, pid);

        let mut pumps = Vec::new();
        if let (Some(reader), Some(sink)) = (child.stdout.take(), launch.stdout) {
            pumps.push(tokio::spawn(pump(reader, sink)));
        }
        if let (Some(reader), Some(sink)) = (child.stderr.take(), launch.stderr) {
            pumps.push(tokio::spawn(pump(reader, sink)));
        }

        let exited = tokio::select! {
            result = child.wait() => Some(result),
            _ = Trigger::fired(self.trigger.clone()) => None,
        };
        let cancelled = exited.is_none();
        let wait_result = match exited {
            Some(result) => result,
            None => {
                info!("Cancellation fired for '{}', killing pid {:?}", self.program, pid);
                if let Some(pid) = pid {
                    if let Err(e) = process::force_kill_group(pid) {
                        warn!("Failed to kill process group {}: {}", pid, e);
                    }
                }
                if let Err(e) = child.start_kill() {
                    debug!("Kill of '{}' not delivered: {}", self.program, e);
                }
                child.wait().await
            }
        };

        let (exit_code, signal) = match &wait_result {
            Ok(exit) => (exit.code(), process::exit_signal(exit)),
            Err(e) => {
                error!("Failed to wait for '{}': {}", self.program, e);
                (None, None)
            }
        };
        self.lock().exited = true;

        drain(pumps, &self.program).await;

        {
            let mut state = self.lock();
            state.status.exit_code = exit_code;
            state.status.signal = signal;
            state.status.complete =
                wait_result.is_ok() && !state.stopped && signal.is_none() && !cancelled;
            state.done = true;
            info!(
                "'{}' exited (code {:?}, signal {:?}, complete {})",
                self.program, exit_code, signal, state.status.complete
            );
        }
        self.publish();
    }
}

fn piped_if(capture: bool) -> Stdio {
    if capture {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Copy everything readable from `reader` into `sink` until end of stream
async fn pump<R>(mut reader: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(&buf[..n]),
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                break;
            }
        }
    }
}

async fn drain(pumps: Vec<JoinHandle<()>>, program: &str) {
    let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
    let joined = async move {
        for pump in pumps {
            let _ = pump.await;
        }
    };
    if tokio::time::timeout(DRAIN_GRACE, joined).await.is_err() {
        warn!(
            "Output of '{}' still open {:?} after exit; abandoning readers",
            program, DRAIN_GRACE
        );
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Handle resolving with the final [`Status`] of a command
///
/// Any number of clones can wait independently; waiting never consumes the
/// status. Awaiting a `Completion` directly is the same as [`Completion::wait`].
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<Status>>,
}

impl Completion {
    /// Wait for the command to finish
    ///
    /// If the command is dropped without ever being started, resolves with the
    /// zero-value status.
    pub async fn wait(&self) -> Status {
        let mut rx = self.rx.clone();
        let result = rx
            .wait_for(Option::is_some)
            .await
            .map(|status| (*status).clone());
        match result {
            Ok(Some(status)) => status,
            _ => self.rx.borrow().clone().unwrap_or_default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The final status, if the command is done
    pub fn try_status(&self) -> Option<Status> {
        self.rx.borrow().clone()
    }

    /// Whether both handles observe the same command
    pub fn same_as(&self, other: &Completion) -> bool {
        self.rx.same_channel(&other.rx)
    }
}

impl IntoFuture for Completion {
    type Output = Status;
    type IntoFuture = Pin<Box<dyn Future<Output = Status> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
