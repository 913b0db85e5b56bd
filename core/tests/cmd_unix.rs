//! Integration tests driving real processes through [`Cmd`]
//!
//! These tests verify that the supervisor:
//! - Reports natural exits as complete with their captured output
//! - Stops running processes, including children they spawned
//! - Handles spawn failures, deadlines and concurrent calls without hanging

#![cfg(unix)]

use gcmd_core::{default_terminator, CapturePolicy, Cmd, CmdError, Output, Terminator};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const LIMIT: Duration = Duration::from_secs(10);

fn is_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // An orphan may linger as a zombie until whoever adopted it reaps it
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => cfg!(not(target_os = "linux")),
    }
}

async fn wait_for_pid(cmd: &Cmd) -> u32 {
    let started = Instant::now();
    loop {
        if let Some(pid) = cmd.pid() {
            return pid;
        }
        assert!(started.elapsed() < LIMIT, "process never started");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_echo_with_history_completes() {
    let cmd = Cmd::new("echo", ["hello"]).with_capture(CapturePolicy::History);
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();

    assert!(status.complete);
    assert!(status.pid.unwrap() > 0);
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(status.signal, None);
    assert_eq!(status.error, None);
    assert_eq!(status.stdout, Output::Lines(vec!["hello".to_string()]));
    assert_eq!(status.stderr, Output::Lines(vec![]));
    assert_eq!(cmd.status(), status);
}

#[tokio::test]
async fn test_non_zero_exit_is_still_complete() {
    let cmd = Cmd::new("sh", ["-c", "exit 3"]);
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();
    assert!(status.complete);
    assert_eq!(status.exit_code, Some(3));
}

#[tokio::test]
async fn test_latest_chunk_keeps_only_last_write() {
    let cmd = Cmd::new("sh", ["-c", "printf first; sleep 0.2; printf second; sleep 0.2; printf third"]);
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();
    assert!(status.complete);
    assert_eq!(status.stdout, Output::Latest("third".to_string()));
}

#[tokio::test]
async fn test_stderr_captured_separately() {
    let cmd = Cmd::new("sh", ["-c", "echo out; echo err 1>&2"]).with_capture(CapturePolicy::History);
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();
    assert_eq!(status.stdout.lines(), Some(&["out".to_string()][..]));
    assert_eq!(status.stderr.lines(), Some(&["err".to_string()][..]));
}

#[tokio::test]
async fn test_status_while_running_is_live() {
    let cmd = Cmd::new("sh", ["-c", "echo ready; sleep 5"]).with_capture(CapturePolicy::History);
    let completion = cmd.start();
    let pid = wait_for_pid(&cmd).await;

    let started = Instant::now();
    loop {
        let status = cmd.status();
        assert_eq!(status.pid, Some(pid));
        assert!(!status.complete);
        if status.stdout.lines().is_some_and(|l| l == ["ready".to_string()]) {
            break;
        }
        assert!(started.elapsed() < LIMIT, "output never appeared");
        sleep(Duration::from_millis(20)).await;
    }
    assert!(!completion.is_done());

    cmd.stop().unwrap();
    let status = timeout(LIMIT, completion.wait()).await.unwrap();
    assert_eq!(status.stdout.lines(), Some(&["ready".to_string()][..]));
}

#[tokio::test]
async fn test_stop_long_running_process() {
    let cmd = Cmd::new("sleep", ["30"]);
    let completion = cmd.start();
    let pid = wait_for_pid(&cmd).await;
    sleep(Duration::from_millis(100)).await;

    cmd.stop().unwrap();
    let status = timeout(LIMIT, completion.wait()).await.unwrap();

    assert!(!status.complete);
    assert_eq!(status.pid, Some(pid));
    assert_eq!(status.signal, Some(nix::sys::signal::Signal::SIGTERM as i32));
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_stop_after_done_is_noop() {
    let cmd = Cmd::new("true", Vec::<String>::new());
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();
    assert!(status.complete);

    assert!(cmd.stop().is_ok());
    assert!(cmd.stop().is_ok());
    // A late stop never rewrites the outcome
    assert!(cmd.status().complete);
}

#[tokio::test]
async fn test_stop_before_start_is_not_running() {
    let cmd = Cmd::new("sleep", ["1"]);
    assert!(matches!(cmd.stop(), Err(CmdError::NotRunning)));
}

#[tokio::test]
async fn test_stop_reaches_grandchildren() {
    // The inner sleep inherits stdout; without group signaling it would keep
    // the pipe open after sh is gone.
    let cmd = Cmd::new("sh", ["-c", "sleep 30 & echo $!; wait"]).with_capture(CapturePolicy::History);
    let completion = cmd.start();
    wait_for_pid(&cmd).await;

    let started = Instant::now();
    let grandchild: u32 = loop {
        if let Some(line) = cmd.status().stdout.lines().and_then(|l| l.first().cloned()) {
            break line.trim().parse().unwrap();
        }
        assert!(started.elapsed() < LIMIT, "grandchild pid never printed");
        sleep(Duration::from_millis(20)).await;
    };

    cmd.stop().unwrap();
    let status = timeout(Duration::from_secs(5), completion.wait())
        .await
        .expect("stop must not hang on inherited pipes");
    assert!(!status.complete);

    sleep(Duration::from_millis(100)).await;
    assert!(!is_alive(grandchild));
}

#[tokio::test]
async fn test_nonexistent_executable() {
    let cmd = Cmd::new("gcmd-no-such-executable-4242", ["--flag"]);
    let status = timeout(LIMIT, cmd.start().wait())
        .await
        .expect("spawn failure must not hang");

    assert!(!status.complete);
    assert_eq!(status.pid, None);
    assert!(status.spawn_failed());
    assert!(cmd.is_done());
}

#[tokio::test]
async fn test_deadline_kills_process() {
    let deadline = Instant::now() + Duration::from_millis(200);
    let cmd = Cmd::new_with_deadline(deadline, "sleep", ["30"]);
    let completion = cmd.start();
    let pid = wait_for_pid(&cmd).await;

    let status = timeout(LIMIT, completion.wait()).await.unwrap();
    assert!(!status.complete);
    assert_eq!(status.pid, Some(pid));
    assert!(Instant::now() >= deadline);
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_deadline_after_natural_exit_is_complete() {
    let cmd = Cmd::new_with_timeout(Duration::from_secs(30), "true", Vec::<String>::new());
    let status = timeout(LIMIT, cmd.start().wait()).await.unwrap();
    assert!(status.complete);
}

#[tokio::test]
async fn test_cancellation_token_kills_process() {
    let token = CancellationToken::new();
    let cmd = Cmd::new_with_cancel(token.clone(), "sleep", ["30"]);
    let completion = cmd.start();
    let pid = wait_for_pid(&cmd).await;

    token.cancel();
    let status = timeout(LIMIT, completion.wait()).await.unwrap();
    assert!(!status.complete);
    assert!(!is_alive(pid));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_spawns_once() {
    let cmd = Cmd::new("sh", ["-c", "echo $$"]).with_capture(CapturePolicy::History);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cmd = cmd.clone();
            tokio::spawn(async move { cmd.start() })
        })
        .collect();
    let mut completions = Vec::new();
    for handle in handles {
        completions.push(handle.await.unwrap());
    }

    let first = completions[0].clone();
    assert!(completions.iter().all(|c| c.same_as(&first)));

    let mut statuses = Vec::new();
    for completion in &completions {
        statuses.push(timeout(LIMIT, completion.wait()).await.unwrap());
    }
    assert!(statuses.iter().all(|s| s == &statuses[0]));

    let status = &statuses[0];
    assert!(status.complete);
    // The shell printed its own pid: exactly one process ran
    let printed: u32 = status.stdout.lines().unwrap()[0].parse().unwrap();
    assert_eq!(Some(printed), status.pid);
}

/// Forwards to the platform terminator and remembers who it signalled
#[derive(Debug, Default)]
struct CountingTerminator {
    signalled: Mutex<Vec<u32>>,
    forward: bool,
}

impl CountingTerminator {
    fn signalled(&self) -> bool {
        !self.signalled.lock().unwrap().is_empty()
    }
}

impl Terminator for CountingTerminator {
    fn terminate(&self, pid: u32) -> gcmd_core::Result<()> {
        self.signalled.lock().unwrap().push(pid);
        if self.forward {
            default_terminator().terminate(pid)
        } else {
            Ok(())
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_races_natural_exit() {
    for _ in 0..20 {
        let terminator = Arc::new(CountingTerminator {
            forward: true,
            ..Default::default()
        });
        let cmd = Cmd::new("true", Vec::<String>::new()).with_terminator(terminator.clone());
        let completion = cmd.start();
        wait_for_pid(&cmd).await;
        let was_done = cmd.is_done();
        let stopped = cmd.stop();

        let status = timeout(LIMIT, completion.wait()).await.unwrap();
        assert!(stopped.is_ok());
        assert!(status.pid.is_some());
        assert_eq!(cmd.status(), status);
        if was_done {
            assert!(status.complete);
        }
        // A stop that got as far as signalling happened before the exit was seen
        if terminator.signalled() {
            assert!(!status.complete);
        }
    }
}

#[tokio::test]
async fn test_stop_then_natural_exit_is_not_complete() {
    // The terminator never delivers a signal, so the process exits on its own
    // after stop was requested.
    let terminator = Arc::new(CountingTerminator::default());
    let cmd = Cmd::new("sh", ["-c", "sleep 0.3"]).with_terminator(terminator.clone());
    let completion = cmd.start();
    wait_for_pid(&cmd).await;

    assert!(!cmd.is_done());
    cmd.stop().unwrap();
    assert!(terminator.signalled());

    let status = timeout(LIMIT, completion.wait()).await.unwrap();
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(status.signal, None);
    assert!(!status.complete);
}

#[tokio::test]
async fn test_status_is_frozen_after_done() {
    let cmd = Cmd::new("sh", ["-c", "echo a; echo b"]).with_capture(CapturePolicy::History);
    let completion = cmd.start();
    let published = timeout(LIMIT, completion.wait()).await.unwrap();

    let first = cmd.status();
    let second = cmd.status();
    assert_eq!(first, published);
    assert_eq!(second, published);
    assert_eq!(first.stdout.lines().unwrap(), ["a", "b"]);
}

#[tokio::test]
async fn test_many_waiters_see_the_same_status() {
    let cmd = Cmd::new("echo", ["x"]);
    let completion = cmd.start();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let done = cmd.done();
            tokio::spawn(async move { done.await })
        })
        .collect();

    let expected = timeout(LIMIT, completion.wait()).await.unwrap();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), expected);
    }
}
