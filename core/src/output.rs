//! Output capture: concurrency-safe sinks attached to a child's standard streams
//!
//! Two policies are provided:
//!
//! - [`LatestChunk`] keeps only the most recent write. Memory stays bounded for
//!   high-volume streams where only the current output matters, at the cost of
//!   history. This is the default.
//! - [`LineHistory`] keeps every complete line ever written.
//!
//! Writers never fail and only hold the sink lock long enough to copy bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Output captured from one stream, as exposed on a [`crate::Status`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Output {
    /// Nothing captured (stream discarded or merged into another one)
    #[default]
    None,
    /// Every complete line seen so far, in order
    Lines(Vec<String>),
    /// The most recent chunk written to the stream
    Latest(String),
}

impl Output {
    /// Captured lines, if this output came from a history sink
    pub fn lines(&self) -> Option<&[String]> {
        match self {
            Output::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    /// Latest chunk, if this output came from a latest-chunk sink
    pub fn latest(&self) -> Option<&str> {
        match self {
            Output::Latest(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Output::None)
    }
}

/// A byte sink receiving a child's output
///
/// Implementations must accept writes concurrently with reads.
pub trait OutputSink: Send + Sync + fmt::Debug {
    /// Record a chunk of output. Never fails.
    fn write(&self, bytes: &[u8]);

    /// Point-in-time view of the captured output
    fn read(&self) -> Output;

    /// Final view once the process is done and no more writes will arrive
    fn finish(&self) -> Output {
        self.read()
    }
}

/// Which sink to build for a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapturePolicy {
    /// Keep only the most recent chunk
    #[default]
    Latest,
    /// Keep all complete lines
    History,
    /// Do not capture at all
    Discard,
}

impl CapturePolicy {
    /// Build a fresh sink for this policy, or `None` for [`CapturePolicy::Discard`]
    pub fn sink(self) -> Option<Arc<dyn OutputSink>> {
        match self {
            CapturePolicy::Latest => Some(Arc::new(LatestChunk::new())),
            CapturePolicy::History => Some(Arc::new(LineHistory::new())),
            CapturePolicy::Discard => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking writer cannot leave the buffers in a torn state.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sink that replaces its contents on every write
#[derive(Debug, Default)]
pub struct LatestChunk {
    buf: Mutex<Vec<u8>>,
}

impl LatestChunk {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for LatestChunk {
    fn write(&self, bytes: &[u8]) {
        let mut buf = lock(&self.buf);
        buf.clear();
        buf.extend_from_slice(bytes);
    }

    fn read(&self) -> Output {
        let buf = lock(&self.buf);
        Output::Latest(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    /// Bytes written but not yet split into lines
    pending: Vec<u8>,
    lines: Vec<String>,
}

impl HistoryState {
    fn scan(&mut self) {
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        // `complete` ends with the newline found above
        let body = &complete[..complete.len() - 1];
        self.lines
            .extend(body.split(|b| *b == b'\n').map(decode_line));
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Sink that accumulates output and splits it into lines on read
#[derive(Debug, Default)]
pub struct LineHistory {
    state: Mutex<HistoryState>,
}

impl LineHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputSink for LineHistory {
    fn write(&self, bytes: &[u8]) {
        lock(&self.state).pending.extend_from_slice(bytes);
    }

    fn read(&self) -> Output {
        let mut state = lock(&self.state);
        state.scan();
        Output::Lines(state.lines.clone())
    }

    fn finish(&self) -> Output {
        let mut state = lock(&self.state);
        state.scan();
        if !state.pending.is_empty() {
            let tail = std::mem::take(&mut state.pending);
            let line = decode_line(&tail);
            state.lines.push(line);
        }
        Output::Lines(state.lines.clone())
    }
}
