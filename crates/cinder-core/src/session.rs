//! Per-connection state.
//!
//! A [`Session`] travels with each connection through the dispatcher:
//! selected database, authentication, and the MULTI machinery (queued
//! commands, accumulated queue-time errors, watched key versions).

use ahash::AHashMap;
use cinder_protocol::CmdLine;

/// Connection-scoped state. Created per accepted connection and
/// dropped on close, which implicitly aborts any open MULTI and
/// releases all watches.
#[derive(Debug, Default)]
pub struct Session {
    /// Index of the selected database.
    pub db_index: usize,
    /// Whether AUTH succeeded (or no password is configured).
    pub authenticated: bool,
    multi: bool,
    queue: Vec<CmdLine>,
    tx_errors: Vec<String>,
    watching: AHashMap<String, u32>,
}

impl Session {
    /// Fresh state for a new connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while the connection is buffering a MULTI block.
    pub fn in_multi(&self) -> bool {
        self.multi
    }

    /// Enters or leaves multi state. Leaving clears the queue and the
    /// accumulated errors but keeps watches (EXEC consumes those
    /// itself; UNWATCH and DISCARD clear them explicitly).
    pub fn set_multi(&mut self, on: bool) {
        self.multi = on;
        if !on {
            self.queue.clear();
            self.tx_errors.clear();
        }
    }

    /// Buffers a validated command for EXEC.
    pub fn enqueue(&mut self, line: CmdLine) {
        self.queue.push(line);
    }

    /// The queued command lines, in arrival order.
    pub fn queued(&self) -> &[CmdLine] {
        &self.queue
    }

    /// Takes the queue, leaving it empty.
    pub fn take_queue(&mut self) -> Vec<CmdLine> {
        std::mem::take(&mut self.queue)
    }

    /// Records a queue-time error; EXEC aborts when any exist.
    pub fn add_tx_error(&mut self, msg: impl Into<String>) {
        self.tx_errors.push(msg.into());
    }

    /// `true` if any queue-time error accumulated.
    pub fn has_tx_errors(&self) -> bool {
        !self.tx_errors.is_empty()
    }

    /// Watched keys and the versions captured at WATCH time.
    pub fn watching(&self) -> &AHashMap<String, u32> {
        &self.watching
    }

    /// Captures a watch on `key` at `version`.
    pub fn watch(&mut self, key: String, version: u32) {
        self.watching.insert(key, version);
    }

    /// Drops all watches.
    pub fn unwatch(&mut self) {
        self.watching.clear();
    }

    /// Takes the watch set, leaving it empty. EXEC consumes watches.
    pub fn take_watching(&mut self) -> AHashMap<String, u32> {
        std::mem::take(&mut self.watching)
    }
}
