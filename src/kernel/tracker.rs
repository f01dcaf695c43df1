//! In-flight execution bookkeeping.
//!
//! Each submitted execution gets a [`PendingExecution`] keyed by its
//! correlation id. Entries accumulate output as the demultiplexer routes
//! replies to them and leave the table only when a caller collects a
//! finished result (or the blocking path discards its own entry).

use std::collections::HashMap;

use crate::kernel::codec::strip_ansi;
use crate::kernel::outcome::ExecutionOutput;

/// Kernel execution state reported on IOPub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    Other,
}

impl ExecutionState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "busy" => ExecutionState::Busy,
            "idle" => ExecutionState::Idle,
            "starting" => ExecutionState::Starting,
            _ => ExecutionState::Other,
        }
    }
}

/// Something a reply contributes to an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// `execute_result` plain-text representation.
    Result(String),
    /// `stream` output (stdout or stderr).
    Stream(String),
    /// `error` with its traceback lines.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status(ExecutionState),
}

/// Output collected so far for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingExecution {
    pub results: Vec<String>,
    pub streams: Vec<String>,
    pub errors: Vec<String>,
    pub done: bool,
    pub interrupted: bool,
}

impl PendingExecution {
    /// Fold one event into the accumulated output.
    pub fn apply(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::Result(text) => {
                if !text.is_empty() {
                    self.results.push(text);
                }
            }
            KernelEvent::Stream(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    self.streams.push(text.to_string());
                }
            }
            KernelEvent::Error {
                ename,
                evalue,
                traceback,
            } => self.errors.push(format_error(&ename, &evalue, &traceback)),
            KernelEvent::Status(ExecutionState::Idle) => self.done = true,
            KernelEvent::Status(_) => {}
        }
    }

    /// Snapshot of the output without consuming the entry.
    pub fn output(&self) -> ExecutionOutput {
        ExecutionOutput {
            streams: self.streams.clone(),
            results: self.results.clone(),
            errors: self.errors.clone(),
            interrupted: self.interrupted,
        }
    }

    pub fn into_output(self) -> ExecutionOutput {
        ExecutionOutput {
            streams: self.streams,
            results: self.results,
            errors: self.errors,
            interrupted: self.interrupted,
        }
    }
}

/// `"{ename}: {evalue}"` followed by the cleaned traceback, one line each.
fn format_error(ename: &str, evalue: &str, traceback: &[String]) -> String {
    let mut message = format!("{}: {}", ename, evalue);
    if !traceback.is_empty() {
        let cleaned: Vec<String> = traceback.iter().map(|line| strip_ansi(line)).collect();
        message.push('\n');
        message.push_str(&cleaned.join("\n"));
    }
    message
}

/// Correlation id → in-flight execution.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    entries: HashMap<String, PendingExecution>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `msg_id`. Re-registering an id resets its output.
    pub fn register(&mut self, msg_id: impl Into<String>) {
        self.entries.insert(msg_id.into(), PendingExecution::default());
    }

    pub fn contains(&self, msg_id: &str) -> bool {
        self.entries.contains_key(msg_id)
    }

    pub fn get(&self, msg_id: &str) -> Option<&PendingExecution> {
        self.entries.get(msg_id)
    }

    /// Route an event to its execution. Returns `false` if `msg_id` is untracked.
    pub fn apply(&mut self, msg_id: &str, event: KernelEvent) -> bool {
        match self.entries.get_mut(msg_id) {
            Some(entry) => {
                entry.apply(event);
                true
            }
            None => false,
        }
    }

    /// Flag an execution as interrupted. Returns `false` if `msg_id` is untracked.
    pub fn mark_interrupted(&mut self, msg_id: &str) -> bool {
        match self.entries.get_mut(msg_id) {
            Some(entry) => {
                entry.interrupted = true;
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry only if it has finished.
    pub fn take_if_done(&mut self, msg_id: &str) -> Option<PendingExecution> {
        if self.entries.get(msg_id).is_some_and(|entry| entry.done) {
            self.entries.remove(msg_id)
        } else {
            None
        }
    }

    pub fn remove(&mut self, msg_id: &str) -> Option<PendingExecution> {
        self.entries.remove(msg_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked ids, sorted for stable reporting.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}
