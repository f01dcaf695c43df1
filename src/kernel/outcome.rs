//! Results handed back to callers.
//!
//! Each type renders to the status text shown at the tool boundary through
//! `Display`. Callers that need structure match on the variants instead.

use std::fmt;
use std::time::Duration;

/// Prefix marking error fragments in rendered output.
pub const ERROR_PREFIX: &str = "[error] ";

const NO_OUTPUT: &str = "Code executed successfully (no output)";
const IN_PROGRESS: &str = "Execution in progress";

/// Output fragments of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Printed stream text, trimmed.
    pub streams: Vec<String>,
    /// `text/plain` expression results.
    pub results: Vec<String>,
    /// Formatted errors with cleaned tracebacks.
    pub errors: Vec<String>,
    /// An interrupt was requested for this execution.
    pub interrupted: bool,
}

impl ExecutionOutput {
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty() && self.results.is_empty() && self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fragments in presentation order: streams, then results, then errors.
    pub fn fragments(&self) -> Vec<String> {
        self.streams
            .iter()
            .chain(self.results.iter())
            .cloned()
            .chain(self.errors.iter().map(|e| format!("{}{}", ERROR_PREFIX, e)))
            .collect()
    }

    /// Fragments joined by newlines.
    pub fn render(&self) -> String {
        self.fragments().join("\n")
    }
}

/// Result of a blocking execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The kernel reported idle for this request.
    Completed {
        msg_id: String,
        output: ExecutionOutput,
    },
    /// The wait bound ran out first; `output` is whatever arrived.
    TimedOut {
        msg_id: String,
        output: ExecutionOutput,
        waited: Duration,
    },
}

impl ExecutionOutcome {
    pub fn msg_id(&self) -> &str {
        match self {
            ExecutionOutcome::Completed { msg_id, .. } | ExecutionOutcome::TimedOut { msg_id, .. } => {
                msg_id
            }
        }
    }

    pub fn output(&self) -> &ExecutionOutput {
        match self {
            ExecutionOutcome::Completed { output, .. } | ExecutionOutcome::TimedOut { output, .. } => {
                output
            }
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, ExecutionOutcome::TimedOut { .. })
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Completed { output, .. } if output.is_empty() => {
                f.write_str(NO_OUTPUT)
            }
            ExecutionOutcome::Completed { output, .. } => f.write_str(&output.render()),
            ExecutionOutcome::TimedOut { output, waited, .. } => {
                write!(
                    f,
                    "Execution timed out after ~{}ms. Code may still be running in background.",
                    waited.as_millis()
                )?;
                if output.is_empty() {
                    f.write_str(" Use non-blocking execution for long operations.")
                } else {
                    write!(f, "\n\nPartial output:\n{}", output.render())
                }
            }
        }
    }
}

/// Result of polling a tracked execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Finished; the entry has been removed from the tracker.
    Finished(ExecutionOutput),
    /// Still running; output collected so far.
    Running(ExecutionOutput),
}

impl PollOutcome {
    pub fn output(&self) -> &ExecutionOutput {
        match self {
            PollOutcome::Finished(output) | PollOutcome::Running(output) => output,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PollOutcome::Finished(_))
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Finished(output) if output.is_empty() => f.write_str(NO_OUTPUT),
            PollOutcome::Finished(output) => f.write_str(&output.render()),
            PollOutcome::Running(output) if output.is_empty() => f.write_str(IN_PROGRESS),
            PollOutcome::Running(output) => write!(f, "{}\n{}", output.render(), IN_PROGRESS),
        }
    }
}

/// What `status()` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected {
        /// `ip:shell_port`
        endpoint: String,
        key_preview: String,
        pending: usize,
    },
    NotConnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected {
                endpoint, pending, ..
            } => {
                write!(f, "Connected to kernel at {}", endpoint)?;
                if *pending > 0 {
                    write!(f, " ({} pending executions)", pending)?;
                }
                Ok(())
            }
            ConnectionStatus::NotConnected => f.write_str("Not connected to any kernel"),
        }
    }
}
