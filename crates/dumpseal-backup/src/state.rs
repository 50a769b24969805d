//! Job lifecycle
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Streaming ─▶ Finalizing ─▶ Completed
//!            │              │             │
//!            └──────────────┴─────────────┴──▶ Failed(kind)
//! ```
//! `Completed` and `Failed` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

use dumpseal_core::{DumpsealError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum JobState {
    Idle,
    Connecting,
    Streaming,
    Finalizing,
    Completed,
    Failed(ErrorKind),
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed(_))
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Streaming) => true,
            (Streaming, Finalizing) => true,
            (Finalizing, Completed) => true,
            (Idle | Connecting | Streaming | Finalizing, Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => f.write_str("idle"),
            JobState::Connecting => f.write_str("connecting"),
            JobState::Streaming => f.write_str("streaming"),
            JobState::Finalizing => f.write_str("finalizing"),
            JobState::Completed => f.write_str("completed"),
            JobState::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// Tracks one job's state and refuses illegal moves.
#[derive(Debug, Clone)]
pub struct JobTracker {
    operation: &'static str,
    state: JobState,
    history: Vec<JobState>,
}

impl JobTracker {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            state: JobState::Idle,
            history: vec![JobState::Idle],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every state visited, in order, starting with `Idle`.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), DumpsealError> {
        if !self.state.can_transition_to(next) {
            return Err(DumpsealError::InvalidInput(format!(
                "{} job cannot move from {} to {}",
                self.operation, self.state, next
            )));
        }
        tracing::debug!(operation = self.operation, from = %self.state, to = %next, "job state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Record a failure. A job that already finished keeps its state.
    pub fn fail(&mut self, kind: ErrorKind) {
        if self.state.is_terminal() {
            return;
        }
        let next = JobState::Failed(kind);
        tracing::debug!(operation = self.operation, from = %self.state, to = %next, "job state");
        self.state = next;
        self.history.push(next);
    }
}
