use crate::traits::{CommitResult, Schema};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one tunnel job
///
/// ```text
/// Planned -> Resolving -> Transferring -> Committing -> Completed
///     \___________\______________\______________\_____> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Planned,
    Resolving,
    Transferring,
    Committing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Planned, Resolving)
                | (Resolving, Transferring)
                | (Transferring, Committing)
                | (Committing, Completed)
        ) || (!self.is_terminal() && next == Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Planned => "planned",
            JobState::Resolving => "resolving",
            JobState::Transferring => "transferring",
            JobState::Committing => "committing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a completed job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: Uuid,
    pub source_kind: String,
    pub sink_kind: String,
    pub state: JobState,
    /// Every state the job passed through, in order
    pub transitions: Vec<JobState>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub batches: u64,
    pub retries: u64,
    pub commit: CommitResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_table_name: Option<String>,
    pub elapsed_ms: u64,
}

/// Mutable bookkeeping for a job in flight
pub(crate) struct Job {
    pub id: Uuid,
    pub state: JobState,
    pub transitions: Vec<JobState>,
    pub started: Instant,
    pub rows_read: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub batches: u64,
    pub retries: u64,
    pub schema: Option<Arc<Schema>>,
}

impl Job {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Planned,
            transitions: vec![JobState::Planned],
            started: Instant::now(),
            rows_read: 0,
            rows_written: 0,
            bytes_written: 0,
            batches: 0,
            retries: 0,
            schema: None,
        }
    }

    pub fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {} -> {}",
            self.state,
            next
        );
        debug!(job_id = %self.id, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        self.transitions.push(next);
    }
}
