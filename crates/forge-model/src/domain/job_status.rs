use serde::{Deserialize, Serialize};

/// Lifecycle of a single job inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Submitted to the batch but not started; waiting for a free worker slot.
    Pending,
    /// Unit is executing.
    Running,
    /// Unit returned a value.
    Succeeded,
    /// Unit raised, or its worker context died.
    Failed,
    /// Stopped by the fail-fast canceller, either before start or while running.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` if the job will not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}
