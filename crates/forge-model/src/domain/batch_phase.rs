use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phase of the fail-fast state machine that governs a batch.
///
/// ```text
/// Running ──first failure──▶ FirstFailureObserved ──▶ Cancelling ──▶ Stopped
///    └──────────────────────── all jobs done ─────────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchPhase {
    Running,
    FirstFailureObserved,
    Cancelling,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal batch phase transition: {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: BatchPhase,
    pub to: BatchPhase,
}

impl BatchPhase {
    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_advance(self, to: BatchPhase) -> bool {
        use BatchPhase::*;
        matches!(
            (self, to),
            (Running, FirstFailureObserved)
                | (Running, Stopped)
                | (FirstFailureObserved, Cancelling)
                | (Cancelling, Stopped)
        )
    }

    pub fn advance(self, to: BatchPhase) -> Result<BatchPhase, PhaseError> {
        if self.can_advance(to) {
            Ok(to)
        } else {
            Err(PhaseError { from: self, to })
        }
    }

    /// New jobs may only be started while the batch is `Running`.
    #[inline]
    pub fn accepts_submissions(self) -> bool {
        matches!(self, BatchPhase::Running)
    }
}
