use forge_model::{BatchPhase, JobIndex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::UnitError;

/// A failed job: which item, and why.
#[derive(Debug)]
pub struct Failure {
    pub index: JobIndex,
    pub cause: UnitError,
}

/// Fail-fast state machine of one batch.
///
/// Only the first failure observed while `Running` is authoritative; anything observed later
/// is kept as a suppressed diagnostic.
pub(crate) struct FailFast {
    phase: BatchPhase,
    token: CancellationToken,
    first: Option<Failure>,
    suppressed: Vec<Failure>,
}

impl FailFast {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            phase: BatchPhase::Running,
            token,
            first: None,
            suppressed: Vec::new(),
        }
    }

    #[inline]
    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    #[inline]
    pub fn accepts_submissions(&self) -> bool {
        self.phase.accepts_submissions()
    }

    #[inline]
    pub fn is_cancelling(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record a failure. Returns `true` if it became the authoritative one.
    pub fn observe(&mut self, index: JobIndex, cause: UnitError) -> bool {
        if self.phase == BatchPhase::Running {
            warn!(target: "forge.core.batch", index, error = %cause, "first failure observed");
            self.first = Some(Failure { index, cause });
            self.transition(BatchPhase::FirstFailureObserved);
            true
        } else {
            debug!(target: "forge.core.batch", index, error = %cause, "failure suppressed");
            self.suppressed.push(Failure { index, cause });
            false
        }
    }

    /// Stop accepting jobs and signal every running unit.
    pub fn cancel(&mut self) {
        self.transition(BatchPhase::Cancelling);
        self.token.cancel();
    }

    /// The job set is empty; nothing executes any more.
    pub fn stop(&mut self) {
        self.transition(BatchPhase::Stopped);
    }

    pub fn into_parts(self) -> (BatchPhase, Option<Failure>, Vec<Failure>) {
        (self.phase, self.first, self.suppressed)
    }

    fn transition(&mut self, to: BatchPhase) {
        match self.phase.advance(to) {
            Ok(next) => {
                trace!(target: "forge.core.batch", from = ?self.phase, to = ?next, "phase");
                self.phase = next;
            }
            Err(e) => debug_assert!(false, "{e}"),
        }
    }
}
