use std::any::Any;

use forge_model::JobIndex;
use thiserror::Error;

use crate::cancel::Failure;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a single unit invocation that did not produce a value.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The unit function itself reported a failure.
    #[error("unit failed: {reason}")]
    Fail {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },
    /// The execution context died underneath the unit (killed process, panicked thread).
    #[error("worker terminated unexpectedly: {reason}")]
    WorkerLost { reason: String },
    /// The job was stopped by the fail-fast canceller.
    #[error("cancelled")]
    Cancelled,
}

impl UnitError {
    pub fn fail(reason: impl Into<String>) -> Self {
        UnitError::Fail {
            reason: reason.into(),
            source: None,
        }
    }

    /// Wrap an error raised by a unit function, keeping it as the source.
    pub fn from_error(e: impl Into<BoxError>) -> Self {
        let e = e.into();
        UnitError::Fail {
            reason: e.to_string(),
            source: Some(e),
        }
    }

    pub fn worker_lost(reason: impl Into<String>) -> Self {
        UnitError::WorkerLost {
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn is_worker_lost(&self) -> bool {
        matches!(self, UnitError::WorkerLost { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UnitError::Cancelled)
    }
}

/// The aggregate error of a batch.
///
/// Raised once per batch, after teardown, for the first failure the supervisor observed.
/// Failures observed while the batch was already cancelling are kept in `suppressed`.
#[derive(Debug, Error)]
#[error("error for item #{index} ({item:?}): {cause}")]
pub struct BatchError<I> {
    pub index: JobIndex,
    pub item: I,
    #[source]
    pub cause: UnitError,
    pub suppressed: Vec<Failure>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
