//! Worker-count resolution.
//!
//! The pool never runs more workers than the host can execute in parallel, whatever cap the
//! environment configures.
use std::num::NonZeroUsize;

/// Parallelism reported by the host, or 1 when it cannot be determined.
pub fn available_workers() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// `min(cap or available, available)`.
#[inline]
pub fn resolve_worker_count(cap: Option<NonZeroUsize>, available: NonZeroUsize) -> NonZeroUsize {
    cap.map_or(available, |cap| cap.min(available))
}
