//! Fail-fast batch processing with process-tree teardown.
//!
//! A [`Batch`] runs one [`Unit`] invocation per item on a bounded pool of workers. The first
//! failing unit cancels everything still pending or running, and once the pool is stopped the
//! [`reaper`] terminates every process the units left behind. The caller gets either every
//! result or a single [`BatchError`] naming the failing item, never a partial result set.
//!
//! ```ignore
//! let results = run_batch(unit, predictions, NonZeroUsize::new(4)).await?;
//! ```

pub mod error;
pub use error::{BatchError, BoxError, ConfigError, UnitError};

pub mod config;
pub use config::BatchConfig;

pub mod workers;
pub use workers::{available_workers, resolve_worker_count};

pub mod unit;
pub use unit::{JobCtx, Unit};

mod cancel;
pub use cancel::Failure;

mod pool;

pub mod reaper;
pub use reaper::{
    Claims, HostProcessTable, ProcessClaims, ProcessTable, ReapReport, ReapScope, SpawnWatch,
};

mod batch;
pub use batch::{Batch, BatchReport, run_batch};

pub mod prelude {
    pub use crate::batch::{Batch, BatchReport, run_batch};
    pub use crate::config::BatchConfig;
    pub use crate::error::{BatchError, BoxError, UnitError};
    pub use crate::unit::{JobCtx, Unit};
    pub use forge_model::{JobIndex, JobStatus};
}
