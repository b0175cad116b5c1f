//! The seam between the batch engine and the work it runs.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use forge_model::JobIndex;
use tokio_util::{
    sync::CancellationToken,
    task::{TaskTracker, task_tracker::TaskTrackerToken},
};

use crate::{
    error::UnitError,
    reaper::{HostProcessTable, ProcessClaims, ProcessTable, SpawnWatch},
};

/// Per-job handle passed to [`Unit::run`].
#[derive(Clone)]
pub struct JobCtx {
    index: JobIndex,
    cancel: CancellationToken,
    claims: ProcessClaims,
    table: Arc<dyn ProcessTable>,
    workers: TaskTracker,
}

impl JobCtx {
    pub(crate) fn new(
        cancel: CancellationToken,
        claims: ProcessClaims,
        table: Arc<dyn ProcessTable>,
        workers: TaskTracker,
    ) -> Self {
        Self {
            index: 0,
            cancel,
            claims,
            table,
            workers,
        }
    }

    /// Context for job `index`, cancelled together with this one.
    pub(crate) fn for_job(&self, index: JobIndex) -> Self {
        Self {
            index,
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// A context that belongs to no batch, for driving a unit on its own.
    pub fn detached(index: JobIndex) -> Self {
        Self::new(
            CancellationToken::new(),
            ProcessClaims::default(),
            Arc::new(HostProcessTable::new()),
            TaskTracker::new(),
        )
        .for_job(index)
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_claims(mut self, claims: ProcessClaims) -> Self {
        self.claims = claims;
        self
    }

    #[inline]
    pub fn index(&self) -> JobIndex {
        self.index
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the batch starts cancelling.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record a process group created by this job so the reaper sweeps it after the batch,
    /// even if its leader exits and its members are re-parented away from us.
    pub fn register_group(&self, pgid: u32) {
        self.claims.register_group(pgid);
    }

    /// Record a single process started by this job.
    pub fn register_pid(&self, pid: u32) {
        self.claims.register_pid(pid);
    }

    /// Start attributing children forked by the calling thread to this batch.
    pub fn watch_spawns(&self) -> SpawnWatch {
        SpawnWatch::start(Arc::clone(&self.table), self.claims.clone())
    }

    /// Hold this while work for the job runs outside its future, e.g. on a dedicated thread.
    /// The batch does not sweep until every token is dropped or its cancel grace runs out.
    pub fn worker_token(&self) -> TaskTrackerToken {
        self.workers.token()
    }
}

impl fmt::Debug for JobCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCtx")
            .field("index", &self.index)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Work executed once per item.
///
/// Implementations should return [`UnitError::Cancelled`] promptly once
/// [`JobCtx::cancelled`] resolves. A unit that ignores cancellation is dropped after the
/// batch's cancel grace.
#[async_trait]
pub trait Unit<I>: Send + Sync + 'static
where
    I: Send + 'static,
{
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    async fn run(&self, item: I, ctx: JobCtx) -> Result<Self::Output, UnitError>;
}
