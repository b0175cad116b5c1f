use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use forge_model::{BatchPhase, JobIndex, JobStatus};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    cancel::{FailFast, Failure},
    error::{UnitError, panic_message},
    unit::{JobCtx, Unit},
};

type Joined<O> = Result<O, UnitError>;

pub(crate) struct PoolOutcome<O> {
    /// Successful outputs, in completion order.
    pub results: Vec<O>,
    pub statuses: Vec<JobStatus>,
    pub phase: BatchPhase,
    pub failure: Option<Failure>,
    pub suppressed: Vec<Failure>,
}

/// Bounded set of in-flight jobs driven by a single supervisor loop.
///
/// Each job runs as its own task. A task that panics or is aborted surfaces as a join error,
/// which is traced back to its job through the task id and handled like any other failure.
pub(crate) struct Pool {
    workers: NonZeroUsize,
    cancel_grace: Duration,
    /// Batch-level context every job context derives from.
    root: JobCtx,
}

impl Pool {
    pub fn new(workers: NonZeroUsize, cancel_grace: Duration, root: JobCtx) -> Self {
        Self {
            workers,
            cancel_grace,
            root,
        }
    }

    /// Run one job per item and return once every job completed or was cancelled.
    pub async fn run<I, U>(&self, unit: Arc<U>, items: &[I]) -> PoolOutcome<U::Output>
    where
        I: Clone + Send + 'static,
        U: Unit<I>,
    {
        let mut statuses = vec![JobStatus::Pending; items.len()];
        let mut pending: VecDeque<JobIndex> = (0..items.len()).collect();
        let mut jobs: JoinSet<Joined<U::Output>> = JoinSet::new();
        let mut ids: HashMap<Id, JobIndex> = HashMap::new();
        let mut results = Vec::with_capacity(items.len());
        let mut ff = FailFast::new(self.root.cancel_token().clone());

        loop {
            while ff.accepts_submissions() && jobs.len() < self.workers.get() {
                let Some(index) = pending.pop_front() else {
                    break;
                };
                statuses[index] = JobStatus::Running;
                trace!(target: "forge.core.pool", index, unit = unit.name(), "job submitted");
                let id = self.submit(&mut jobs, &unit, index, items[index].clone());
                ids.insert(id, index);
            }

            let Some(joined) = jobs.join_next_with_id().await else {
                break;
            };
            let (id, out) = match joined {
                Ok((id, out)) => (id, out),
                Err(e) => (e.id(), Err(lost(e))),
            };
            let Some(index) = ids.remove(&id) else {
                error!(target: "forge.core.pool", %id, "completion for a task that is not a job");
                continue;
            };

            match out {
                Ok(value) => {
                    debug!(target: "forge.core.pool", index, "job succeeded");
                    statuses[index] = JobStatus::Succeeded;
                    results.push(value);
                }
                Err(UnitError::Cancelled) if ff.is_cancelling() => {
                    debug!(target: "forge.core.pool", index, "job cancelled");
                    statuses[index] = JobStatus::Cancelled;
                }
                Err(cause) => {
                    statuses[index] = JobStatus::Failed;
                    let cause = match cause {
                        UnitError::Cancelled => {
                            UnitError::worker_lost("unit reported cancellation while the batch was running")
                        }
                        other => other,
                    };
                    if ff.observe(index, cause) {
                        for index in pending.drain(..) {
                            statuses[index] = JobStatus::Cancelled;
                        }
                        ff.cancel();
                        debug!(
                            target: "forge.core.pool",
                            in_flight = jobs.len(),
                            "pending jobs cancelled; waiting for running jobs to stop"
                        );
                    }
                }
            }
        }

        debug_assert!(
            statuses.iter().all(JobStatus::is_terminal),
            "every job settles before the pool returns: {statuses:?}"
        );
        ff.stop();
        let (phase, failure, suppressed) = ff.into_parts();
        PoolOutcome {
            results,
            statuses,
            phase,
            failure,
            suppressed,
        }
    }

    fn submit<I, U>(
        &self,
        jobs: &mut JoinSet<Joined<U::Output>>,
        unit: &Arc<U>,
        index: JobIndex,
        item: I,
    ) -> Id
    where
        I: Send + 'static,
        U: Unit<I>,
    {
        let unit = Arc::clone(unit);
        let ctx = self.root.for_job(index);
        let grace = self.cancel_grace;

        let handle = jobs.spawn(async move {
            let cancel = ctx.cancel_token().clone();
            tokio::select! {
                biased;
                out = unit.run(item, ctx) => out,
                _ = overrun(cancel, grace) => {
                    warn!(target: "forge.core.pool", index, "unit ignored cancellation; dropping it");
                    Err(UnitError::Cancelled)
                }
            }
        });
        handle.id()
    }
}

/// A job task that never returned a value.
fn lost(e: JoinError) -> UnitError {
    if e.is_panic() {
        let payload = e.into_panic();
        let reason = panic_message(&*payload);
        UnitError::worker_lost(format!("job panicked: {reason}"))
    } else {
        UnitError::worker_lost(format!("job aborted: {e}"))
    }
}

async fn overrun(cancel: CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}
