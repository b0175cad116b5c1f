use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use forge_model::{BatchPhase, JobStatus};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    cancel::Failure,
    config::BatchConfig,
    error::{BatchError, ConfigError},
    pool::Pool,
    reaper::{HostProcessTable, ProcessClaims, ProcessTable, ReapReport, ReapScope, Reaper},
    unit::{JobCtx, Unit},
};

/// Run `unit` once per item with at most `max_workers` running at a time.
///
/// `None` uses the host parallelism. Returns every result in completion order, or the first
/// failure once every process of the batch has exited.
pub async fn run_batch<I, U>(
    unit: U,
    items: Vec<I>,
    max_workers: Option<NonZeroUsize>,
) -> Result<Vec<U::Output>, BatchError<I>>
where
    I: Clone + Send + 'static,
    U: Unit<I>,
{
    let mut batch = Batch::new(BatchConfig::default());
    if let Some(workers) = max_workers {
        batch = batch.with_max_workers(workers);
    }
    batch.run(unit, items).await
}

/// Everything known about a finished batch.
#[derive(Debug)]
pub struct BatchReport<I, O> {
    pub id: Uuid,
    pub workers: NonZeroUsize,
    pub items: Vec<I>,
    /// Successful outputs, in completion order.
    pub results: Vec<O>,
    /// Final status per item, indexed like `items`.
    pub statuses: Vec<JobStatus>,
    pub phase: BatchPhase,
    pub failure: Option<Failure>,
    pub suppressed: Vec<Failure>,
    pub reaped: ReapReport,
}

impl<I, O> BatchReport<I, O> {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.statuses.iter().filter(|s| **s == status).count()
    }

    /// All results, or the aggregate error. Never a partial result set.
    pub fn into_result(self) -> Result<Vec<O>, BatchError<I>> {
        let BatchReport {
            mut items,
            results,
            failure,
            suppressed,
            ..
        } = self;

        match failure {
            None => Ok(results),
            Some(Failure { index, cause }) => Err(BatchError {
                index,
                item: items.swap_remove(index),
                cause,
                suppressed,
            }),
        }
    }
}

/// A configured batch runner. Cheap to keep around and reuse.
#[derive(Clone)]
pub struct Batch {
    cfg: BatchConfig,
    workers: Option<NonZeroUsize>,
    table: Arc<dyn ProcessTable>,
}

impl Batch {
    pub fn new(cfg: BatchConfig) -> Self {
        Self {
            cfg,
            workers: None,
            table: Arc::new(HostProcessTable::new()),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        BatchConfig::from_env().map(Self::new)
    }

    /// Exact worker count, bypassing the configured cap and host clamping.
    pub fn with_max_workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = table;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.cfg
    }

    pub fn worker_count(&self) -> NonZeroUsize {
        self.workers.unwrap_or_else(|| self.cfg.worker_count())
    }

    pub async fn run<I, U>(&self, unit: U, items: Vec<I>) -> Result<Vec<U::Output>, BatchError<I>>
    where
        I: Clone + Send + 'static,
        U: Unit<I>,
    {
        self.run_report(unit, items).await.into_result()
    }

    pub async fn run_report<I, U>(&self, unit: U, items: Vec<I>) -> BatchReport<I, U::Output>
    where
        I: Clone + Send + 'static,
        U: Unit<I>,
    {
        let id = Uuid::new_v4();
        let workers = self.worker_count();
        let span = info_span!(
            target: "forge.core.batch",
            "batch",
            %id,
            unit = unit.name(),
            workers = workers.get(),
            items = items.len(),
        );

        async move {
            info!(target: "forge.core.batch", "batch started");

            let token = CancellationToken::new();
            let claims = ProcessClaims::default();
            let tracker = TaskTracker::new();
            let teardown = Teardown {
                reaper: Reaper::new(
                    Arc::clone(&self.table),
                    self.cfg.reap_grace,
                    self.cfg.poll_interval,
                )
                .with_scope(self.cfg.reap_scope),
                token: token.clone(),
                claims: claims.clone(),
                tracker: tracker.clone(),
                cancel_grace: self.cfg.cancel_grace,
                scope: self.cfg.reap_scope,
                armed: true,
            };

            let root = JobCtx::new(token, claims, Arc::clone(&self.table), tracker);
            let pool = Pool::new(workers, self.cfg.cancel_grace, root);
            let outcome = pool.run(Arc::new(unit), &items).await;
            let reaped = teardown.finish().await;

            match &outcome.failure {
                None => info!(
                    target: "forge.core.batch",
                    results = outcome.results.len(),
                    reaped = reaped.found,
                    "batch completed"
                ),
                Some(f) => error!(
                    target: "forge.core.batch",
                    index = f.index,
                    error = %f.cause,
                    suppressed = outcome.suppressed.len(),
                    reaped = reaped.found,
                    "batch failed"
                ),
            }

            BatchReport {
                id,
                workers,
                items,
                results: outcome.results,
                statuses: outcome.statuses,
                phase: outcome.phase,
                failure: outcome.failure,
                suppressed: outcome.suppressed,
                reaped,
            }
        }
        .instrument(span)
        .await
    }
}

/// Releases the batch's processes on every exit path.
///
/// `finish` is the normal path: cancel, wait for unit workers that run outside the pool
/// (bounded by the cancel grace), then sweep. If the batch future is dropped first, `Drop`
/// cancels the jobs and kills the sweep targets without any grace period.
struct Teardown {
    reaper: Reaper,
    token: CancellationToken,
    claims: ProcessClaims,
    tracker: TaskTracker,
    cancel_grace: Duration,
    scope: ReapScope,
    armed: bool,
}

impl Teardown {
    async fn finish(mut self) -> ReapReport {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.cancel_grace, self.tracker.wait())
            .await
            .is_err()
        {
            error!(
                target: "forge.core.batch",
                running = self.tracker.len(),
                "unit workers still running after the cancel grace; processes they start from now on outlive the batch"
            );
        }

        let report = match self.scope {
            ReapScope::Disabled => ReapReport::default(),
            _ => self.reaper.sweep(&self.claims.snapshot()).await,
        };
        self.armed = false;
        report
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.token.cancel();
        if self.scope != ReapScope::Disabled {
            warn!(target: "forge.core.batch", "batch dropped before teardown; killing batch processes");
            self.reaper.kill_now(&self.claims.snapshot());
        }
    }
}
