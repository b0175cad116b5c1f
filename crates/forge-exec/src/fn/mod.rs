use std::{
    marker::PhantomData,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use async_trait::async_trait;
use forge_core::{BoxError, JobCtx, Unit, UnitError, error::panic_message};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Unit backed by a plain function `Fn(I) -> Result<O, E>`.
///
/// Every call runs on a fresh OS thread so a blocking or CPU-bound function never stalls the
/// runtime. A panic is reported as [`UnitError::WorkerLost`]. On cancellation the job stops
/// waiting immediately. A thread cannot be stopped from outside, but it holds a worker token
/// until it returns, so the batch waits for it (up to the cancel grace) before reaping.
/// Processes the function started are claimed for the batch when it returns.
pub struct FnUnit<F, O, E> {
    name: &'static str,
    f: Arc<F>,
    _out: PhantomData<fn() -> Result<O, E>>,
}

impl<F, O, E> FnUnit<F, O, E> {
    pub fn new(f: F) -> Self {
        Self {
            name: "fn",
            f: Arc::new(f),
            _out: PhantomData,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

type ThreadResult<O, E> = std::thread::Result<Result<O, E>>;

#[async_trait]
impl<I, F, O, E> Unit<I> for FnUnit<F, O, E>
where
    I: Send + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    O: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Output = O;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, item: I, ctx: JobCtx) -> Result<O, UnitError> {
        let index = ctx.index();
        let f = Arc::clone(&self.f);
        let (tx, rx) = oneshot::channel::<ThreadResult<O, E>>();
        let token = ctx.worker_token();
        let thread_ctx = ctx.clone();

        std::thread::Builder::new()
            .name(format!("forge-unit-{index}"))
            .spawn(move || {
                let watch = thread_ctx.watch_spawns();
                let out = catch_unwind(AssertUnwindSafe(|| f(item)));
                watch.claim();
                let _ = tx.send(out);
                drop(token);
            })
            .map_err(|e| UnitError::worker_lost(format!("cannot start worker thread: {e}")))?;
        trace!(target: "forge.exec.fn", index, unit = self.name, "thread started");

        tokio::select! {
            biased;
            out = rx => match out {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err(UnitError::from_error(e)),
                Ok(Err(payload)) => Err(UnitError::worker_lost(format!(
                    "unit panicked: {}",
                    panic_message(&*payload)
                ))),
                Err(_) => Err(UnitError::worker_lost("worker thread exited without a result")),
            },
            _ = ctx.cancelled() => {
                debug!(target: "forge.exec.fn", index, "cancelled; no longer waiting for worker thread");
                Err(UnitError::Cancelled)
            }
        }
    }
}
