//! Fan-out of the work queue across a bounded pool of worker tasks.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::HarvestError;
use crate::queue::WorkQueue;
use crate::sink::RecordStore;
use crate::transport::Transport;
use crate::worker::{Worker, WorkerReporter};

/// Runs `concurrency` workers until the queue drains, the token is
/// cancelled, or a process-fatal error surfaces.
pub struct Dispatcher<T, S>
where
    T: Transport,
    S: RecordStore,
{
    worker: Worker<T, S>,
    queue: WorkQueue,
    concurrency: usize,
}

impl<T, S> Dispatcher<T, S>
where
    T: Transport + 'static,
    S: RecordStore + 'static,
{
    pub fn new(worker: Worker<T, S>, queue: WorkQueue, concurrency: usize) -> Self {
        Self {
            worker,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run<R>(
        &self,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<(), HarvestError>
    where
        R: WorkerReporter + 'static,
    {
        tracing::info!(
            workers = self.concurrency,
            pending = self.queue.remaining(),
            "Dispatching"
        );

        let mut tasks: JoinSet<Result<(), HarvestError>> = JoinSet::new();
        for _ in 0..self.concurrency {
            let worker = self.worker.clone();
            let queue = self.queue.clone();
            let cancel = cancel.clone();
            let reporter = reporter.clone();
            tasks.spawn(async move {
                while !cancel.is_cancelled() {
                    let Some(id) = queue.next() else {
                        break;
                    };
                    if let Err(e) = worker.process(&id, reporter.as_ref()).await {
                        tracing::error!(unit = %id, error = %e, "Fatal worker error, stopping run");
                        cancel.cancel();
                        return Err(e);
                    }
                }
                Ok(())
            });
        }

        let mut fatal: Option<HarvestError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Worker task aborted");
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
