//! Bounded-concurrency consumer for the dispatch queue.
//!
//! Each received work item runs on its own tokio task inside a `JoinSet`,
//! gated by a semaphore permit. Cancelling the pool's token stops intake,
//! then every item already queued is still processed and all in-flight tasks
//! are awaited before `run` returns.

use std::sync::Arc;

use parley_types::work::WorkItem;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Something that can process one work item to completion.
///
/// Implementations handle their own errors; the pool only logs panics.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, item: WorkItem) -> impl std::future::Future<Output = ()> + Send;
}

pub struct WorkerPool<H> {
    receiver: mpsc::Receiver<WorkItem>,
    handler: Arc<H>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl<H: WorkHandler> WorkerPool<H> {
    pub fn new(
        receiver: mpsc::Receiver<WorkItem>,
        handler: Arc<H>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            receiver,
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            cancel,
        }
    }

    /// Run until cancelled or until every queue sender is dropped.
    pub async fn run(mut self) {
        info!(concurrency = self.concurrency, "worker pool starting");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(item) => self.spawn(&mut in_flight, item).await,
                    None => break,
                },
            }

            while let Some(result) = in_flight.try_join_next() {
                log_join_result(result);
            }
        }

        // Stop intake, then finish what was already accepted.
        self.receiver.close();
        let mut drained = 0usize;
        while let Ok(item) = self.receiver.try_recv() {
            self.spawn(&mut in_flight, item).await;
            drained += 1;
        }

        while let Some(result) = in_flight.join_next().await {
            log_join_result(result);
        }

        info!(drained, "worker pool stopped");
    }

    async fn spawn(&self, in_flight: &mut JoinSet<()>, item: WorkItem) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(kind = item.label(), "worker semaphore closed, dropping work item");
                return;
            }
        };

        debug!(kind = item.label(), "dispatching work item");
        let handler = Arc::clone(&self.handler);
        in_flight.spawn(async move {
            let _permit = permit;
            handler.handle(item).await;
        });
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "work item task panicked");
    }
}
