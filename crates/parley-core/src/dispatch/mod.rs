//! Dispatch queue and worker pool.
//!
//! Closed batches and claimed retries travel as explicit [`WorkItem`]s over a
//! bounded channel. Producers never block: `enqueue` either accepts the item
//! or fails immediately. The [`WorkerPool`] drains the channel and runs each
//! item on its own tokio task, bounded by a semaphore.

pub mod channel;
pub mod pool;

use parley_types::error::PipelineError;
use parley_types::work::WorkItem;
use thiserror::Error;

pub use channel::ChannelDispatchQueue;
pub use pool::{WorkHandler, WorkerPool};

/// Errors that can occur when handing work to the queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The bounded queue has no free slot.
    #[error("dispatch queue is full")]
    QueueFull,

    /// The consuming side has shut down.
    #[error("dispatch queue is closed")]
    Closed,
}

impl From<DispatchError> for PipelineError {
    fn from(err: DispatchError) -> Self {
        PipelineError::Dispatch(err.to_string())
    }
}

/// Producer side of the dispatch queue.
pub trait DispatchQueue: Send + Sync + 'static {
    /// Hand one work item to the workers without blocking.
    fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError>;
}
