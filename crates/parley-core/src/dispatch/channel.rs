use parley_types::work::WorkItem;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DispatchError, DispatchQueue};

/// [`DispatchQueue`] backed by a bounded `tokio::sync::mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatchQueue {
    sender: mpsc::Sender<WorkItem>,
}

impl ChannelDispatchQueue {
    /// Create a queue and the receiver the worker pool consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Free slots left in the queue.
    pub fn remaining_capacity(&self) -> usize {
        self.sender.capacity()
    }
}

impl DispatchQueue for ChannelDispatchQueue {
    fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        let kind = item.label();
        match self.sender.try_send(item) {
            Ok(()) => {
                debug!(kind, "work item enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind, "dispatch queue full");
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::task::Task;
    use parley_types::work::BatchWorkItem;
    use uuid::Uuid;

    fn item() -> WorkItem {
        WorkItem::Batch(BatchWorkItem {
            task: Task::open(Uuid::now_v7(), Utc::now()),
            messages: Vec::new(),
            aggregated_content: String::new(),
            retry: None,
        })
    }

    #[tokio::test]
    async fn enqueue_delivers_to_receiver() {
        let (queue, mut rx) = ChannelDispatchQueue::channel(4);
        queue.enqueue(item()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.label(), "batch");
    }

    #[test]
    fn enqueue_on_full_queue_fails_fast() {
        let (queue, _rx) = ChannelDispatchQueue::channel(1);
        queue.enqueue(item()).unwrap();
        assert_eq!(queue.remaining_capacity(), 0);

        let err = queue.enqueue(item()).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull));
    }

    #[test]
    fn enqueue_after_receiver_dropped_is_closed() {
        let (queue, rx) = ChannelDispatchQueue::channel(4);
        drop(rx);

        let err = queue.enqueue(item()).unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }
}
