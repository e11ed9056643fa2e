//! Fire-and-forget dispatch from the webhook receiver to the processor
//!
//! The receiver submits an event id and returns without waiting. Submissions
//! go through a bounded channel drained by one [`DispatchWorker`]. A full or
//! closed queue drops the submission: the event stays `PENDING` and the
//! processing sweep picks it up, so delivery is at-least-once overall.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::processor::{EventProcessor, ProcessOutcome, ProcessTrigger};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    /// Left for the sweep
    QueueFull,
    /// Worker is gone; left for the sweep
    Closed,
}

/// Submission side, cloned into request handlers
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<String>,
}

impl Dispatcher {
    pub fn new(processor: EventProcessor, capacity: usize) -> (Self, DispatchWorker) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self { sender },
            DispatchWorker {
                processor,
                receiver,
            },
        )
    }

    /// Queue an event for processing. Never waits.
    pub fn submit(&self, event_id: &str) -> DispatchOutcome {
        match self.sender.try_send(event_id.to_string()) {
            Ok(()) => DispatchOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                metrics::counter!("billing_dispatch_dropped_total", "reason" => "full").increment(1);
                tracing::warn!(event_id = %event_id, "Dispatch queue full, leaving event for sweep");
                DispatchOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                metrics::counter!("billing_dispatch_dropped_total", "reason" => "closed")
                    .increment(1);
                tracing::warn!(event_id = %event_id, "Dispatch worker stopped, leaving event for sweep");
                DispatchOutcome::Closed
            }
        }
    }
}

/// Drains the dispatch queue, one event at a time
pub struct DispatchWorker {
    processor: EventProcessor,
    receiver: mpsc::Receiver<String>,
}

impl DispatchWorker {
    /// Run until every [`Dispatcher`] clone is dropped
    ///
    /// ```rust,ignore
    /// tokio::spawn(worker.run());
    /// ```
    pub async fn run(mut self) {
        tracing::info!("Starting billing dispatch worker");

        while let Some(event_id) = self.receiver.recv().await {
            if let ProcessOutcome::Failed(error) = self
                .processor
                .process_event(&event_id, ProcessTrigger::Webhook)
                .await
            {
                tracing::debug!(event_id = %event_id, error = %error, "Dispatched event failed");
            }
        }

        tracing::info!("Billing dispatch worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::processor::ProcessorConfig;
    use crate::store::{MemoryStore, Stores};

    fn processor() -> EventProcessor {
        EventProcessor::new(
            Stores::memory(Arc::new(MemoryStore::new())),
            ProcessorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_submit_reports_full_queue() {
        let (dispatcher, _worker) = Dispatcher::new(processor(), 1);
        assert_eq!(dispatcher.submit("evt_1"), DispatchOutcome::Queued);
        assert_eq!(dispatcher.submit("evt_2"), DispatchOutcome::QueueFull);
    }

    #[tokio::test]
    async fn test_submit_reports_closed_worker() {
        let (dispatcher, worker) = Dispatcher::new(processor(), 4);
        drop(worker);
        assert_eq!(dispatcher.submit("evt_1"), DispatchOutcome::Closed);
    }

    #[tokio::test]
    async fn test_worker_stops_when_dispatchers_dropped() {
        let (dispatcher, worker) = Dispatcher::new(processor(), 4);
        let handle = tokio::spawn(worker.run());
        assert_eq!(dispatcher.submit("missing"), DispatchOutcome::Queued);
        drop(dispatcher);
        handle.await.unwrap();
    }
}
