//! `DelayQueue`-backed scheduler
//!
//! A single dispatcher task owns the queue. Callers hand tasks over an
//! unbounded channel; each expired task is spawned onto the runtime so a slow
//! task never delays the next deadline.

use std::future::poll_fn;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

use super::{DeferredScheduler, DeferredTask};
use crate::error::DispatchError;

/// Deferred scheduler driven by a dispatcher task
#[derive(Clone)]
pub struct DelayQueueScheduler {
    tx: mpsc::UnboundedSender<(Instant, DeferredTask)>,
}

impl DelayQueueScheduler {
    /// Start the dispatcher. It runs until `shutdown` fires, or until every
    /// handle is dropped and the queue has drained.
    pub fn spawn(shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_dispatcher(rx, shutdown));
        (Self { tx }, handle)
    }
}

impl DeferredScheduler for DelayQueueScheduler {
    fn schedule(&self, run_at: Instant, task: DeferredTask) -> Result<(), DispatchError> {
        self.tx
            .send((run_at, task))
            .map_err(|_| DispatchError::Scheduler("deferred dispatcher has stopped".to_string()))
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<(Instant, DeferredTask)>,
    shutdown: CancellationToken,
) {
    let mut queue: DelayQueue<DeferredTask> = DelayQueue::new();
    let mut closed = false;

    loop {
        if closed && queue.is_empty() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(pending = queue.len(), "Deferred dispatcher shutting down");
                break;
            }
            received = rx.recv(), if !closed => match received {
                Some((run_at, task)) => {
                    queue.insert_at(task, run_at);
                    debug!(pending = queue.len(), "Deferred task queued");
                }
                None => closed = true,
            },
            Some(expired) = poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                tokio::spawn(expired.into_inner());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_task(counter: &Arc<AtomicUsize>) -> DeferredTask {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_at_deadline() {
        let (scheduler, _handle) = DelayQueueScheduler::spawn(CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Instant::now() + Duration::from_secs(60), counting_task(&counter))
            .unwrap();
        scheduler
            .schedule(Instant::now() + Duration::from_secs(120), counting_task(&counter))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_runs_immediately() {
        let (scheduler, _handle) = DelayQueueScheduler::spawn(CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Instant::now(), counting_task(&counter))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dispatcher() {
        let shutdown = CancellationToken::new();
        let (scheduler, handle) = DelayQueueScheduler::spawn(shutdown.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Instant::now() + Duration::from_secs(30), counting_task(&counter))
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        assert!(scheduler
            .schedule(Instant::now(), counting_task(&counter))
            .is_err());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
