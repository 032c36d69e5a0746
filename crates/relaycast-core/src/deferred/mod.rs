//! Deferred execution of retry tasks

mod queue;

use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

use crate::error::DispatchError;

pub use queue::DelayQueueScheduler;

/// A unit of work run once its deadline passes
pub type DeferredTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs tasks at a later instant
pub trait DeferredScheduler: Send + Sync {
    /// Queue `task` to run at `run_at`; past instants run immediately
    fn schedule(&self, run_at: Instant, task: DeferredTask) -> Result<(), DispatchError>;
}
