//! Failure classification, retry policy and retry scheduling

mod classifier;
mod policy;
mod scheduler;

pub use classifier::{classify, is_rate_limited};
pub use policy::RetryPolicy;
pub use scheduler::{RetryScheduler, RetryStats};
