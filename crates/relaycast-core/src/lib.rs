//! Relaycast Core - Delivery dispatch engine
//!
//! Routes outbound SMS messages (sent through SMTP-to-SMS gateways) across a
//! pool of proxy and relay servers. Every send goes through server selection,
//! a per-carrier rate-limit gate, a send delay, the transport, and failure
//! classification with retry scheduling. Outcomes feed back into health
//! tracking and carrier performance history for later selections.

pub mod carrier;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod optimization;
pub mod rate_limit;
pub mod retry;
pub mod rotation;
pub mod routing;
pub mod transport;

#[cfg(test)]
mod testing;

pub use deferred::{DeferredScheduler, DeferredTask, DelayQueueScheduler};
pub use dispatch::{DispatchCoordinator, PassReport, RotationStats};
pub use error::DispatchError;
pub use health::{HealthSnapshot, InFlightGuard, ServerHealthTracker};
pub use optimization::{OptimizationAdvisor, Recommendation};
pub use rate_limit::RateLimiter;
pub use retry::{classify, RetryPolicy, RetryScheduler, RetryStats};
pub use rotation::{OptimalPair, ServerSelector};
pub use routing::{Candidate, RoutingDecision, RoutingRulesEngine};
pub use transport::{SendOutcome, SendRequest, SmtpGatewayTransport, TransportSender};
