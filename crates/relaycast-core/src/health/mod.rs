//! Server health tracking

mod tracker;

pub use tracker::{HealthSnapshot, InFlightGuard, ServerHealth, ServerHealthTracker};
