//! Conditional routing rules

mod engine;

pub use engine::{Candidate, RoutingDecision, RoutingRulesEngine};
