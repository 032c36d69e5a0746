//! Optimization - Feeds observed rotation results back into campaign settings

mod advisor;

pub use advisor::{OptimizationAdvisor, Recommendation};
