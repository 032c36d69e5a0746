//! Server rotation

mod selector;

pub use selector::{OptimalPair, ServerSelector};
