//! Dispatch - Campaign orchestration over the send pipeline

mod coordinator;
mod pipeline;

pub use coordinator::{DispatchCoordinator, PassReport, RotationStats};
pub use pipeline::{send_delay, send_window_deferral};
