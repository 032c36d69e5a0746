//! Relaycast Storage - Persistence for the dispatch engine
//!
//! The dispatch engine only talks to the repository traits defined here.
//! Two backends implement them: PostgreSQL through `sqlx`, and an in-memory
//! store used by tests and the `memory` backend.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
