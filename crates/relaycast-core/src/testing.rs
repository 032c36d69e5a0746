//! Shared test fixtures

use std::sync::Arc;

use chrono::Utc;
use relaycast_common::config::HealthConfig;
use relaycast_common::types::{ServerKind, UserId};
use relaycast_storage::{EgressServer, MemoryStore, ServerCapacityWeight, ServerRepository};
use uuid::Uuid;

use crate::health::ServerHealthTracker;

/// An active, healthy, unused server
pub fn server(user_id: UserId, kind: ServerKind, name: &str) -> EgressServer {
    EgressServer {
        id: Uuid::new_v4(),
        user_id,
        kind,
        name: name.to_string(),
        host: format!("{}.example.net", name),
        port: if kind == ServerKind::Relay { 587 } else { 1080 },
        username: None,
        password: None,
        use_tls: false,
        active: true,
        healthy: true,
        success_count: 0,
        failure_count: 0,
        total_requests: 0,
        average_response_time_ms: 0.0,
        last_used_at: None,
        created_at: Utc::now(),
    }
}

/// Store a server so repository lookups find it
pub async fn seed_server(store: &MemoryStore, server: &EgressServer) {
    store.put_server(server.clone()).await;
}

/// Store a capacity entry with the given tweaks applied to the defaults
pub async fn seed_capacity(
    store: &MemoryStore,
    server: &EgressServer,
    tweak: impl FnOnce(&mut ServerCapacityWeight),
) {
    let mut weight = ServerCapacityWeight::default_for(server.user_id, server.kind, server.id);
    tweak(&mut weight);
    store.upsert_capacity_weight(weight).await.unwrap();
}

pub fn tracker(store: &Arc<MemoryStore>) -> Arc<ServerHealthTracker> {
    Arc::new(ServerHealthTracker::new(HealthConfig::default(), store.clone()))
}
