//! Server Health Tracker - Rolling per-server outcome windows
//!
//! Every egress server gets its own `ServerHealth`, shared behind an `Arc`
//! and looked up from a read-mostly map, so recording outcomes for one server
//! never contends with another. Outcomes are also written through to the
//! store (lifetime counters, health flag, per-campaign usage); store failures
//! are logged and never reach the send path.
//!
//! An unhealthy server gets no traffic, so its window cannot heal by itself.
//! Once `recovery_cooldown_secs` has passed since it was marked unhealthy the
//! next health check admits it on probation with an empty window: the first
//! outcome after that either restores it or marks it unhealthy again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use relaycast_common::config::HealthConfig;
use relaycast_common::types::{CampaignId, ErrorType, ServerId, ServerKind};
use relaycast_storage::{EgressServer, ServerRepository, UsageUpdate};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    response_ms: Option<f64>,
}

/// Live state of one server
#[derive(Debug)]
pub struct ServerHealth {
    kind: ServerKind,
    success: AtomicU64,
    failure: AtomicU64,
    total: AtomicU64,
    in_flight: AtomicU64,
    healthy: AtomicBool,
    /// Admitted after a cooldown; the next outcome settles its health
    probation: AtomicBool,
    /// When the server was last marked unhealthy
    tripped_at: Mutex<Option<Instant>>,
    window: Mutex<VecDeque<Sample>>,
}

impl ServerHealth {
    fn new(kind: ServerKind, healthy: bool, success: u64, failure: u64, total: u64) -> Self {
        Self {
            kind,
            success: AtomicU64::new(success),
            failure: AtomicU64::new(failure),
            total: AtomicU64::new(total),
            in_flight: AtomicU64::new(0),
            healthy: AtomicBool::new(healthy),
            probation: AtomicBool::new(false),
            tripped_at: Mutex::new(None),
            window: Mutex::new(VecDeque::new()),
        }
    }

    fn trip(&self) {
        *self.tripped_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Put the server on probation if its cooldown has run out
    fn admit_trial(&self, cooldown: Duration) -> bool {
        let mut tripped_at = self.tripped_at.lock().unwrap_or_else(|e| e.into_inner());
        match *tripped_at {
            Some(at) if at.elapsed() >= cooldown => {
                *tripped_at = None;
                self.window
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
                self.probation.store(true, Ordering::Release);
                self.healthy.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    fn push(&self, sample: Sample, capacity: usize) -> WindowStats {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(sample);
        while window.len() > capacity.max(1) {
            window.pop_front();
        }
        WindowStats::of(&window)
    }

    fn stats(&self) -> WindowStats {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        WindowStats::of(&window)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowStats {
    samples: usize,
    successes: usize,
    average_response_ms: Option<f64>,
}

impl WindowStats {
    fn of(window: &VecDeque<Sample>) -> Self {
        let successes = window.iter().filter(|s| s.success).count();
        let timings: Vec<f64> = window.iter().filter_map(|s| s.response_ms).collect();
        let average_response_ms = if timings.is_empty() {
            None
        } else {
            Some(timings.iter().sum::<f64>() / timings.len() as f64)
        };
        Self {
            samples: window.len(),
            successes,
            average_response_ms,
        }
    }

    fn success_rate(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.successes as f64 / self.samples as f64)
    }
}

/// Point-in-time view of a server's health
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub server_id: ServerId,
    pub kind: ServerKind,
    pub healthy: bool,
    pub samples: usize,
    /// Success rate over the recent window, if it holds any samples
    pub recent_success_rate: Option<f64>,
    pub average_response_ms: Option<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub in_flight: u64,
}

/// Decrements the server's in-flight count when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    health: Arc<ServerHealth>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.health.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Server health tracker
pub struct ServerHealthTracker {
    config: HealthConfig,
    servers: RwLock<HashMap<ServerId, Arc<ServerHealth>>>,
    store: Arc<dyn ServerRepository>,
}

impl ServerHealthTracker {
    pub fn new(config: HealthConfig, store: Arc<dyn ServerRepository>) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a server loaded from the store, seeding the lifetime
    /// counters from its stored values. Known servers are left untouched.
    ///
    /// Health is derived from the recent window only, so a server starts
    /// healthy in a new process whatever flag the store carries.
    pub fn observe(&self, server: &EgressServer) {
        if self.lookup(server.id).is_some() {
            return;
        }
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.entry(server.id).or_insert_with(|| {
            Arc::new(ServerHealth::new(
                server.kind,
                true,
                server.success_count.max(0) as u64,
                server.failure_count.max(0) as u64,
                server.total_requests.max(0) as u64,
            ))
        });
    }

    fn lookup(&self, id: ServerId) -> Option<Arc<ServerHealth>> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn entry(&self, kind: ServerKind, id: ServerId) -> Arc<ServerHealth> {
        if let Some(health) = self.lookup(id) {
            return health;
        }
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers
            .entry(id)
            .or_insert_with(|| Arc::new(ServerHealth::new(kind, true, 0, 0, 0)))
            .clone()
    }

    /// Mark a request as in flight until the guard is dropped
    pub fn begin_request(&self, kind: ServerKind, id: ServerId) -> InFlightGuard {
        let health = self.entry(kind, id);
        health.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { health }
    }

    /// Current health; servers never seen use their stored flag. An
    /// unhealthy server whose cooldown has passed is admitted on probation.
    pub fn is_healthy(&self, server: &EgressServer) -> bool {
        let Some(health) = self.lookup(server.id) else {
            return server.healthy;
        };
        if health.healthy.load(Ordering::Acquire) {
            return true;
        }
        let cooldown = Duration::from_secs(self.config.recovery_cooldown_secs);
        let admitted = health.admit_trial(cooldown);
        if admitted {
            info!(
                server_id = %server.id,
                kind = %health.kind,
                "Cooldown elapsed, admitting trial sends"
            );
        }
        admitted
    }

    /// Whether the server is enabled and currently healthy
    pub fn is_available(&self, server: &EgressServer) -> bool {
        server.active && self.is_healthy(server)
    }

    pub fn in_flight(&self, id: ServerId) -> u64 {
        self.lookup(id)
            .map(|h| h.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn snapshot(&self, id: ServerId) -> Option<HealthSnapshot> {
        let health = self.lookup(id)?;
        let stats = health.stats();
        Some(HealthSnapshot {
            server_id: id,
            kind: health.kind,
            healthy: health.healthy.load(Ordering::Acquire),
            samples: stats.samples,
            recent_success_rate: stats.success_rate(),
            average_response_ms: stats.average_response_ms,
            success_count: health.success.load(Ordering::Acquire),
            failure_count: health.failure.load(Ordering::Acquire),
            total_requests: health.total.load(Ordering::Acquire),
            in_flight: health.in_flight.load(Ordering::Acquire),
        })
    }

    /// Recent success rate, falling back to the server's lifetime rate
    pub fn success_rate(&self, server: &EgressServer) -> f64 {
        self.snapshot(server.id)
            .and_then(|s| s.recent_success_rate)
            .unwrap_or_else(|| server.success_rate())
    }

    /// Recent average response time, falling back to the stored average
    pub fn average_response_ms(&self, server: &EgressServer) -> f64 {
        self.snapshot(server.id)
            .and_then(|s| s.average_response_ms)
            .unwrap_or(server.average_response_time_ms)
    }

    /// Lifetime request count including this process's sends
    pub fn total_requests(&self, server: &EgressServer) -> u64 {
        self.snapshot(server.id)
            .map(|s| s.total_requests)
            .unwrap_or(server.total_requests.max(0) as u64)
    }

    pub async fn record_success(
        &self,
        kind: ServerKind,
        server_id: ServerId,
        campaign_id: CampaignId,
        response_time: Duration,
    ) {
        let response_ms = response_time.as_secs_f64() * 1000.0;
        let health = self.entry(kind, server_id);
        health.success.fetch_add(1, Ordering::AcqRel);
        health.total.fetch_add(1, Ordering::AcqRel);
        let stats = health.push(
            Sample {
                success: true,
                response_ms: Some(response_ms),
            },
            self.config.window_size,
        );

        debug!(server_id = %server_id, kind = %kind, response_ms, "Recorded success");
        self.finish(&health, server_id, campaign_id, stats, true, response_ms)
            .await;
    }

    pub async fn record_failure(
        &self,
        kind: ServerKind,
        server_id: ServerId,
        campaign_id: CampaignId,
        error: &str,
        error_type: ErrorType,
    ) {
        let health = self.entry(kind, server_id);
        health.failure.fetch_add(1, Ordering::AcqRel);
        health.total.fetch_add(1, Ordering::AcqRel);
        let stats = health.push(
            Sample {
                success: false,
                response_ms: None,
            },
            self.config.window_size,
        );

        debug!(
            server_id = %server_id,
            kind = %kind,
            error_type = %error_type,
            error,
            "Recorded failure"
        );
        self.finish(&health, server_id, campaign_id, stats, false, 0.0)
            .await;
    }

    /// Health verdict for the current window
    fn evaluate(&self, kind: ServerKind, stats: &WindowStats) -> bool {
        if stats.samples < self.config.min_samples {
            return true;
        }
        let ceiling = match kind {
            ServerKind::Proxy => self.config.proxy_max_response_ms,
            ServerKind::Relay => self.config.relay_max_response_ms,
        } as f64;

        let rate_ok = stats
            .success_rate()
            .map_or(true, |rate| rate >= self.config.success_floor);
        let latency_ok = stats.average_response_ms.map_or(true, |ms| ms <= ceiling);
        rate_ok && latency_ok
    }

    async fn finish(
        &self,
        health: &ServerHealth,
        server_id: ServerId,
        campaign_id: CampaignId,
        stats: WindowStats,
        success: bool,
        response_ms: f64,
    ) {
        let on_probation = health.probation.swap(false, Ordering::AcqRel);
        let healthy = if on_probation {
            success
        } else {
            self.evaluate(health.kind, &stats)
        };
        let was_healthy = health.healthy.swap(healthy, Ordering::AcqRel);

        // The stored flag still says unhealthy while on probation
        if on_probation || healthy != was_healthy {
            if healthy {
                info!(server_id = %server_id, kind = %health.kind, "Server recovered");
            } else {
                health.trip();
                warn!(
                    server_id = %server_id,
                    kind = %health.kind,
                    success_rate = stats.success_rate().unwrap_or(0.0),
                    average_response_ms = stats.average_response_ms.unwrap_or(0.0),
                    "Server marked unhealthy"
                );
            }
            if let Err(e) = self.store.set_health(server_id, healthy).await {
                warn!(server_id = %server_id, "Failed to persist server health: {}", e);
            }
        }

        if let Err(e) = self
            .store
            .increment_counters(server_id, success, response_ms)
            .await
        {
            warn!(server_id = %server_id, "Failed to persist server counters: {}", e);
        }

        let usage = UsageUpdate {
            campaign_id,
            kind: health.kind,
            server_id,
            success,
        };
        if let Err(e) = self.store.record_usage(usage).await {
            warn!(server_id = %server_id, "Failed to persist server usage: {}", e);
        }
    }
}
