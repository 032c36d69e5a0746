//! Server Selector - Chooses one server of a kind per send
//!
//! Rotation cursors are kept per (campaign, kind) by the selector instance
//! and walk the candidates in creation order, whatever order routing handed
//! them over in. Only active and currently healthy candidates are considered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use relaycast_common::config::SelectionConfig;
use relaycast_common::types::{
    normalize_carrier, CampaignId, RotationStrategy, ServerId, ServerKind, UserId,
};
use relaycast_storage::{CarrierPerformanceRepository, EgressServer, ServerRepository};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::health::ServerHealthTracker;
use crate::routing::Candidate;

/// Best recorded (proxy, relay) combination for a carrier
#[derive(Debug, Clone, Serialize)]
pub struct OptimalPair {
    pub proxy: Option<EgressServer>,
    pub relay: EgressServer,
    pub success_rate: f64,
    pub total_messages: i64,
}

#[derive(Debug, Clone)]
struct CachedPair {
    pair: Option<OptimalPair>,
    expires_at: Instant,
}

/// Server selector
pub struct ServerSelector {
    config: SelectionConfig,
    servers: Arc<dyn ServerRepository>,
    performance: Arc<dyn CarrierPerformanceRepository>,
    health: Arc<ServerHealthTracker>,
    cursors: Mutex<HashMap<(CampaignId, ServerKind), usize>>,
    pairs: Mutex<HashMap<(UserId, String), CachedPair>>,
}

impl ServerSelector {
    pub fn new(
        config: SelectionConfig,
        servers: Arc<dyn ServerRepository>,
        performance: Arc<dyn CarrierPerformanceRepository>,
        health: Arc<ServerHealthTracker>,
    ) -> Self {
        Self {
            config,
            servers,
            performance,
            health,
            cursors: Mutex::new(HashMap::new()),
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Pick a server of `kind` from the candidates with the given strategy.
    /// `None` when no candidate is active and healthy.
    pub fn next(
        &self,
        campaign_id: CampaignId,
        kind: ServerKind,
        strategy: RotationStrategy,
        candidates: &[Candidate],
    ) -> Option<Candidate> {
        let available: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.server.kind == kind && self.health.is_available(&c.server))
            .collect();
        if available.is_empty() {
            return None;
        }

        let chosen = match strategy {
            RotationStrategy::RoundRobin => self.round_robin(campaign_id, kind, &available),
            RotationStrategy::Random => {
                available[rand::thread_rng().gen_range(0..available.len())]
            }
            RotationStrategy::LeastUsed => self.least_used(&available),
            RotationStrategy::BestPerformance => self.best_performance(&available),
            RotationStrategy::Adaptive => adaptive(&available),
        };

        debug!(
            campaign_id = %campaign_id,
            kind = %kind,
            strategy = %strategy,
            server_id = %chosen.server.id,
            "Server selected"
        );
        Some(chosen.clone())
    }

    fn round_robin<'a>(
        &self,
        campaign_id: CampaignId,
        kind: ServerKind,
        available: &[&'a Candidate],
    ) -> &'a Candidate {
        let mut available = available.to_vec();
        available.sort_by_key(|c| (c.server.created_at, c.server.id));

        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry((campaign_id, kind)).or_insert(0);
        let chosen = available[*cursor % available.len()];
        *cursor = cursor.wrapping_add(1);
        chosen
    }

    /// Fewest lifetime requests; the earliest candidate wins ties
    fn least_used<'a>(&self, available: &[&'a Candidate]) -> &'a Candidate {
        let mut best = available[0];
        let mut best_total = self.health.total_requests(&best.server);
        for &candidate in &available[1..] {
            let total = self.health.total_requests(&candidate.server);
            if total < best_total {
                best = candidate;
                best_total = total;
            }
        }
        best
    }

    /// Highest recent success rate, then lowest average response time
    fn best_performance<'a>(&self, available: &[&'a Candidate]) -> &'a Candidate {
        let score = |c: &Candidate| {
            (
                self.health.success_rate(&c.server),
                self.health.average_response_ms(&c.server),
            )
        };
        let mut best = available[0];
        let (mut best_rate, mut best_ms) = score(best);
        for &candidate in &available[1..] {
            let (rate, ms) = score(candidate);
            if rate > best_rate || (rate == best_rate && ms < best_ms) {
                best = candidate;
                best_rate = rate;
                best_ms = ms;
            }
        }
        best
    }

    /// Drop the rotation cursors of a finished campaign
    pub fn forget_campaign(&self, campaign_id: CampaignId) {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _), _| *id != campaign_id);
    }

    /// Best recorded combination for the carrier with enough history and a
    /// high enough success rate, if its servers are still usable.
    ///
    /// Lookups are cached per (user, carrier); cached pairs are re-checked
    /// for availability on every hit.
    pub async fn optimal_pair(&self, user_id: UserId, carrier: &str) -> Option<OptimalPair> {
        let carrier = normalize_carrier(carrier);
        if carrier.is_empty() {
            return None;
        }
        let key = (user_id, carrier.clone());

        let cached = {
            let pairs = self.pairs.lock().unwrap_or_else(|e| e.into_inner());
            pairs
                .get(&key)
                .filter(|c| c.expires_at > Instant::now())
                .map(|c| c.pair.clone())
        };
        let pair = match cached {
            Some(pair) => pair,
            None => {
                let pair = self.lookup_pair(user_id, &carrier).await;
                let ttl = Duration::from_secs(self.config.pair_cache_ttl_secs);
                self.pairs.lock().unwrap_or_else(|e| e.into_inner()).insert(
                    key,
                    CachedPair {
                        pair: pair.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                pair
            }
        };

        pair.filter(|p| {
            self.health.is_available(&p.relay)
                && p.proxy.as_ref().map_or(true, |proxy| self.health.is_available(proxy))
        })
    }

    async fn lookup_pair(&self, user_id: UserId, carrier: &str) -> Option<OptimalPair> {
        let logs = match self.performance.for_carrier(user_id, carrier).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(carrier, "Failed to load carrier performance: {}", e);
                return None;
            }
        };

        let best = logs.into_iter().find(|log| {
            log.total_messages >= self.config.min_samples
                && log.success_rate >= self.config.min_success_rate
        })?;

        let relay = self.load_server(best.relay_server_id).await?;
        let proxy = match best.proxy_server_id {
            Some(id) => Some(self.load_server(id).await?),
            None => None,
        };

        debug!(
            carrier,
            relay = %relay.name,
            success_rate = best.success_rate,
            total = best.total_messages,
            "Carrier-optimal pair found"
        );
        Some(OptimalPair {
            proxy,
            relay,
            success_rate: best.success_rate,
            total_messages: best.total_messages,
        })
    }

    async fn load_server(&self, id: ServerId) -> Option<EgressServer> {
        match self.servers.get(id).await {
            Ok(server) => server.filter(|s| s.active),
            Err(e) => {
                warn!(server_id = %id, "Failed to load server: {}", e);
                None
            }
        }
    }
}

/// Weighted random draw over effective weights
fn adaptive<'a>(available: &[&'a Candidate]) -> &'a Candidate {
    available
        .choose_weighted(&mut rand::thread_rng(), |c| c.effective_weight.max(0.0))
        .copied()
        .unwrap_or(available[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_server, server, tracker};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use relaycast_common::types::ErrorType;
    use relaycast_storage::{CarrierPerformanceLog, MemoryStore, ServerCapacityWeight};
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        health: Arc<ServerHealthTracker>,
        selector: ServerSelector,
        user_id: UserId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let health = tracker(&store);
        let selector = ServerSelector::new(
            SelectionConfig::default(),
            store.clone(),
            store.clone(),
            health.clone(),
        );
        Fixture {
            store,
            health,
            selector,
            user_id: Uuid::new_v4(),
        }
    }

    fn candidate(server: EgressServer) -> Candidate {
        let capacity = ServerCapacityWeight::default_for(server.user_id, server.kind, server.id);
        Candidate {
            server,
            capacity,
            effective_weight: 1.0,
        }
    }

    /// Relays named r1.. in creation order
    fn relays(user_id: UserId, count: usize) -> Vec<Candidate> {
        let created = Utc::now();
        (1..=count)
            .map(|i| {
                let mut server = server(user_id, ServerKind::Relay, &format!("r{}", i));
                server.created_at = created + chrono::Duration::seconds(i as i64);
                candidate(server)
            })
            .collect()
    }

    fn pick(fx: &Fixture, campaign: CampaignId, strategy: RotationStrategy, list: &[Candidate]) -> String {
        fx.selector
            .next(campaign, ServerKind::Relay, strategy, list)
            .unwrap()
            .server
            .name
    }

    #[test]
    fn test_round_robin_cycles() {
        let fx = fixture();
        let list = relays(fx.user_id, 3);
        let campaign = Uuid::new_v4();

        let picks: Vec<String> = (0..6)
            .map(|_| pick(&fx, campaign, RotationStrategy::RoundRobin, &list))
            .collect();
        assert_eq!(picks, vec!["r1", "r2", "r3", "r1", "r2", "r3"]);

        // Cursors are per campaign
        assert_eq!(pick(&fx, Uuid::new_v4(), RotationStrategy::RoundRobin, &list), "r1");
    }

    #[test]
    fn test_round_robin_ignores_routing_order() {
        let fx = fixture();
        let list = relays(fx.user_id, 2);
        let mut reordered = list.clone();
        reordered.reverse();
        let campaign = Uuid::new_v4();

        // Routing puts a timezone match first for some destinations only
        let picks: Vec<String> = (0..4)
            .map(|i| {
                let order = if i % 2 == 0 { &list } else { &reordered };
                pick(&fx, campaign, RotationStrategy::RoundRobin, order)
            })
            .collect();
        assert_eq!(picks, vec!["r1", "r2", "r1", "r2"]);
    }

    #[tokio::test]
    async fn test_unhealthy_and_inactive_skipped() {
        let fx = fixture();
        let mut list = relays(fx.user_id, 3);
        list[1].server.active = false;
        let campaign = Uuid::new_v4();

        for _ in 0..10 {
            fx.health
                .record_failure(
                    ServerKind::Relay,
                    list[2].server.id,
                    campaign,
                    "boom",
                    ErrorType::Server,
                )
                .await;
        }

        for _ in 0..3 {
            assert_eq!(pick(&fx, campaign, RotationStrategy::RoundRobin, &list), "r1");
        }

        list[0].server.active = false;
        assert!(fx
            .selector
            .next(campaign, ServerKind::Relay, RotationStrategy::Random, &list)
            .is_none());
        assert!(fx
            .selector
            .next(campaign, ServerKind::Proxy, RotationStrategy::RoundRobin, &[])
            .is_none());
    }

    #[test]
    fn test_least_used_and_best_performance() {
        let fx = fixture();
        let mut list = relays(fx.user_id, 3);
        list[0].server.total_requests = 40;
        list[1].server.total_requests = 10;
        list[2].server.total_requests = 10;
        let campaign = Uuid::new_v4();
        assert_eq!(pick(&fx, campaign, RotationStrategy::LeastUsed, &list), "r2");

        list[0].server.success_count = 9;
        list[0].server.failure_count = 1;
        list[1].server.success_count = 10;
        list[1].server.average_response_time_ms = 900.0;
        list[2].server.success_count = 10;
        list[2].server.average_response_time_ms = 300.0;
        assert_eq!(pick(&fx, campaign, RotationStrategy::BestPerformance, &list), "r3");
    }

    #[test]
    fn test_random_and_adaptive_pick_members() {
        let fx = fixture();
        let list = relays(fx.user_id, 3);
        let names: Vec<String> = list.iter().map(|c| c.server.name.clone()).collect();
        let campaign = Uuid::new_v4();
        for strategy in [RotationStrategy::Random, RotationStrategy::Adaptive] {
            for _ in 0..20 {
                assert!(names.contains(&pick(&fx, campaign, strategy, &list)));
            }
        }
    }

    async fn seed_log(fx: &Fixture, relay: &EgressServer, total: i64, successes: i64) {
        fx.store
            .put_performance(CarrierPerformanceLog {
                user_id: fx.user_id,
                carrier: "Verizon".into(),
                proxy_server_id: None,
                relay_server_id: relay.id,
                total_messages: total,
                successful_messages: successes,
                success_rate: successes as f64 / total as f64,
                average_delivery_ms: 400.0,
                updated_at: Utc::now(),
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_pair_thresholds_and_cache() {
        let fx = fixture();
        let sparse = server(fx.user_id, ServerKind::Relay, "sparse");
        let steady = server(fx.user_id, ServerKind::Relay, "steady");
        seed_server(&fx.store, &sparse).await;
        seed_server(&fx.store, &steady).await;

        // Perfect but too few samples
        seed_log(&fx, &sparse, 5, 5).await;
        assert!(fx.selector.optimal_pair(fx.user_id, "verizon").await.is_none());

        // Cached miss survives new history until the TTL passes
        seed_log(&fx, &steady, 50, 45).await;
        assert!(fx.selector.optimal_pair(fx.user_id, "verizon").await.is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        let pair = fx.selector.optimal_pair(fx.user_id, "VERIZON").await.unwrap();
        assert_eq!(pair.relay.name, "steady");
        assert!(pair.proxy.is_none());
        assert_eq!(pair.total_messages, 50);
    }

    #[tokio::test]
    async fn test_optimal_pair_requires_available_servers() {
        let fx = fixture();
        let relay = server(fx.user_id, ServerKind::Relay, "steady");
        seed_server(&fx.store, &relay).await;
        seed_log(&fx, &relay, 50, 48).await;
        assert!(fx.selector.optimal_pair(fx.user_id, "verizon").await.is_some());

        for _ in 0..10 {
            fx.health
                .record_failure(ServerKind::Relay, relay.id, Uuid::new_v4(), "boom", ErrorType::Server)
                .await;
        }
        assert!(fx.selector.optimal_pair(fx.user_id, "verizon").await.is_none());
    }
}
