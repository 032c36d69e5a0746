//! Routing Rules Engine - Evaluates conditional routing rules against a
//! destination and shapes the candidate server lists
//!
//! Rules combine their conditions with AND logic. Matching rules apply in
//! priority order (highest first, then oldest, then by id); each one may only
//! narrow or reorder the candidates left by the rules before it.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use relaycast_common::types::{normalize_carrier, RuleId, ServerId, ServerKind, UserId};
use relaycast_storage::{
    EgressServer, RoutingRule, RoutingRuleRepository, ServerCapacityWeight, ServerRepository,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::carrier::{geo_info, local_hour, within_window, GeoInfo};
use crate::health::ServerHealthTracker;

/// Compiled size limit for user-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Compiled patterns kept before the cache starts over; edited rules leave
/// their old patterns behind
const PATTERN_CACHE_LIMIT: usize = 1024;

/// Weight never drops below this, so every candidate stays selectable
const MIN_EFFECTIVE_WEIGHT: f64 = 0.01;

/// A server eligible for selection, with its capacity metadata
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub server: EgressServer,
    pub capacity: ServerCapacityWeight,
    /// Capacity weight adjusted for load and recent performance
    pub effective_weight: f64,
}

/// Outcome of routing one destination
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub proxies: Vec<Candidate>,
    pub relays: Vec<Candidate>,
    /// Product of the matched rules' multipliers
    pub rate_limit_multiplier: f64,
    /// Matched rule ids in application order
    pub matched_rules: Vec<RuleId>,
    pub geo: GeoInfo,
    /// Declared carrier, or the detected one
    pub carrier: Option<String>,
}

/// Attributes a rule is evaluated against
struct RuleContext<'a> {
    destination: &'a str,
    geo: &'a GeoInfo,
    carrier: Option<&'a str>,
    local_hour: u32,
}

/// Routing rules engine
pub struct RoutingRulesEngine {
    rules: Arc<dyn RoutingRuleRepository>,
    servers: Arc<dyn ServerRepository>,
    health: Arc<ServerHealthTracker>,
    /// Compiled patterns; `None` marks a pattern that failed to compile
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl RoutingRulesEngine {
    pub fn new(
        rules: Arc<dyn RoutingRuleRepository>,
        servers: Arc<dyn ServerRepository>,
        health: Arc<ServerHealthTracker>,
    ) -> Self {
        Self {
            rules,
            servers,
            health,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Route a destination over the given proxy and relay candidates
    pub async fn select_servers(
        &self,
        user_id: UserId,
        destination: &str,
        carrier: Option<&str>,
        proxies: Vec<EgressServer>,
        relays: Vec<EgressServer>,
        now: DateTime<Utc>,
    ) -> RoutingDecision {
        let geo = geo_info(destination);
        let carrier = carrier
            .map(normalize_carrier)
            .filter(|c| !c.is_empty())
            .or_else(|| geo.carrier.clone());

        let capacities = self.load_capacities(user_id).await;
        let mut proxies = self.candidates(user_id, proxies, &capacities);
        let mut relays = self.candidates(user_id, relays, &capacities);

        let context = RuleContext {
            destination,
            geo: &geo,
            carrier: carrier.as_deref(),
            local_hour: local_hour(&geo.timezone, now),
        };
        let matched: Vec<RoutingRule> = self
            .load_rules(user_id)
            .await
            .into_iter()
            .filter(|rule| self.matches(rule, &context))
            .collect();

        let mut rate_limit_multiplier = 1.0;
        for rule in &matched {
            debug!(rule = %rule.name, priority = rule.priority, "Routing rule matched");
            self.apply(rule, &mut proxies);
            self.apply(rule, &mut relays);

            let m = rule.actions.rate_limit_multiplier;
            if m.is_finite() && m > 0.0 {
                rate_limit_multiplier *= m;
            }
        }

        prefer_timezone(&mut proxies, &geo.timezone);
        prefer_timezone(&mut relays, &geo.timezone);

        for candidate in proxies.iter_mut().chain(relays.iter_mut()) {
            candidate.effective_weight = self.effective_weight(&candidate.server, &candidate.capacity);
        }

        let matched_rules: Vec<RuleId> = matched.iter().map(|r| r.id).collect();
        if !matched_rules.is_empty() {
            if let Err(e) = self.rules.increment_matches(&matched_rules).await {
                warn!(user_id = %user_id, "Failed to record rule matches: {}", e);
            }
        }

        RoutingDecision {
            proxies,
            relays,
            rate_limit_multiplier,
            matched_rules,
            geo,
            carrier,
        }
    }

    /// Credit the rules behind a successful send
    pub async fn record_success(&self, rule_ids: &[RuleId]) {
        if rule_ids.is_empty() {
            return;
        }
        if let Err(e) = self.rules.increment_successes(rule_ids).await {
            warn!("Failed to record rule successes: {}", e);
        }
    }

    /// `weight × 1/(1 + in_flight/max_concurrent)`, halved for a poor recent
    /// success rate and again for slow responses
    pub fn effective_weight(&self, server: &EgressServer, capacity: &ServerCapacityWeight) -> f64 {
        let in_flight = self.health.in_flight(server.id) as f64;
        let max_concurrent = capacity.max_concurrent.max(1) as f64;
        let mut weight = capacity.weight.max(0.0) / (1.0 + in_flight / max_concurrent);

        if self.health.success_rate(server) < capacity.min_success_rate {
            weight *= 0.5;
        }
        if self.health.average_response_ms(server) > capacity.max_response_time_ms {
            weight *= 0.5;
        }
        weight.max(MIN_EFFECTIVE_WEIGHT)
    }

    async fn load_capacities(
        &self,
        user_id: UserId,
    ) -> HashMap<(ServerKind, ServerId), ServerCapacityWeight> {
        match self.servers.capacity_weights(user_id).await {
            Ok(weights) => weights
                .into_iter()
                .map(|w| ((w.server_kind, w.server_id), w))
                .collect(),
            Err(e) => {
                warn!(user_id = %user_id, "Failed to load capacity weights: {}", e);
                HashMap::new()
            }
        }
    }

    async fn load_rules(&self, user_id: UserId) -> Vec<RoutingRule> {
        let mut rules = match self.rules.load_enabled(user_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(user_id = %user_id, "Failed to load routing rules: {}", e);
                return Vec::new();
            }
        };
        rules.retain(|r| r.enabled);
        rules.sort_by_key(|r| (Reverse(r.priority), r.created_at, r.id));
        rules
    }

    fn candidates(
        &self,
        user_id: UserId,
        servers: Vec<EgressServer>,
        capacities: &HashMap<(ServerKind, ServerId), ServerCapacityWeight>,
    ) -> Vec<Candidate> {
        servers
            .into_iter()
            .map(|server| {
                let capacity = capacities
                    .get(&(server.kind, server.id))
                    .cloned()
                    .unwrap_or_else(|| {
                        ServerCapacityWeight::default_for(user_id, server.kind, server.id)
                    });
                Candidate {
                    server,
                    capacity,
                    effective_weight: 1.0,
                }
            })
            .collect()
    }

    /// All present conditions must hold
    fn matches(&self, rule: &RoutingRule, context: &RuleContext<'_>) -> bool {
        let conditions = &rule.conditions;

        if let Some(pattern) = conditions.destination_pattern.as_deref() {
            let Some(regex) = self.pattern(pattern, rule) else {
                return false;
            };
            let subject = context.geo.number.as_deref().unwrap_or(context.destination);
            if !regex.is_match(subject) {
                return false;
            }
        }

        if !conditions.carriers.is_empty() {
            let Some(carrier) = context.carrier else {
                return false;
            };
            if !conditions
                .carriers
                .iter()
                .any(|c| normalize_carrier(c) == carrier)
            {
                return false;
            }
        }

        if !conditions.area_codes.is_empty() {
            let Some(area_code) = context.geo.area_code.as_deref() else {
                return false;
            };
            if !conditions.area_codes.iter().any(|a| a.trim() == area_code) {
                return false;
            }
        }

        if !conditions.states.is_empty() {
            let Some(state) = context.geo.state.as_deref() else {
                return false;
            };
            if !conditions
                .states
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(state))
            {
                return false;
            }
        }

        if !conditions.timezones.is_empty()
            && !conditions
                .timezones
                .iter()
                .any(|tz| tz.trim().eq_ignore_ascii_case(&context.geo.timezone))
        {
            return false;
        }

        let hour = context.local_hour;
        match (conditions.hour_start, conditions.hour_end) {
            (Some(start), Some(end)) => {
                within_window(hour, start.clamp(0, 24) as u32, end.clamp(0, 24) as u32)
            }
            (Some(start), None) => hour >= start.max(0) as u32,
            (None, Some(end)) => hour < end.max(0) as u32,
            (None, None) => true,
        }
    }

    /// Compiled pattern for a rule; invalid patterns are reported once
    fn pattern(&self, pattern: &str, rule: &RoutingRule) -> Option<Regex> {
        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        if patterns.len() >= PATTERN_CACHE_LIMIT && !patterns.contains_key(pattern) {
            debug!(cached = patterns.len(), "Pattern cache full, cleared");
            patterns.clear();
        }
        patterns
            .entry(pattern.to_string())
            .or_insert_with(|| {
                match RegexBuilder::new(pattern)
                    .size_limit(PATTERN_SIZE_LIMIT)
                    .build()
                {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!(rule = %rule.name, rule_id = %rule.id, "Skipping rule with invalid pattern: {}", e);
                        None
                    }
                }
            })
            .clone()
    }

    fn apply(&self, rule: &RoutingRule, candidates: &mut Vec<Candidate>) {
        let actions = &rule.actions;

        if !actions.preferred_tags.is_empty() {
            let tagged: Vec<Candidate> = candidates
                .iter()
                .filter(|c| {
                    c.capacity
                        .tags
                        .iter()
                        .any(|t| actions.preferred_tags.iter().any(|p| p.eq_ignore_ascii_case(t)))
                })
                .cloned()
                .collect();
            if tagged.is_empty() {
                info!(rule = %rule.name, "No candidate carries the preferred tags, keeping all");
            } else {
                *candidates = tagged;
            }
        }

        if actions.prefer_high_capacity {
            candidates.sort_by(|a, b| b.capacity.weight.total_cmp(&a.capacity.weight));
        }

        if actions.prefer_reliable {
            candidates.sort_by(|a, b| {
                self.health
                    .success_rate(&b.server)
                    .total_cmp(&self.health.success_rate(&a.server))
            });
        }
    }
}

/// Move candidates in the destination's timezone to the front, keeping order
fn prefer_timezone(candidates: &mut Vec<Candidate>, timezone: &str) {
    let (local, other): (Vec<Candidate>, Vec<Candidate>) =
        candidates.drain(..).partition(|c| {
            c.capacity
                .timezone
                .as_deref()
                .is_some_and(|tz| tz.eq_ignore_ascii_case(timezone))
        });
    candidates.extend(local);
    candidates.extend(other);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::ServerSelector;
    use crate::testing::{seed_capacity, seed_server, server, tracker};
    use relaycast_common::config::SelectionConfig;
    use relaycast_common::types::RotationStrategy;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use relaycast_storage::{
        CreateRoutingRule, MemoryStore, RuleActions, RuleConditions,
    };
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        health: Arc<ServerHealthTracker>,
        engine: RoutingRulesEngine,
        user_id: UserId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let health = tracker(&store);
        let engine = RoutingRulesEngine::new(store.clone(), store.clone(), health.clone());
        Fixture {
            store,
            health,
            engine,
            user_id: Uuid::new_v4(),
        }
    }

    async fn rule(
        fx: &Fixture,
        name: &str,
        priority: i32,
        conditions: RuleConditions,
        actions: RuleActions,
    ) -> RoutingRule {
        RoutingRuleRepository::create(
            fx.store.as_ref(),
            CreateRoutingRule {
                user_id: fx.user_id,
                name: name.into(),
                conditions,
                actions,
                priority,
                enabled: true,
            },
        )
        .await
        .unwrap()
    }

    fn names(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.server.name.as_str()).collect()
    }

    /// 15:00 UTC, 10:00 eastern
    fn noon_ish() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_no_rules_keeps_order() {
        let fx = fixture();
        let relays = vec![
            server(fx.user_id, ServerKind::Relay, "r1"),
            server(fx.user_id, ServerKind::Relay, "r2"),
        ];

        let decision = fx
            .engine
            .select_servers(fx.user_id, "2125550100", None, vec![], relays, noon_ish())
            .await;
        assert_eq!(names(&decision.relays), vec!["r1", "r2"]);
        assert_eq!(decision.rate_limit_multiplier, 1.0);
        assert!(decision.matched_rules.is_empty());
        assert_eq!(decision.carrier.as_deref(), Some("verizon"));
    }

    #[tokio::test]
    async fn test_tag_preference_never_empties() {
        let fx = fixture();
        let r1 = server(fx.user_id, ServerKind::Relay, "r1");
        let r2 = server(fx.user_id, ServerKind::Relay, "r2");
        seed_capacity(&fx.store, &r2, |w| w.tags = vec!["premium".into()]).await;

        rule(
            &fx,
            "premium",
            10,
            RuleConditions::default(),
            RuleActions {
                preferred_tags: vec!["Premium".into()],
                ..Default::default()
            },
        )
        .await;
        let decision = fx
            .engine
            .select_servers(
                fx.user_id,
                "2125550100",
                None,
                vec![],
                vec![r1.clone(), r2.clone()],
                noon_ish(),
            )
            .await;
        assert_eq!(names(&decision.relays), vec!["r2"]);

        // No candidate carries the tag: the list is left alone
        rule(
            &fx,
            "bulk",
            5,
            RuleConditions::default(),
            RuleActions {
                preferred_tags: vec!["bulk".into()],
                ..Default::default()
            },
        )
        .await;
        let decision = fx
            .engine
            .select_servers(fx.user_id, "2125550100", None, vec![], vec![r1], noon_ish())
            .await;
        assert_eq!(names(&decision.relays), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_conditions_and_priority() {
        let fx = fixture();
        let low = rule(
            &fx,
            "verizon-slow",
            1,
            RuleConditions {
                carriers: vec!["Verizon Wireless".into()],
                ..Default::default()
            },
            RuleActions {
                rate_limit_multiplier: 2.0,
                ..Default::default()
            },
        )
        .await;
        let high = rule(
            &fx,
            "new-york",
            9,
            RuleConditions {
                area_codes: vec!["212".into()],
                states: vec!["ny".into()],
                ..Default::default()
            },
            RuleActions {
                rate_limit_multiplier: 1.5,
                ..Default::default()
            },
        )
        .await;
        rule(
            &fx,
            "texas",
            20,
            RuleConditions {
                states: vec!["TX".into()],
                ..Default::default()
            },
            RuleActions::default(),
        )
        .await;

        let decision = fx
            .engine
            .select_servers(fx.user_id, "+1 212 555 0100", None, vec![], vec![], noon_ish())
            .await;
        assert_eq!(decision.matched_rules, vec![high.id, low.id]);
        assert_eq!(decision.rate_limit_multiplier, 3.0);

        let rules = fx.store.load_enabled(fx.user_id).await.unwrap();
        let counts: Vec<(String, i64)> = rules.iter().map(|r| (r.name.clone(), r.match_count)).collect();
        assert_eq!(
            counts,
            vec![
                ("texas".to_string(), 0),
                ("new-york".to_string(), 1),
                ("verizon-slow".to_string(), 1),
            ]
        );

        fx.engine.record_success(&decision.matched_rules).await;
        let rules = fx.store.load_enabled(fx.user_id).await.unwrap();
        assert_eq!(rules[1].success_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_pattern_skips_rule() {
        let fx = fixture();
        rule(
            &fx,
            "broken",
            5,
            RuleConditions {
                destination_pattern: Some("(212".into()),
                ..Default::default()
            },
            RuleActions {
                rate_limit_multiplier: 4.0,
                ..Default::default()
            },
        )
        .await;
        let pattern = rule(
            &fx,
            "manhattan",
            1,
            RuleConditions {
                destination_pattern: Some("^212".into()),
                ..Default::default()
            },
            RuleActions::default(),
        )
        .await;

        let decision = fx
            .engine
            .select_servers(fx.user_id, "(212) 555-0100", None, vec![], vec![], noon_ish())
            .await;
        assert_eq!(decision.matched_rules, vec![pattern.id]);
        assert_eq!(decision.rate_limit_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_pattern_cache_is_bounded() {
        let fx = fixture();
        let rule = rule(
            &fx,
            "numbers",
            1,
            RuleConditions {
                destination_pattern: Some("^212".into()),
                ..Default::default()
            },
            RuleActions::default(),
        )
        .await;

        for i in 0..PATTERN_CACHE_LIMIT + 10 {
            assert!(fx.engine.pattern(&format!("^{}", i), &rule).is_some());
        }
        let cached = fx.engine.patterns.lock().unwrap().len();
        assert!(cached <= PATTERN_CACHE_LIMIT);
        assert_eq!(cached, 10);
        assert!(fx.engine.pattern("(212", &rule).is_none());
    }

    #[tokio::test]
    async fn test_round_robin_spreads_across_timezone_preference() {
        let fx = fixture();
        let created = Utc::now();
        let mut east = server(fx.user_id, ServerKind::Relay, "east");
        let mut west = server(fx.user_id, ServerKind::Relay, "west");
        east.created_at = created;
        west.created_at = created + chrono::Duration::seconds(1);
        seed_capacity(&fx.store, &west, |w| w.timezone = Some("pacific".into())).await;

        let selector = ServerSelector::new(
            SelectionConfig::default(),
            fx.store.clone(),
            fx.store.clone(),
            fx.health.clone(),
        );
        let campaign = Uuid::new_v4();
        let mut picks = Vec::new();
        for destination in ["2125550100", "4155550100", "2125550101", "4155550101"] {
            let decision = fx
                .engine
                .select_servers(
                    fx.user_id,
                    destination,
                    None,
                    vec![],
                    vec![east.clone(), west.clone()],
                    noon_ish(),
                )
                .await;
            let chosen = selector
                .next(campaign, ServerKind::Relay, RotationStrategy::RoundRobin, &decision.relays)
                .unwrap();
            picks.push(chosen.server.name);
        }
        assert_eq!(picks, vec!["east", "west", "east", "west"]);
    }

    #[tokio::test]
    async fn test_hour_window_in_local_time() {
        let fx = fixture();
        let night = rule(
            &fx,
            "overnight",
            1,
            RuleConditions {
                hour_start: Some(22),
                hour_end: Some(6),
                ..Default::default()
            },
            RuleActions::default(),
        )
        .await;

        // 10:00 eastern
        let decision = fx
            .engine
            .select_servers(fx.user_id, "2125550100", None, vec![], vec![], noon_ish())
            .await;
        assert!(decision.matched_rules.is_empty());

        // 04:00 UTC is 23:00 eastern
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();
        let decision = fx
            .engine
            .select_servers(fx.user_id, "2125550100", None, vec![], vec![], late)
            .await;
        assert_eq!(decision.matched_rules, vec![night.id]);
    }

    #[tokio::test]
    async fn test_capacity_and_timezone_ordering() {
        let fx = fixture();
        let small = server(fx.user_id, ServerKind::Relay, "small");
        let big = server(fx.user_id, ServerKind::Relay, "big");
        let west = server(fx.user_id, ServerKind::Relay, "west");
        seed_capacity(&fx.store, &small, |w| w.weight = 0.5).await;
        seed_capacity(&fx.store, &big, |w| w.weight = 3.0).await;
        seed_capacity(&fx.store, &west, |w| {
            w.weight = 0.1;
            w.timezone = Some("pacific".into());
        })
        .await;

        rule(
            &fx,
            "capacity",
            1,
            RuleConditions::default(),
            RuleActions {
                prefer_high_capacity: true,
                ..Default::default()
            },
        )
        .await;

        let relays = vec![small, big, west];
        let decision = fx
            .engine
            .select_servers(fx.user_id, "2125550100", None, vec![], relays.clone(), noon_ish())
            .await;
        assert_eq!(names(&decision.relays), vec!["big", "small", "west"]);

        // A San Francisco number pulls the pacific relay to the front
        let decision = fx
            .engine
            .select_servers(fx.user_id, "4155550100", None, vec![], relays, noon_ish())
            .await;
        assert_eq!(names(&decision.relays), vec!["west", "big", "small"]);
    }

    #[tokio::test]
    async fn test_effective_weight_penalties() {
        let fx = fixture();
        let relay = server(fx.user_id, ServerKind::Relay, "r1");
        seed_server(&fx.store, &relay).await;
        let capacity = ServerCapacityWeight {
            weight: 2.0,
            max_concurrent: 2,
            ..ServerCapacityWeight::default_for(fx.user_id, ServerKind::Relay, relay.id)
        };
        assert_eq!(fx.engine.effective_weight(&relay, &capacity), 2.0);

        let _guard = fx.health.begin_request(ServerKind::Relay, relay.id);
        let _guard2 = fx.health.begin_request(ServerKind::Relay, relay.id);
        // Two in flight out of two: weight / 2
        assert_eq!(fx.engine.effective_weight(&relay, &capacity), 1.0);

        // Slow successes halve it again
        fx.health
            .record_success(ServerKind::Relay, relay.id, Uuid::new_v4(), Duration::from_secs(6))
            .await;
        assert_eq!(fx.engine.effective_weight(&relay, &capacity), 0.5);

        // A failing majority halves it once more
        for _ in 0..2 {
            fx.health
                .record_failure(
                    ServerKind::Relay,
                    relay.id,
                    Uuid::new_v4(),
                    "timeout",
                    relaycast_common::types::ErrorType::Temporary,
                )
                .await;
        }
        assert_eq!(fx.engine.effective_weight(&relay, &capacity), 0.25);

        let tiny = ServerCapacityWeight {
            weight: 0.0,
            ..capacity
        };
        assert_eq!(fx.engine.effective_weight(&relay, &tiny), MIN_EFFECTIVE_WEIGHT);
    }
}
