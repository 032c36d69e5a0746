//! In-memory implementation of every repository trait
//!
//! Used by the `memory` database backend and by tests. Semantics follow the
//! PostgreSQL repositories: terminal messages reject updates, retry attempt
//! numbers are gapless with at most one open attempt, and progress is
//! monotonic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycast_common::types::{
    normalize_carrier, CampaignId, MessageId, RetryAttemptId, RuleId, ServerId, ServerKind,
    UserId,
};
use relaycast_common::{Error, Result};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::*;
use crate::repository::{
    CampaignRepository, CarrierPerformanceRepository, DeliverySettingsRepository,
    MessageRepository, RetryAttemptRepository, RoutingRuleRepository, ServerRepository,
    UsageUpdate,
};

type PerformanceKey = (UserId, String, Option<ServerId>, ServerId);
type UsageKey = (CampaignId, ServerKind, ServerId);

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    messages: RwLock<HashMap<MessageId, Message>>,
    servers: RwLock<HashMap<ServerId, EgressServer>>,
    weights: RwLock<HashMap<(UserId, ServerKind, ServerId), ServerCapacityWeight>>,
    settings: RwLock<HashMap<CampaignId, CampaignDeliverySettings>>,
    rules: RwLock<HashMap<RuleId, RoutingRule>>,
    retries: RwLock<HashMap<RetryAttemptId, RetryAttempt>>,
    performance: RwLock<HashMap<PerformanceKey, CarrierPerformanceLog>>,
    usage: RwLock<HashMap<UsageKey, ServerUsageLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a server record, e.g. to seed lifetime counters
    pub async fn put_server(&self, server: EgressServer) {
        self.servers.write().await.insert(server.id, server);
    }

    /// Seed a carrier performance entry
    pub async fn put_performance(&self, mut log: CarrierPerformanceLog) {
        log.carrier = normalize_carrier(&log.carrier);
        let key = (
            log.user_id,
            log.carrier.clone(),
            log.proxy_server_id,
            log.relay_server_id,
        );
        self.performance.write().await.insert(key, log);
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            name: input.name,
            status: CampaignStatus::Draft,
            total_messages: 0,
            processed_messages: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.campaigns
            .write()
            .await
            .insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaigns.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<Campaign>> {
        let mut campaigns = self.campaigns.write().await;
        let Some(campaign) = campaigns.get_mut(&id) else {
            return Ok(None);
        };
        let now = Utc::now();
        campaign.status = status;
        if failure_reason.is_some() {
            campaign.failure_reason = failure_reason;
        }
        if status == CampaignStatus::InProgress && campaign.started_at.is_none() {
            campaign.started_at = Some(now);
        }
        if status.is_terminal() {
            campaign.completed_at = Some(now);
        }
        campaign.updated_at = now;
        Ok(Some(campaign.clone()))
    }

    async fn update_progress(&self, id: CampaignId, processed: i64) -> Result<()> {
        if let Some(campaign) = self.campaigns.write().await.get_mut(&id) {
            campaign.processed_messages = campaign.processed_messages.max(processed);
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_total_messages(&self, id: CampaignId, total: i64) -> Result<()> {
        if let Some(campaign) = self.campaigns.write().await.get_mut(&id) {
            campaign.total_messages = total;
        }
        Ok(())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let mut found: Vec<Campaign> = self
            .campaigns
            .read()
            .await
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create_batch(&self, inputs: Vec<CreateMessage>) -> Result<Vec<Message>> {
        let mut messages = self.messages.write().await;
        let now = Utc::now();
        let created: Vec<Message> = inputs
            .into_iter()
            .map(|input| Message {
                id: Uuid::now_v7(),
                campaign_id: input.campaign_id,
                destination: input.destination,
                payload: input.payload,
                carrier: input.carrier,
                status: MessageStatus::Pending,
                proxy_server_id: None,
                relay_server_id: None,
                attempts: 0,
                retry_count: 0,
                not_before: None,
                queued_at: now,
                sent_at: None,
                delivered_at: None,
                last_error: None,
                error_type: None,
            })
            .collect();
        for message in &created {
            messages.insert(message.id, message.clone());
        }
        Ok(created)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn load_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let mut pending: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.campaign_id == campaign_id && m.is_due(now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn claim(&self, id: MessageId) -> Result<bool> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Sending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .get_mut(&message.id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", message.id)))?;
        if stored.status.is_terminal() {
            return Err(Error::Validation(format!(
                "Message {} is {} and can no longer change",
                message.id, stored.status
            )));
        }
        *stored = message.clone();
        Ok(())
    }

    async fn status_counts(&self, campaign_id: CampaignId) -> Result<MessageStatusCounts> {
        let mut counts = MessageStatusCounts::default();
        for message in self.messages.read().await.values() {
            if message.campaign_id == campaign_id {
                counts.add(message.status, 1);
            }
        }
        Ok(counts)
    }

    async fn cancel_by_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut cancelled = 0;
        for message in self.messages.write().await.values_mut() {
            if message.campaign_id == campaign_id
                && matches!(
                    message.status,
                    MessageStatus::Pending | MessageStatus::Retrying
                )
            {
                message.status = MessageStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut released = 0;
        for message in self.messages.write().await.values_mut() {
            if message.campaign_id == campaign_id && message.status == MessageStatus::Sending {
                message.status = MessageStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl ServerRepository for MemoryStore {
    async fn create(&self, input: CreateEgressServer) -> Result<EgressServer> {
        let server = EgressServer {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            kind: input.kind,
            name: input.name,
            host: input.host,
            port: input.port,
            username: input.username,
            password: input.password,
            use_tls: input.use_tls,
            active: true,
            healthy: true,
            success_count: 0,
            failure_count: 0,
            total_requests: 0,
            average_response_time_ms: 0.0,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.servers.write().await.insert(server.id, server.clone());
        Ok(server)
    }

    async fn get(&self, id: ServerId) -> Result<Option<EgressServer>> {
        Ok(self.servers.read().await.get(&id).cloned())
    }

    async fn load_active(&self, user_id: UserId, kind: ServerKind) -> Result<Vec<EgressServer>> {
        let mut servers: Vec<EgressServer> = self
            .servers
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.kind == kind && s.active)
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(servers)
    }

    async fn set_active(&self, id: ServerId, active: bool) -> Result<()> {
        if let Some(server) = self.servers.write().await.get_mut(&id) {
            server.active = active;
        }
        Ok(())
    }

    async fn capacity_weights(&self, user_id: UserId) -> Result<Vec<ServerCapacityWeight>> {
        Ok(self
            .weights
            .read()
            .await
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_capacity_weight(&self, weight: ServerCapacityWeight) -> Result<()> {
        self.weights.write().await.insert(
            (weight.user_id, weight.server_kind, weight.server_id),
            weight,
        );
        Ok(())
    }

    async fn increment_counters(
        &self,
        id: ServerId,
        success: bool,
        response_time_ms: f64,
    ) -> Result<()> {
        if let Some(server) = self.servers.write().await.get_mut(&id) {
            let total = server.total_requests as f64;
            server.average_response_time_ms =
                (server.average_response_time_ms * total + response_time_ms) / (total + 1.0);
            server.total_requests += 1;
            if success {
                server.success_count += 1;
            } else {
                server.failure_count += 1;
            }
            server.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_health(&self, id: ServerId, healthy: bool) -> Result<()> {
        if let Some(server) = self.servers.write().await.get_mut(&id) {
            server.healthy = healthy;
        }
        Ok(())
    }

    async fn record_usage(&self, update: UsageUpdate) -> Result<()> {
        let now = Utc::now();
        let mut usage = self.usage.write().await;
        let entry = usage
            .entry((update.campaign_id, update.kind, update.server_id))
            .or_insert_with(|| ServerUsageLog {
                campaign_id: update.campaign_id,
                server_kind: update.kind,
                server_id: update.server_id,
                messages_sent: 0,
                successes: 0,
                failures: 0,
                last_used_at: now,
            });
        entry.messages_sent += 1;
        if update.success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.last_used_at = now;
        Ok(())
    }

    async fn usage_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<ServerUsageLog>> {
        let mut logs: Vec<ServerUsageLog> = self
            .usage
            .read()
            .await
            .values()
            .filter(|u| u.campaign_id == campaign_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| {
            a.server_kind
                .cmp(&b.server_kind)
                .then(b.messages_sent.cmp(&a.messages_sent))
                .then(a.server_id.cmp(&b.server_id))
        });
        Ok(logs)
    }
}

#[async_trait]
impl DeliverySettingsRepository for MemoryStore {
    async fn load_or_create(&self, campaign_id: CampaignId) -> Result<CampaignDeliverySettings> {
        Ok(self
            .settings
            .write()
            .await
            .entry(campaign_id)
            .or_insert_with(|| CampaignDeliverySettings::defaults(campaign_id))
            .clone())
    }

    async fn update(&self, settings: &CampaignDeliverySettings) -> Result<()> {
        let mut stored = settings.clone();
        stored.updated_at = Utc::now();
        self.settings
            .write()
            .await
            .insert(settings.campaign_id, stored);
        Ok(())
    }
}

#[async_trait]
impl RoutingRuleRepository for MemoryStore {
    async fn create(&self, input: CreateRoutingRule) -> Result<RoutingRule> {
        let rule = RoutingRule {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            name: input.name,
            conditions: input.conditions,
            actions: input.actions,
            priority: input.priority,
            enabled: input.enabled,
            match_count: 0,
            success_count: 0,
            created_at: Utc::now(),
        };
        self.rules.write().await.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn load_enabled(&self, user_id: UserId) -> Result<Vec<RoutingRule>> {
        let mut rules: Vec<RoutingRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id && r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(rules)
    }

    async fn increment_matches(&self, ids: &[RuleId]) -> Result<()> {
        let mut rules = self.rules.write().await;
        for id in ids {
            if let Some(rule) = rules.get_mut(id) {
                rule.match_count += 1;
            }
        }
        Ok(())
    }

    async fn increment_successes(&self, ids: &[RuleId]) -> Result<()> {
        let mut rules = self.rules.write().await;
        for id in ids {
            if let Some(rule) = rules.get_mut(id) {
                rule.success_count += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RetryAttemptRepository for MemoryStore {
    async fn create(&self, input: NewRetryAttempt) -> Result<RetryAttempt> {
        let mut retries = self.retries.write().await;
        let existing = retries
            .values()
            .filter(|a| a.message_id == input.message_id);

        let mut last = 0;
        for attempt in existing {
            if !attempt.completed {
                return Err(Error::Validation(format!(
                    "Message {} already has an open retry attempt",
                    input.message_id
                )));
            }
            last = last.max(attempt.attempt_number);
        }
        if input.attempt_number != last + 1 {
            return Err(Error::Validation(format!(
                "Retry attempt {} out of sequence for message {} (expected {})",
                input.attempt_number,
                input.message_id,
                last + 1
            )));
        }

        let attempt = RetryAttempt {
            id: Uuid::now_v7(),
            message_id: input.message_id,
            campaign_id: input.campaign_id,
            attempt_number: input.attempt_number,
            error_type: input.error_type,
            error_text: input.error_text,
            delay_secs: input.delay_secs,
            scheduled_at: input.scheduled_at,
            completed: false,
            success: false,
            proxy_server_id: input.proxy_server_id,
            relay_server_id: input.relay_server_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        retries.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<RetryAttempt>> {
        let mut attempts: Vec<RetryAttempt> = self
            .retries
            .read()
            .await
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn open_for_message(&self, message_id: MessageId) -> Result<Option<RetryAttempt>> {
        Ok(self
            .retries
            .read()
            .await
            .values()
            .find(|a| a.message_id == message_id && !a.completed)
            .cloned())
    }

    async fn close(&self, id: RetryAttemptId, success: bool) -> Result<bool> {
        let mut retries = self.retries.write().await;
        match retries.get_mut(&id) {
            Some(attempt) if !attempt.completed => {
                attempt.completed = true;
                attempt.success = success;
                attempt.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_open_for_message(&self, message_id: MessageId, success: bool) -> Result<u64> {
        let now = Utc::now();
        let mut closed = 0;
        for attempt in self.retries.write().await.values_mut() {
            if attempt.message_id == message_id && !attempt.completed {
                attempt.completed = true;
                attempt.success = success;
                attempt.completed_at = Some(now);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<RetryAttempt>> {
        let mut attempts: Vec<RetryAttempt> = self
            .retries
            .read()
            .await
            .values()
            .filter(|a| a.campaign_id == campaign_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| {
            a.message_id
                .cmp(&b.message_id)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        Ok(attempts)
    }
}

#[async_trait]
impl CarrierPerformanceRepository for MemoryStore {
    async fn record(&self, outcome: CarrierOutcome) -> Result<()> {
        let carrier = normalize_carrier(&outcome.carrier);
        let key = (
            outcome.user_id,
            carrier.clone(),
            outcome.proxy_server_id,
            outcome.relay_server_id,
        );
        let mut performance = self.performance.write().await;
        let entry = performance
            .entry(key)
            .or_insert_with(|| CarrierPerformanceLog {
                user_id: outcome.user_id,
                carrier,
                proxy_server_id: outcome.proxy_server_id,
                relay_server_id: outcome.relay_server_id,
                total_messages: 0,
                successful_messages: 0,
                success_rate: 0.0,
                average_delivery_ms: 0.0,
                updated_at: Utc::now(),
            });

        let previous = entry.total_messages as f64;
        entry.average_delivery_ms =
            (entry.average_delivery_ms * previous + outcome.delivery_ms) / (previous + 1.0);
        entry.total_messages += 1;
        if outcome.success {
            entry.successful_messages += 1;
        }
        entry.success_rate = entry.successful_messages as f64 / entry.total_messages as f64;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn for_carrier(
        &self,
        user_id: UserId,
        carrier: &str,
    ) -> Result<Vec<CarrierPerformanceLog>> {
        let carrier = normalize_carrier(carrier);
        let mut logs: Vec<CarrierPerformanceLog> = self
            .performance
            .read()
            .await
            .values()
            .filter(|l| l.user_id == user_id && l.carrier == carrier)
            .cloned()
            .collect();
        logs.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.average_delivery_ms.total_cmp(&b.average_delivery_ms))
        });
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relaycast_common::types::ErrorType;

    async fn seed_campaign(store: &MemoryStore) -> Campaign {
        CampaignRepository::create(
            store,
            CreateCampaign {
                user_id: Uuid::new_v4(),
                name: "spring".into(),
            },
        )
        .await
        .unwrap()
    }

    async fn seed_message(store: &MemoryStore, campaign_id: CampaignId) -> Message {
        store
            .create_batch(vec![CreateMessage {
                campaign_id,
                destination: "5551234567".into(),
                payload: "hello".into(),
                carrier: None,
            }])
            .await
            .unwrap()
            .remove(0)
    }

    fn attempt(message: &Message, number: i32) -> NewRetryAttempt {
        NewRetryAttempt {
            message_id: message.id,
            campaign_id: message.campaign_id,
            attempt_number: number,
            error_type: ErrorType::Temporary,
            error_text: "timeout".into(),
            delay_secs: 60.0,
            scheduled_at: Utc::now(),
            proxy_server_id: None,
            relay_server_id: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_message_rejects_update() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;
        let mut message = seed_message(&store, campaign.id).await;

        assert!(store.claim(message.id).await.unwrap());
        assert!(!store.claim(message.id).await.unwrap());

        message.status = MessageStatus::Sent;
        MessageRepository::update(&store, &message).await.unwrap();

        message.status = MessageStatus::Pending;
        let err = MessageRepository::update(&store, &message).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_load_pending_respects_not_before() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;
        let mut message = seed_message(&store, campaign.id).await;
        let now = Utc::now();

        message.not_before = Some(now + chrono::Duration::hours(1));
        MessageRepository::update(&store, &message).await.unwrap();
        assert!(store.load_pending(campaign.id, 10, now).await.unwrap().is_empty());

        let later = now + chrono::Duration::hours(2);
        assert_eq!(store.load_pending(campaign.id, 10, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_attempts_gapless_single_open() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;
        let message = seed_message(&store, campaign.id).await;

        let first = RetryAttemptRepository::create(&store, attempt(&message, 1))
            .await
            .unwrap();
        assert!(RetryAttemptRepository::create(&store, attempt(&message, 2))
            .await
            .is_err());

        assert!(store.close(first.id, false).await.unwrap());
        assert!(!store.close(first.id, false).await.unwrap());

        assert!(RetryAttemptRepository::create(&store, attempt(&message, 3))
            .await
            .is_err());
        RetryAttemptRepository::create(&store, attempt(&message, 2))
            .await
            .unwrap();

        let numbers: Vec<i32> = store
            .list_by_message(message.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(store.close_open_for_message(message.id, false).await.unwrap(), 1);
        assert_eq!(store.close_open_for_message(message.id, false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;

        store.update_progress(campaign.id, 5).await.unwrap();
        store.update_progress(campaign.id, 3).await.unwrap();
        let stored = CampaignRepository::get(&store, campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.processed_messages, 5);
    }

    #[tokio::test]
    async fn test_carrier_performance_accumulates() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let relay = Uuid::new_v4();

        for success in [true, true, false, true] {
            store
                .record(CarrierOutcome {
                    user_id,
                    carrier: "AT&T".into(),
                    proxy_server_id: None,
                    relay_server_id: relay,
                    success,
                    delivery_ms: 100.0,
                })
                .await
                .unwrap();
        }

        let logs = store.for_carrier(user_id, "att").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].total_messages, 4);
        assert_eq!(logs[0].successful_messages, 3);
        assert!((logs[0].success_rate - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rules_sorted_by_priority_then_age() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        for (name, priority) in [("low", 1), ("high-a", 5), ("high-b", 5)] {
            RoutingRuleRepository::create(
                &store,
                CreateRoutingRule {
                    user_id,
                    name: name.into(),
                    conditions: RuleConditions::default(),
                    actions: RuleActions::default(),
                    priority,
                    enabled: true,
                },
            )
            .await
            .unwrap();
        }

        let order: Vec<String> = store
            .load_enabled(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(order, vec!["high-a", "high-b", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_by_campaign_skips_terminal() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;
        let mut sent = seed_message(&store, campaign.id).await;
        seed_message(&store, campaign.id).await;

        sent.status = MessageStatus::Sent;
        MessageRepository::update(&store, &sent).await.unwrap();

        assert_eq!(store.cancel_by_campaign(campaign.id).await.unwrap(), 1);
        let counts = store.status_counts(campaign.id).await.unwrap();
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.cancelled, 1);
    }

    #[tokio::test]
    async fn test_release_claimed_only_touches_sending() {
        let store = MemoryStore::new();
        let campaign = seed_campaign(&store).await;
        let other = seed_campaign(&store).await;
        let claimed = seed_message(&store, campaign.id).await;
        let mut sent = seed_message(&store, campaign.id).await;
        let foreign = seed_message(&store, other.id).await;

        assert!(store.claim(claimed.id).await.unwrap());
        assert!(store.claim(foreign.id).await.unwrap());
        sent.status = MessageStatus::Sent;
        MessageRepository::update(&store, &sent).await.unwrap();

        assert_eq!(store.release_claimed(campaign.id).await.unwrap(), 1);
        let counts = store.status_counts(campaign.id).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.sending, 0);
        assert_eq!(store.status_counts(other.id).await.unwrap().sending, 1);
        assert_eq!(store.release_claimed(campaign.id).await.unwrap(), 0);
    }
}
