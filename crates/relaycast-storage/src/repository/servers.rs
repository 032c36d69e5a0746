//! Egress server repository (proxies, relays, capacity weights, usage logs)

use crate::db::DatabasePool;
use crate::models::{CreateEgressServer, EgressServer, ServerCapacityWeight, ServerUsageLog};
use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::types::{CampaignId, ServerId, ServerKind, UserId};
use relaycast_common::{Error, Result};
use uuid::Uuid;

/// Outcome of one request against a server, for usage accounting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageUpdate {
    pub campaign_id: CampaignId,
    pub kind: ServerKind,
    pub server_id: ServerId,
    pub success: bool,
}

/// Server repository trait
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn create(&self, input: CreateEgressServer) -> Result<EgressServer>;
    async fn get(&self, id: ServerId) -> Result<Option<EgressServer>>;
    /// Administrator-enabled servers of one kind, in creation order.
    /// Health is not filtered here.
    async fn load_active(&self, user_id: UserId, kind: ServerKind) -> Result<Vec<EgressServer>>;
    async fn set_active(&self, id: ServerId, active: bool) -> Result<()>;
    async fn capacity_weights(&self, user_id: UserId) -> Result<Vec<ServerCapacityWeight>>;
    async fn upsert_capacity_weight(&self, weight: ServerCapacityWeight) -> Result<()>;
    /// Atomically bump the lifetime counters and fold the response time into
    /// the running average
    async fn increment_counters(
        &self,
        id: ServerId,
        success: bool,
        response_time_ms: f64,
    ) -> Result<()>;
    async fn set_health(&self, id: ServerId, healthy: bool) -> Result<()>;
    async fn record_usage(&self, update: UsageUpdate) -> Result<()>;
    async fn usage_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<ServerUsageLog>>;
}

/// Database server repository
pub struct DbServerRepository {
    pool: DatabasePool,
}

impl DbServerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServerRepository for DbServerRepository {
    async fn create(&self, input: CreateEgressServer) -> Result<EgressServer> {
        sqlx::query_as::<_, EgressServer>(
            r#"
            INSERT INTO egress_servers (
                id, user_id, kind, name, host, port, username, password, use_tls,
                active, healthy, success_count, failure_count, total_requests,
                average_response_time_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, true, true, 0, 0, 0, 0, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.kind.to_string())
        .bind(&input.name)
        .bind(&input.host)
        .bind(input.port)
        .bind(&input.username)
        .bind(&input.password)
        .bind(input.use_tls)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: ServerId) -> Result<Option<EgressServer>> {
        sqlx::query_as::<_, EgressServer>("SELECT * FROM egress_servers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn load_active(&self, user_id: UserId, kind: ServerKind) -> Result<Vec<EgressServer>> {
        sqlx::query_as::<_, EgressServer>(
            r#"
            SELECT * FROM egress_servers
            WHERE user_id = $1 AND kind = $2 AND active = true
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .bind(kind.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_active(&self, id: ServerId, active: bool) -> Result<()> {
        sqlx::query("UPDATE egress_servers SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn capacity_weights(&self, user_id: UserId) -> Result<Vec<ServerCapacityWeight>> {
        sqlx::query_as::<_, ServerCapacityWeight>(
            "SELECT * FROM server_capacity_weights WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn upsert_capacity_weight(&self, weight: ServerCapacityWeight) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO server_capacity_weights (
                user_id, server_kind, server_id, weight, max_concurrent,
                min_success_rate, max_response_time_ms, timezone, tags
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, server_kind, server_id) DO UPDATE SET
                weight = EXCLUDED.weight,
                max_concurrent = EXCLUDED.max_concurrent,
                min_success_rate = EXCLUDED.min_success_rate,
                max_response_time_ms = EXCLUDED.max_response_time_ms,
                timezone = EXCLUDED.timezone,
                tags = EXCLUDED.tags
            "#,
        )
        .bind(weight.user_id)
        .bind(weight.server_kind.to_string())
        .bind(weight.server_id)
        .bind(weight.weight)
        .bind(weight.max_concurrent)
        .bind(weight.min_success_rate)
        .bind(weight.max_response_time_ms)
        .bind(&weight.timezone)
        .bind(&weight.tags)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_counters(
        &self,
        id: ServerId,
        success: bool,
        response_time_ms: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE egress_servers SET
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                total_requests = total_requests + 1,
                average_response_time_ms =
                    (average_response_time_ms * total_requests + $3) / (total_requests + 1),
                last_used_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(success)
        .bind(response_time_ms)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_health(&self, id: ServerId, healthy: bool) -> Result<()> {
        sqlx::query("UPDATE egress_servers SET healthy = $2 WHERE id = $1")
            .bind(id)
            .bind(healthy)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_usage(&self, update: UsageUpdate) -> Result<()> {
        let (successes, failures) = if update.success { (1, 0) } else { (0, 1) };

        sqlx::query(
            r#"
            INSERT INTO server_usage_logs (
                campaign_id, server_kind, server_id, messages_sent, successes, failures, last_used_at
            )
            VALUES ($1, $2, $3, 1, $4, $5, NOW())
            ON CONFLICT (campaign_id, server_kind, server_id) DO UPDATE SET
                messages_sent = server_usage_logs.messages_sent + 1,
                successes = server_usage_logs.successes + EXCLUDED.successes,
                failures = server_usage_logs.failures + EXCLUDED.failures,
                last_used_at = EXCLUDED.last_used_at
            "#,
        )
        .bind(update.campaign_id)
        .bind(update.kind.to_string())
        .bind(update.server_id)
        .bind(successes as i64)
        .bind(failures as i64)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn usage_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<ServerUsageLog>> {
        sqlx::query_as::<_, ServerUsageLog>(
            r#"
            SELECT * FROM server_usage_logs
            WHERE campaign_id = $1
            ORDER BY server_kind ASC, messages_sent DESC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
