//! Routing rule repository

use crate::db::DatabasePool;
use crate::models::{CreateRoutingRule, RoutingRule};
use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::types::{RuleId, UserId};
use relaycast_common::{Error, Result};
use uuid::Uuid;

/// Routing rule repository trait
#[async_trait]
pub trait RoutingRuleRepository: Send + Sync {
    async fn create(&self, input: CreateRoutingRule) -> Result<RoutingRule>;
    /// Enabled rules ordered by priority descending, then `created_at`, then id
    async fn load_enabled(&self, user_id: UserId) -> Result<Vec<RoutingRule>>;
    async fn increment_matches(&self, ids: &[RuleId]) -> Result<()>;
    async fn increment_successes(&self, ids: &[RuleId]) -> Result<()>;
}

/// Database routing rule repository
pub struct DbRoutingRuleRepository {
    pool: DatabasePool,
}

impl DbRoutingRuleRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoutingRuleRepository for DbRoutingRuleRepository {
    async fn create(&self, input: CreateRoutingRule) -> Result<RoutingRule> {
        let conditions = &input.conditions;
        let actions = &input.actions;

        sqlx::query_as::<_, RoutingRule>(
            r#"
            INSERT INTO routing_rules (
                id, user_id, name, destination_pattern, carriers, area_codes, states,
                timezones, hour_start, hour_end, preferred_tags, rate_limit_multiplier,
                prefer_high_capacity, prefer_reliable, priority, enabled,
                match_count, success_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0, 0, $17)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&conditions.destination_pattern)
        .bind(&conditions.carriers)
        .bind(&conditions.area_codes)
        .bind(&conditions.states)
        .bind(&conditions.timezones)
        .bind(conditions.hour_start)
        .bind(conditions.hour_end)
        .bind(&actions.preferred_tags)
        .bind(actions.rate_limit_multiplier)
        .bind(actions.prefer_high_capacity)
        .bind(actions.prefer_reliable)
        .bind(input.priority)
        .bind(input.enabled)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn load_enabled(&self, user_id: UserId) -> Result<Vec<RoutingRule>> {
        sqlx::query_as::<_, RoutingRule>(
            r#"
            SELECT * FROM routing_rules
            WHERE user_id = $1 AND enabled = true
            ORDER BY priority DESC, created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn increment_matches(&self, ids: &[RuleId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE routing_rules SET match_count = match_count + 1 WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_successes(&self, ids: &[RuleId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE routing_rules SET success_count = success_count + 1 WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
