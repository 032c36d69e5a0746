//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignStatus, CreateCampaign};
use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::types::CampaignId;
use relaycast_common::{Error, Result};
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    /// Set the status; `started_at`/`completed_at` are stamped on the
    /// corresponding transitions
    async fn update_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<Campaign>>;
    /// Persist progress; never moves `processed_messages` backwards
    async fn update_progress(&self, id: CampaignId, processed: i64) -> Result<()>;
    async fn set_total_messages(&self, id: CampaignId, total: i64) -> Result<()>;
    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (id, user_id, name, status, total_messages, processed_messages, created_at, updated_at)
            VALUES ($1, $2, $3, 'draft', 0, 0, $4, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.user_id)
        .bind(&input.name)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        failure_reason: Option<String>,
    ) -> Result<Option<Campaign>> {
        let now = Utc::now();
        let started_at = (status == CampaignStatus::InProgress).then_some(now);
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $2,
                failure_reason = COALESCE($3, failure_reason),
                started_at = COALESCE(started_at, $4),
                completed_at = COALESCE($5, completed_at),
                updated_at = $6
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(failure_reason)
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_progress(&self, id: CampaignId, processed: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET processed_messages = GREATEST(processed_messages, $2), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_total_messages(&self, id: CampaignId, total: i64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET total_messages = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(total)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
