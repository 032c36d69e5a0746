//! Message repository

use crate::db::DatabasePool;
use crate::models::{CreateMessage, Message, MessageStatus, MessageStatusCounts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycast_common::types::{CampaignId, MessageId};
use relaycast_common::{Error, Result};
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create_batch(&self, inputs: Vec<CreateMessage>) -> Result<Vec<Message>>;
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;
    /// Pending messages whose `not_before` is due at `now`, oldest first
    async fn load_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>>;
    /// Move a message from `pending` to `sending`; false if another worker
    /// already took it or it is no longer pending
    async fn claim(&self, id: MessageId) -> Result<bool>;
    /// Persist every mutable field; rejected when the stored message is terminal
    async fn update(&self, message: &Message) -> Result<()>;
    async fn status_counts(&self, campaign_id: CampaignId) -> Result<MessageStatusCounts>;
    /// Cancel every pending or retrying message of the campaign
    async fn cancel_by_campaign(&self, campaign_id: CampaignId) -> Result<u64>;
    /// Hand every `sending` message of the campaign back to `pending`
    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64>;
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create_batch(&self, inputs: Vec<CreateMessage>) -> Result<Vec<Message>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let message = sqlx::query_as::<_, Message>(
                r#"
                INSERT INTO messages (id, campaign_id, destination, payload, carrier, status, attempts, retry_count, queued_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, 0, NOW())
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(input.campaign_id)
            .bind(&input.destination)
            .bind(&input.payload)
            .bind(&input.carrier)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
            created.push(message);
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(created)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn load_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE campaign_id = $1
              AND status = 'pending'
              AND (not_before IS NULL OR not_before <= $2)
            ORDER BY queued_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'sending' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                carrier = $2,
                status = $3,
                proxy_server_id = $4,
                relay_server_id = $5,
                attempts = $6,
                retry_count = $7,
                not_before = $8,
                sent_at = $9,
                delivered_at = $10,
                last_error = $11,
                error_type = $12
            WHERE id = $1
              AND status NOT IN ('sent', 'delivered', 'failed', 'cancelled')
            "#,
        )
        .bind(message.id)
        .bind(&message.carrier)
        .bind(message.status.to_string())
        .bind(message.proxy_server_id)
        .bind(message.relay_server_id)
        .bind(message.attempts)
        .bind(message.retry_count)
        .bind(message.not_before)
        .bind(message.sent_at)
        .bind(message.delivered_at)
        .bind(&message.last_error)
        .bind(&message.error_type)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return match self.get(message.id).await? {
                Some(stored) => Err(Error::Validation(format!(
                    "Message {} is {} and can no longer change",
                    message.id, stored.status
                ))),
                None => Err(Error::NotFound(format!("Message {}", message.id))),
            };
        }
        Ok(())
    }

    async fn status_counts(&self, campaign_id: CampaignId) -> Result<MessageStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM messages WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut counts = MessageStatusCounts::default();
        for (status, count) in rows {
            let status: MessageStatus = status.parse().map_err(Error::Database)?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    async fn cancel_by_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = 'cancelled'
            WHERE campaign_id = $1 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn release_claimed(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending' WHERE campaign_id = $1 AND status = 'sending'",
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
