//! Retry attempt repository

use crate::db::DatabasePool;
use crate::models::{NewRetryAttempt, RetryAttempt};
use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::types::{CampaignId, MessageId, RetryAttemptId};
use relaycast_common::{Error, Result};
use uuid::Uuid;

/// Retry attempt repository trait
///
/// A message has at most one open (not completed) attempt, and attempt
/// numbers per message are gapless from 1. Both are enforced by `create`.
#[async_trait]
pub trait RetryAttemptRepository: Send + Sync {
    async fn create(&self, input: NewRetryAttempt) -> Result<RetryAttempt>;
    /// Attempts of a message in attempt-number order
    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<RetryAttempt>>;
    async fn open_for_message(&self, message_id: MessageId) -> Result<Option<RetryAttempt>>;
    /// Close one attempt; false when it was already closed
    async fn close(&self, id: RetryAttemptId, success: bool) -> Result<bool>;
    /// Close every open attempt of a message, returning how many were closed
    async fn close_open_for_message(&self, message_id: MessageId, success: bool) -> Result<u64>;
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<RetryAttempt>>;
}

/// Database retry attempt repository
pub struct DbRetryAttemptRepository {
    pool: DatabasePool,
}

impl DbRetryAttemptRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryAttemptRepository for DbRetryAttemptRepository {
    async fn create(&self, input: NewRetryAttempt) -> Result<RetryAttempt> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // The partial unique indexes on retry_attempts back these checks
        // when two writers race.
        let (last, open): (Option<i32>, i64) = sqlx::query_as(
            r#"
            SELECT MAX(attempt_number), COUNT(*) FILTER (WHERE NOT completed)
            FROM retry_attempts
            WHERE message_id = $1
            "#,
        )
        .bind(input.message_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if open > 0 {
            return Err(Error::Validation(format!(
                "Message {} already has an open retry attempt",
                input.message_id
            )));
        }
        let expected = last.unwrap_or(0) + 1;
        if input.attempt_number != expected {
            return Err(Error::Validation(format!(
                "Retry attempt {} out of sequence for message {} (expected {})",
                input.attempt_number, input.message_id, expected
            )));
        }

        let attempt = sqlx::query_as::<_, RetryAttempt>(
            r#"
            INSERT INTO retry_attempts (
                id, message_id, campaign_id, attempt_number, error_type, error_text,
                delay_secs, scheduled_at, completed, success, proxy_server_id,
                relay_server_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, false, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.message_id)
        .bind(input.campaign_id)
        .bind(input.attempt_number)
        .bind(input.error_type.to_string())
        .bind(&input.error_text)
        .bind(input.delay_secs)
        .bind(input.scheduled_at)
        .bind(input.proxy_server_id)
        .bind(input.relay_server_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(attempt)
    }

    async fn list_by_message(&self, message_id: MessageId) -> Result<Vec<RetryAttempt>> {
        sqlx::query_as::<_, RetryAttempt>(
            "SELECT * FROM retry_attempts WHERE message_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn open_for_message(&self, message_id: MessageId) -> Result<Option<RetryAttempt>> {
        sqlx::query_as::<_, RetryAttempt>(
            "SELECT * FROM retry_attempts WHERE message_id = $1 AND completed = false",
        )
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn close(&self, id: RetryAttemptId, success: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE retry_attempts SET completed = true, success = $2, completed_at = NOW()
            WHERE id = $1 AND completed = false
            "#,
        )
        .bind(id)
        .bind(success)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected() == 1)
    }

    async fn close_open_for_message(&self, message_id: MessageId, success: bool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE retry_attempts SET completed = true, success = $2, completed_at = NOW()
            WHERE message_id = $1 AND completed = false
            "#,
        )
        .bind(message_id)
        .bind(success)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<RetryAttempt>> {
        sqlx::query_as::<_, RetryAttempt>(
            r#"
            SELECT * FROM retry_attempts
            WHERE campaign_id = $1
            ORDER BY message_id ASC, attempt_number ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
