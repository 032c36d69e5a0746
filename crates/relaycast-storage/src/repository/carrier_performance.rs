//! Carrier performance repository

use crate::db::DatabasePool;
use crate::models::{CarrierOutcome, CarrierPerformanceLog};
use async_trait::async_trait;
use relaycast_common::types::{normalize_carrier, UserId};
use relaycast_common::{Error, Result};

/// Carrier performance repository trait
#[async_trait]
pub trait CarrierPerformanceRepository: Send + Sync {
    /// Fold one outcome into the (user, carrier, proxy, relay) entry
    async fn record(&self, outcome: CarrierOutcome) -> Result<()>;
    /// Entries for a carrier, best success rate first, then fastest
    async fn for_carrier(&self, user_id: UserId, carrier: &str)
        -> Result<Vec<CarrierPerformanceLog>>;
}

/// Database carrier performance repository
pub struct DbCarrierPerformanceRepository {
    pool: DatabasePool,
}

impl DbCarrierPerformanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CarrierPerformanceRepository for DbCarrierPerformanceRepository {
    async fn record(&self, outcome: CarrierOutcome) -> Result<()> {
        let successful: i64 = if outcome.success { 1 } else { 0 };

        // The unique index is over COALESCE(proxy_server_id, nil) so that
        // relay-only combinations still collapse into one row.
        sqlx::query(
            r#"
            INSERT INTO carrier_performance_logs (
                user_id, carrier, proxy_server_id, relay_server_id, total_messages,
                successful_messages, success_rate, average_delivery_ms, updated_at
            )
            VALUES ($1, $2, $3, $4, 1, $5, $5::float8, $6, NOW())
            ON CONFLICT (user_id, carrier, (COALESCE(proxy_server_id, '00000000-0000-0000-0000-000000000000'::uuid)), relay_server_id)
            DO UPDATE SET
                total_messages = carrier_performance_logs.total_messages + 1,
                successful_messages = carrier_performance_logs.successful_messages + $5,
                success_rate = (carrier_performance_logs.successful_messages + $5)::float8
                    / (carrier_performance_logs.total_messages + 1),
                average_delivery_ms = (carrier_performance_logs.average_delivery_ms
                    * carrier_performance_logs.total_messages + $6)
                    / (carrier_performance_logs.total_messages + 1),
                updated_at = NOW()
            "#,
        )
        .bind(outcome.user_id)
        .bind(normalize_carrier(&outcome.carrier))
        .bind(outcome.proxy_server_id)
        .bind(outcome.relay_server_id)
        .bind(successful)
        .bind(outcome.delivery_ms)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn for_carrier(
        &self,
        user_id: UserId,
        carrier: &str,
    ) -> Result<Vec<CarrierPerformanceLog>> {
        sqlx::query_as::<_, CarrierPerformanceLog>(
            r#"
            SELECT * FROM carrier_performance_logs
            WHERE user_id = $1 AND carrier = $2
            ORDER BY success_rate DESC, average_delivery_ms ASC
            "#,
        )
        .bind(user_id)
        .bind(normalize_carrier(carrier))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
