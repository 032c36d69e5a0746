//! Campaign delivery settings repository

use crate::db::DatabasePool;
use crate::models::CampaignDeliverySettings;
use async_trait::async_trait;
use chrono::Utc;
use relaycast_common::types::CampaignId;
use relaycast_common::{Error, Result};

/// Delivery settings repository trait
#[async_trait]
pub trait DeliverySettingsRepository: Send + Sync {
    /// Load the campaign's settings, creating the defaults on first use
    async fn load_or_create(&self, campaign_id: CampaignId) -> Result<CampaignDeliverySettings>;
    async fn update(&self, settings: &CampaignDeliverySettings) -> Result<()>;
}

/// Database delivery settings repository
pub struct DbDeliverySettingsRepository {
    pool: DatabasePool,
}

impl DbDeliverySettingsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliverySettingsRepository for DbDeliverySettingsRepository {
    async fn load_or_create(&self, campaign_id: CampaignId) -> Result<CampaignDeliverySettings> {
        let defaults = CampaignDeliverySettings::defaults(campaign_id);

        // DO NOTHING leaves concurrent creators racing harmlessly; the SELECT
        // below returns whichever row won.
        sqlx::query(
            r#"
            INSERT INTO campaign_delivery_settings (
                campaign_id, proxy_strategy, relay_strategy, adaptive_optimization,
                carrier_optimization, timezone_optimization, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (campaign_id) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(defaults.proxy_strategy.to_string())
        .bind(defaults.relay_strategy.to_string())
        .bind(defaults.adaptive_optimization)
        .bind(defaults.carrier_optimization)
        .bind(defaults.timezone_optimization)
        .bind(defaults.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query_as::<_, CampaignDeliverySettings>(
            "SELECT * FROM campaign_delivery_settings WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update(&self, settings: &CampaignDeliverySettings) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_delivery_settings SET
                proxy_strategy = $2,
                relay_strategy = $3,
                min_delay_secs = $4,
                max_delay_secs = $5,
                delay_seed = $6,
                adaptive_optimization = $7,
                carrier_optimization = $8,
                timezone_optimization = $9,
                updated_at = $10
            WHERE campaign_id = $1
            "#,
        )
        .bind(settings.campaign_id)
        .bind(settings.proxy_strategy.to_string())
        .bind(settings.relay_strategy.to_string())
        .bind(settings.min_delay_secs)
        .bind(settings.max_delay_secs)
        .bind(settings.delay_seed)
        .bind(settings.adaptive_optimization)
        .bind(settings.carrier_optimization)
        .bind(settings.timezone_optimization)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
