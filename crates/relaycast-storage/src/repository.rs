//! Repository layer for data access

pub mod campaigns;
pub mod carrier_performance;
pub mod delivery_settings;
pub mod messages;
pub mod retry_attempts;
pub mod routing_rules;
pub mod servers;

use std::sync::Arc;

use relaycast_common::config::DatabaseConfig;
use relaycast_common::{Error, Result};
use tracing::warn;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;

// Re-export concrete repository implementations
pub use campaigns::DbCampaignRepository;
pub use carrier_performance::DbCarrierPerformanceRepository;
pub use delivery_settings::DbDeliverySettingsRepository;
pub use messages::DbMessageRepository;
pub use retry_attempts::DbRetryAttemptRepository;
pub use routing_rules::DbRoutingRuleRepository;
pub use servers::DbServerRepository;

// Re-export repository traits
pub use campaigns::CampaignRepository;
pub use carrier_performance::CarrierPerformanceRepository;
pub use delivery_settings::DeliverySettingsRepository;
pub use messages::MessageRepository;
pub use retry_attempts::RetryAttemptRepository;
pub use routing_rules::RoutingRuleRepository;
pub use servers::{ServerRepository, UsageUpdate};

/// Every repository the dispatch engine needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub servers: Arc<dyn ServerRepository>,
    pub settings: Arc<dyn DeliverySettingsRepository>,
    pub rules: Arc<dyn RoutingRuleRepository>,
    pub retries: Arc<dyn RetryAttemptRepository>,
    pub performance: Arc<dyn CarrierPerformanceRepository>,
}

impl Repositories {
    /// Repositories for the configured `database.backend`
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        match config.backend.as_str() {
            "postgres" => Ok(Self::postgres(DatabasePool::open(config).await?)),
            "memory" => {
                warn!("In-memory storage selected, nothing survives a restart");
                Ok(Self::memory(Arc::new(MemoryStore::new())))
            }
            other => Err(Error::Config(format!(
                "Unknown database backend: {}",
                other
            ))),
        }
    }

    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            servers: Arc::new(DbServerRepository::new(pool.clone())),
            settings: Arc::new(DbDeliverySettingsRepository::new(pool.clone())),
            rules: Arc::new(DbRoutingRuleRepository::new(pool.clone())),
            retries: Arc::new(DbRetryAttemptRepository::new(pool.clone())),
            performance: Arc::new(DbCarrierPerformanceRepository::new(pool)),
        }
    }

    /// Repositories backed by one shared in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            campaigns: store.clone(),
            messages: store.clone(),
            servers: store.clone(),
            settings: store.clone(),
            rules: store.clone(),
            retries: store.clone(),
            performance: store,
        }
    }
}
