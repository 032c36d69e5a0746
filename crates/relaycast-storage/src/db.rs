//! PostgreSQL connection pool
//!
//! One pool is shared by every `Db*` repository. The workers of all running
//! campaigns draw from it, so `max_connections` bounds how many store calls
//! the dispatch engine has in flight.

use std::time::Duration;

use relaycast_common::config::DatabaseConfig;
use relaycast_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

/// How long a store call waits for a free connection
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared PostgreSQL pool
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect, apply pending migrations and check the database answers
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let url = postgres_url(config)?;

        let max = config.max_connections.max(1);
        let min = config.min_connections.min(max);
        if min < config.min_connections {
            warn!(
                min_connections = config.min_connections,
                max_connections = max,
                "min_connections above max_connections, clamped"
            );
        }

        let pool = PgPoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        let db = Self { pool };
        db.migrate().await?;
        db.ping().await?;
        info!(max_connections = max, "Dispatch database ready");
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Ping failed: {}", e)))?;
        Ok(())
    }
}

fn postgres_url(config: &DatabaseConfig) -> Result<String> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "database.backend \"{}\" has no connection pool",
            config.backend
        )));
    }
    config
        .url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| Error::Config("database.url is required for postgres".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_url() {
        let mut config = DatabaseConfig::default();
        assert!(postgres_url(&config).is_err());

        config.url = Some("  ".into());
        assert!(postgres_url(&config).is_err());

        config.url = Some("postgres://localhost/relaycast".into());
        assert_eq!(
            postgres_url(&config).unwrap(),
            "postgres://localhost/relaycast"
        );

        config.backend = "memory".into();
        assert_eq!(postgres_url(&config).unwrap_err().code(), "CONFIG_ERROR");
    }
}
