use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::pool::router::is_valid_identifier;
use dashmap::DashMap;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, info};

const ADMIN_DATABASE: &str = "postgres (admin)";

struct PoolEntry {
    pool: Pool,
    last_used: Mutex<Instant>,
}

impl PoolEntry {
    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn last_used(&self) -> Instant {
        self.last_used
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Instant::now())
    }
}

/// PostgreSQL server access: one admin pool plus one pool per tenant database.
///
/// Tenant pools are created on first use, evicted least-recently-used when the
/// connection budget is exhausted, and removed after sitting idle.
pub struct PoolManager {
    pools: DashMap<String, Arc<PoolEntry>>,
    config: Config,
    total_connections: AtomicU32,
    admin_pool: Pool,
}

impl PoolManager {
    pub async fn new(config: Config) -> Result<Self> {
        let admin_pool = create_pool(&config.database_url, config.max_connections_per_pool)?;

        let client = admin_pool.get().await.map_err(|e| GatewayError::ConnectionFailed {
            database: ADMIN_DATABASE.to_string(),
            cause: e.to_string(),
        })?;

        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                database: ADMIN_DATABASE.to_string(),
                cause: format!("Ping failed: {}", e),
            })?;

        info!("Connected to PostgreSQL admin database");

        Ok(Self {
            pools: DashMap::new(),
            config,
            total_connections: AtomicU32::new(0),
            admin_pool,
        })
    }

    pub(crate) async fn admin_client(&self) -> Result<deadpool_postgres::Object> {
        self.admin_pool
            .get()
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                database: ADMIN_DATABASE.to_string(),
                cause: e.to_string(),
            })
    }

    pub async fn get_pool(&self, db_name: &str) -> Result<Pool> {
        let cached = self.pools.get(db_name).map(|entry| entry.value().clone());
        if let Some(entry) = cached {
            entry.touch();
            return Ok(entry.pool.clone());
        }

        self.create_pool_for_database(db_name).await
    }

    async fn create_pool_for_database(&self, db_name: &str) -> Result<Pool> {
        let current = self.total_connections.load(Ordering::Relaxed);
        if current + self.config.max_connections_per_pool > self.config.max_total_connections {
            self.evict_lru_pool();
        }

        let db_url = self.database_url_for(db_name)?;
        let pool = create_pool(&db_url, self.config.max_connections_per_pool)?;

        // Fail here rather than on first use
        let _ = pool.get().await.map_err(|e| GatewayError::ConnectionFailed {
            database: db_name.to_string(),
            cause: e.to_string(),
        })?;

        let entry = Arc::new(PoolEntry {
            pool: pool.clone(),
            last_used: Mutex::new(Instant::now()),
        });

        if self.pools.insert(db_name.to_string(), entry).is_none() {
            self.total_connections
                .fetch_add(self.config.max_connections_per_pool, Ordering::Relaxed);
        }

        info!("Created pool for database: {}", db_name);

        Ok(pool)
    }

    fn database_url_for(&self, db_name: &str) -> Result<String> {
        database_url_for(&self.config.database_url, db_name)
    }

    fn evict_lru_pool(&self) {
        let oldest = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_used()))
            .min_by_key(|(_, last_used)| *last_used);

        if let Some((key, last_used)) = oldest {
            if self.remove_pool(&key) {
                info!(
                    "Evicted pool for database: {} (idle since {:?} ago)",
                    key,
                    last_used.elapsed()
                );
            }
        }
    }

    /// Forget the cached pool for a database; true when one was removed
    pub fn remove_pool(&self, db_name: &str) -> bool {
        match self.pools.remove(db_name) {
            Some((_, entry)) => {
                entry.pool.close();
                self.total_connections
                    .fetch_sub(self.config.max_connections_per_pool, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn cleanup_idle_pools(&self) -> usize {
        let idle_timeout = self.config.pool_idle_timeout;

        let to_remove: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.value().last_used().elapsed() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in to_remove {
            if self.remove_pool(&key) {
                removed += 1;
                debug!("Cleaned up idle pool for database: {}", key);
            }
        }

        if removed > 0 {
            info!("Cleaned up {} idle pools", removed);
        }

        removed
    }

    pub async fn db_exists(&self, db_name: &str) -> Result<bool> {
        let client = self.admin_client().await?;

        let row = client
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&db_name])
            .await
            .map_err(|e| admin_query_error(&e))?;

        Ok(row.is_some())
    }

    pub async fn create_db(&self, db_name: &str) -> Result<()> {
        // DDL cannot take parameters
        ensure_identifier(db_name)?;

        let client = self.admin_client().await?;
        let sql = format!("CREATE DATABASE \"{}\"", db_name);

        client.batch_execute(&sql).await.map_err(|e| {
            if e.code() == Some(&SqlState::DUPLICATE_DATABASE) {
                GatewayError::DatabaseAlreadyExists {
                    database: db_name.to_string(),
                }
            } else {
                admin_query_error(&e)
            }
        })?;

        info!("Created database: {}", db_name);
        Ok(())
    }

    pub async fn drop_db(&self, db_name: &str) -> Result<()> {
        ensure_identifier(db_name)?;

        // Our own idle connections would otherwise block the drop
        self.remove_pool(db_name);

        let client = self.admin_client().await?;
        let sql = format!("DROP DATABASE \"{}\" WITH (FORCE)", db_name);

        client.batch_execute(&sql).await.map_err(|e| {
            if e.code() == Some(&SqlState::INVALID_CATALOG_NAME) {
                GatewayError::DatabaseNotFound {
                    database: db_name.to_string(),
                }
            } else {
                admin_query_error(&e)
            }
        })?;

        info!("Dropped database: {}", db_name);
        Ok(())
    }

    pub fn active_pools(&self) -> usize {
        self.pools.len()
    }

    pub fn total_connections(&self) -> u32 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

/// Replace the database segment of a connection URL, keeping any query string
fn database_url_for(base_url: &str, db_name: &str) -> Result<String> {
    let (without_query, query) = match base_url.split_once('?') {
        Some((head, q)) => (head, Some(q)),
        None => (base_url, None),
    };

    let authority_start = without_query.find("://").map(|i| i + 3).unwrap_or(0);

    match without_query.rfind('/') {
        Some(last_slash) if last_slash >= authority_start => {
            let mut url = format!("{}{}", &without_query[..last_slash + 1], db_name);
            if let Some(q) = query {
                url.push('?');
                url.push_str(q);
            }
            Ok(url)
        }
        _ => Err(GatewayError::Internal(format!(
            "Invalid DATABASE_URL format: {}",
            base_url
        ))),
    }
}

fn ensure_identifier(db_name: &str) -> Result<()> {
    if is_valid_identifier(db_name) {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest {
            message: format!("Invalid database name: {}", db_name),
        })
    }
}

fn admin_query_error(e: &tokio_postgres::Error) -> GatewayError {
    if e.is_closed() {
        GatewayError::ConnectionFailed {
            database: ADMIN_DATABASE.to_string(),
            cause: e.to_string(),
        }
    } else {
        GatewayError::Internal(e.to_string())
    }
}

fn create_pool(database_url: &str, max_size: u32) -> Result<Pool> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(database_url.to_string());

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: max_size as usize,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(Duration::from_secs(5)),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| GatewayError::Internal(format!("Failed to create pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url_for() {
        assert_eq!(
            database_url_for("postgres://u:p@db:5432/postgres", "tenant_acme").unwrap(),
            "postgres://u:p@db:5432/tenant_acme"
        );
        assert_eq!(
            database_url_for("postgres://u:p@db/postgres?sslmode=disable", "tenant_acme").unwrap(),
            "postgres://u:p@db/tenant_acme?sslmode=disable"
        );
        assert!(database_url_for("postgres://db", "tenant_acme").is_err());
    }

    #[test]
    fn test_ensure_identifier_rejects_injection() {
        assert!(ensure_identifier("tenant_acme").is_ok());
        assert!(matches!(
            ensure_identifier("tenant\"; DROP DATABASE postgres; --"),
            Err(GatewayError::InvalidRequest { .. })
        ));
    }
}
