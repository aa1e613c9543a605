//! PostgreSQL engine on top of [`PoolManager`]
//!
//! Each tenant database has its own pool, so a `PgConnection` can only ever
//! talk to the database it was opened for.

use super::{
    foreign_ledger, is_ledger_layout, DatabaseServer, LedgerEntry, LiveSchema, PoolStats,
    TenantConnection, LEDGER_TABLE,
};
use crate::error::{GatewayError, Result};
use crate::pool::PoolManager;
use crate::schema::Migration;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

#[async_trait]
impl DatabaseServer for PoolManager {
    type Connection = PgConnection;

    fn engine_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        let client = self.admin_client().await?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                database: "postgres (admin)".to_string(),
                cause: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            active_pools: self.active_pools(),
            total_connections: self.total_connections(),
        })
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool> {
        self.db_exists(db_name).await
    }

    async fn create_database(&self, db_name: &str) -> Result<()> {
        if self.db_exists(db_name).await? {
            return Err(GatewayError::DatabaseAlreadyExists {
                database: db_name.to_string(),
            });
        }
        self.create_db(db_name).await
    }

    async fn drop_database(&self, db_name: &str) -> Result<()> {
        if !self.db_exists(db_name).await? {
            self.remove_pool(db_name);
            return Err(GatewayError::DatabaseNotFound {
                database: db_name.to_string(),
            });
        }
        self.drop_db(db_name).await
    }

    async fn connect(&self, db_name: &str) -> Result<PgConnection> {
        let pool = self.get_pool(db_name).await?;
        let client = pool.get().await.map_err(|e| GatewayError::ConnectionFailed {
            database: db_name.to_string(),
            cause: e.to_string(),
        })?;

        debug!("Opened connection to {}", db_name);

        Ok(PgConnection {
            database: db_name.to_string(),
            client,
        })
    }
}

/// Pooled client bound to one tenant database; returned to its pool on drop
pub struct PgConnection {
    database: String,
    client: deadpool_postgres::Object,
}

impl PgConnection {
    fn query_error(&self, what: &str, e: tokio_postgres::Error) -> GatewayError {
        if e.is_closed() {
            GatewayError::ConnectionFailed {
                database: self.database.clone(),
                cause: e.to_string(),
            }
        } else {
            GatewayError::IntrospectionFailed {
                database: self.database.clone(),
                cause: format!("{}: {}", what, e),
            }
        }
    }
}

fn migration_error(database: &str, migration: &str, e: tokio_postgres::Error) -> GatewayError {
    if e.is_closed() {
        return GatewayError::ConnectionFailed {
            database: database.to_string(),
            cause: e.to_string(),
        };
    }

    let cause = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());

    GatewayError::MigrationFailed {
        database: database.to_string(),
        migration: migration.to_string(),
        cause,
        applied_before: 0,
    }
}

fn apply_error(
    database: &str,
    migration: &Migration,
    deadline: Duration,
    e: tokio_postgres::Error,
) -> GatewayError {
    if e.code() == Some(&SqlState::QUERY_CANCELED) {
        return GatewayError::MigrationTimedOut {
            database: database.to_string(),
            migration: migration.name.clone(),
            timeout_secs: deadline.as_secs(),
        };
    }
    migration_error(database, &migration.name, e)
}

#[async_trait]
impl TenantConnection for PgConnection {
    fn database(&self) -> &str {
        &self.database
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                migration_name TEXT NOT NULL UNIQUE,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            LEDGER_TABLE
        );

        self.client
            .batch_execute(&sql)
            .await
            .map_err(|e| migration_error(&self.database, "ledger table creation", e))?;

        // IF NOT EXISTS also accepts an unrelated table that took the name first
        let rows = self
            .client
            .query(
                r#"
                SELECT column_name::text
                FROM information_schema.columns
                WHERE table_schema = 'public' AND table_name::text = $1::text
                "#,
                &[&LEDGER_TABLE],
            )
            .await
            .map_err(|e| self.query_error("read ledger layout", e))?;

        let columns: BTreeSet<String> = rows.iter().map(|row| row.get(0)).collect();
        if !is_ledger_layout(&columns) {
            return Err(foreign_ledger(&self.database));
        }

        Ok(())
    }

    async fn ledger(&mut self) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT migration_name, checksum, applied_at FROM {} ORDER BY id",
            LEDGER_TABLE
        );

        let rows = self
            .client
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| self.query_error("read ledger", e))?;

        Ok(rows
            .iter()
            .map(|row| LedgerEntry {
                migration_name: row.get(0),
                checksum: row.get(1),
                applied_at: row.get(2),
            })
            .collect())
    }

    async fn apply(&mut self, migration: &Migration, deadline: Duration) -> Result<()> {
        let database = self.database.clone();
        let fail = |e: tokio_postgres::Error| apply_error(&database, migration, deadline, e);
        let insert = format!(
            "INSERT INTO {} (migration_name, checksum) VALUES ($1, $2)",
            LEDGER_TABLE
        );
        // Scoped to the transaction; the server aborts the script with 57014
        let statement_timeout = format!(
            "SET LOCAL statement_timeout = {}",
            deadline.as_millis().max(1)
        );

        let pg: &mut tokio_postgres::Client = &mut self.client;
        let tx = pg.transaction().await.map_err(fail)?;

        // Dropping `tx` on any early return rolls the script back
        tx.batch_execute(&statement_timeout).await.map_err(fail)?;
        tx.batch_execute(&migration.sql).await.map_err(fail)?;
        tx.execute(insert.as_str(), &[&migration.name, &migration.checksum])
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;

        Ok(())
    }

    async fn cancel(&mut self) {
        let token = self.client.cancel_token();
        match token.cancel_query(NoTls).await {
            Ok(()) => warn!("Cancelled running statement on {}", self.database),
            Err(e) => warn!("Failed to cancel running statement on {}: {}", self.database, e),
        }
    }

    async fn introspect(&mut self) -> Result<LiveSchema> {
        let mut schema = LiveSchema::default();

        let rows = self
            .client
            .query(
                r#"
                SELECT t.table_name::text, c.column_name::text
                FROM information_schema.tables t
                LEFT JOIN information_schema.columns c
                    ON t.table_name = c.table_name
                    AND t.table_schema = c.table_schema
                WHERE t.table_schema = 'public'
                    AND t.table_type = 'BASE TABLE'
                    AND t.table_name::text <> $1::text
                ORDER BY t.table_name, c.ordinal_position
                "#,
                &[&LEDGER_TABLE],
            )
            .await
            .map_err(|e| self.query_error("read columns", e))?;

        for row in rows {
            let table: String = row.get(0);
            let column: Option<String> = row.get(1);
            let entry = schema.tables.entry(table).or_default();
            if let Some(column) = column {
                entry.columns.insert(column);
            }
        }

        let rows = self
            .client
            .query(
                r#"
                SELECT tablename::text, indexname::text
                FROM pg_indexes
                WHERE schemaname = 'public' AND tablename::text <> $1::text
                "#,
                &[&LEDGER_TABLE],
            )
            .await
            .map_err(|e| self.query_error("read indexes", e))?;

        for row in rows {
            let table: String = row.get(0);
            let index: String = row.get(1);
            if let Some(entry) = schema.tables.get_mut(&table) {
                entry.indexes.insert(index);
            }
        }

        Ok(schema)
    }
}
