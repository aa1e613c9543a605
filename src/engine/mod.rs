//! Database engine seam
//!
//! Every tenant operation goes through an explicit connection handle bound to
//! exactly one tenant database. There is no process-wide "current database":
//! callers ask a [`DatabaseServer`] for a [`TenantConnection`], use it, and
//! drop it when the tenant operation is done.
//!
//! Two engines implement the seam:
//! - [`PoolManager`](crate::pool::PoolManager): PostgreSQL, one pool per tenant database
//! - [`MemoryServer`]: in-process engine interpreting migration DDL

mod ddl;
mod memory;
mod postgres;

pub use ddl::{parse_script, DdlStatement};
pub use memory::{MemoryConnection, MemoryServer};
pub use postgres::PgConnection;

use crate::error::{GatewayError, Result};
use crate::schema::Migration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Name of the per-tenant ledger table
pub const LEDGER_TABLE: &str = "migrations";

/// Columns a table named [`LEDGER_TABLE`] must carry to be used as the ledger
const LEDGER_COLUMNS: [&str; 4] = ["id", "migration_name", "checksum", "applied_at"];

pub(crate) fn is_ledger_layout(columns: &BTreeSet<String>) -> bool {
    LEDGER_COLUMNS.iter().all(|c| columns.contains(*c))
}

/// A pre-existing table holds the ledger name but is not a ledger
pub(crate) fn foreign_ledger(database: &str) -> GatewayError {
    GatewayError::MigrationFailed {
        database: database.to_string(),
        migration: "ledger table creation".to_string(),
        cause: format!("relation \"{}\" already exists with a foreign layout", LEDGER_TABLE),
        applied_before: 0,
    }
}

/// One applied migration as recorded in a tenant ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub migration_name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Live schema of a tenant database, ledger table excluded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveSchema {
    pub tables: BTreeMap<String, LiveTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveTable {
    pub columns: BTreeSet<String>,
    pub indexes: BTreeSet<String>,
}

impl LiveSchema {
    pub fn table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.get(name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }
}

/// Connection pool usage, for engines that pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active_pools: usize,
    pub total_connections: u32,
}

/// Admin side of an engine: database lifecycle and connection handout
#[async_trait]
pub trait DatabaseServer: Send + Sync {
    type Connection: TenantConnection;

    /// Short engine identifier for logs and health output
    fn engine_name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool>;

    /// Fails with `DatabaseAlreadyExists` when the database is present
    async fn create_database(&self, db_name: &str) -> Result<()>;

    /// Fails with `DatabaseNotFound` when the database is absent
    async fn drop_database(&self, db_name: &str) -> Result<()>;

    /// Open a handle bound to `db_name`
    async fn connect(&self, db_name: &str) -> Result<Self::Connection>;
}

/// A handle bound to one tenant database
#[async_trait]
pub trait TenantConnection: Send {
    fn database(&self) -> &str;

    /// Create the ledger table if it is missing
    async fn ensure_ledger(&mut self) -> Result<()>;

    /// Ledger rows in application order
    async fn ledger(&mut self) -> Result<Vec<LedgerEntry>>;

    /// Execute one migration script and record it in the ledger atomically.
    ///
    /// Either both the schema change and the ledger row persist, or neither does.
    /// The engine stops the script itself once `deadline` has elapsed and
    /// reports `MigrationTimedOut`.
    async fn apply(&mut self, migration: &Migration, deadline: Duration) -> Result<()>;

    /// Stop whatever statement is still running on this handle
    async fn cancel(&mut self) {}

    async fn introspect(&mut self) -> Result<LiveSchema>;
}
