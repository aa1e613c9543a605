//! In-process database engine
//!
//! Models a database server as a set of named databases, each holding tables,
//! indexes and a migration ledger. Migration scripts are interpreted through
//! [`parse_script`](super::parse_script); each `apply` runs against a scratch
//! copy and only replaces the database state when every statement succeeded,
//! so a failing script leaves no trace, the same way a rolled back
//! transaction does.

use super::ddl::{parse_script, AlterAction, DdlStatement};
use super::{
    foreign_ledger, DatabaseServer, LedgerEntry, LiveSchema, LiveTable, TenantConnection, LEDGER_TABLE,
};
use crate::error::{GatewayError, Result};
use crate::schema::Migration;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct MemDatabase {
    tables: BTreeMap<String, BTreeSet<String>>,
    /// index name -> owning table
    indexes: BTreeMap<String, String>,
    ledger: Vec<LedgerEntry>,
    ledger_ready: bool,
}

impl MemDatabase {
    fn execute(&mut self, stmt: &DdlStatement) -> std::result::Result<(), String> {
        match stmt {
            DdlStatement::CreateTable {
                name,
                if_not_exists,
                columns,
                primary_key,
            } => {
                if self.relation_exists(name) {
                    return if *if_not_exists {
                        Ok(())
                    } else {
                        Err(format!("relation \"{}\" already exists", name))
                    };
                }
                let mut cols = BTreeSet::new();
                for col in columns {
                    if !cols.insert(col.clone()) {
                        return Err(format!("column \"{}\" specified more than once", col));
                    }
                }
                self.tables.insert(name.clone(), cols);
                if *primary_key {
                    self.indexes.insert(format!("{}_pkey", name), name.clone());
                }
                Ok(())
            }
            DdlStatement::DropTable { name, if_exists } => {
                if self.tables.remove(name).is_none() {
                    return if *if_exists {
                        Ok(())
                    } else {
                        Err(format!("table \"{}\" does not exist", name))
                    };
                }
                self.indexes.retain(|_, table| table != name);
                Ok(())
            }
            DdlStatement::AlterTable {
                name,
                if_exists,
                actions,
            } => {
                if !self.tables.contains_key(name) {
                    return if *if_exists {
                        Ok(())
                    } else {
                        Err(format!("relation \"{}\" does not exist", name))
                    };
                }
                let mut table = name.clone();
                for action in actions {
                    table = self.alter(&table, action)?;
                }
                Ok(())
            }
            DdlStatement::CreateIndex {
                name,
                table,
                if_not_exists,
            } => {
                if !self.tables.contains_key(table) {
                    return Err(format!("relation \"{}\" does not exist", table));
                }
                if self.relation_exists(name) {
                    return if *if_not_exists {
                        Ok(())
                    } else {
                        Err(format!("relation \"{}\" already exists", name))
                    };
                }
                self.indexes.insert(name.clone(), table.clone());
                Ok(())
            }
            DdlStatement::DropIndex { name, if_exists } => {
                if self.indexes.remove(name).is_none() && !*if_exists {
                    return Err(format!("index \"{}\" does not exist", name));
                }
                Ok(())
            }
            DdlStatement::Sleep(_) | DdlStatement::Other => Ok(()),
        }
    }

    /// Apply one ALTER TABLE action, returning the table's (possibly new) name
    fn alter(&mut self, table: &str, action: &AlterAction) -> std::result::Result<String, String> {
        match action {
            AlterAction::RenameTable { to } => {
                if self.relation_exists(to) {
                    return Err(format!("relation \"{}\" already exists", to));
                }
                if let Some(cols) = self.tables.remove(table) {
                    self.tables.insert(to.clone(), cols);
                }
                for owner in self.indexes.values_mut() {
                    if owner == table {
                        *owner = to.clone();
                    }
                }
                Ok(to.clone())
            }
            AlterAction::Other => Ok(table.to_string()),
            _ => {
                let cols = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
                match action {
                    AlterAction::AddColumn {
                        column,
                        if_not_exists,
                    } => {
                        if !cols.insert(column.clone()) && !*if_not_exists {
                            return Err(format!(
                                "column \"{}\" of relation \"{}\" already exists",
                                column, table
                            ));
                        }
                    }
                    AlterAction::DropColumn { column, if_exists } => {
                        if !cols.remove(column) && !*if_exists {
                            return Err(format!(
                                "column \"{}\" of relation \"{}\" does not exist",
                                column, table
                            ));
                        }
                    }
                    AlterAction::RenameColumn { from, to } => {
                        if cols.contains(to) {
                            return Err(format!(
                                "column \"{}\" of relation \"{}\" already exists",
                                to, table
                            ));
                        }
                        if !cols.remove(from) {
                            return Err(format!("column \"{}\" does not exist", from));
                        }
                        cols.insert(to.clone());
                    }
                    AlterAction::RenameTable { .. } | AlterAction::Other => {}
                }
                Ok(table.to_string())
            }
        }
    }

    fn relation_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
            || self.indexes.contains_key(name)
            || (self.ledger_ready && name == LEDGER_TABLE)
    }

    fn schema(&self) -> LiveSchema {
        let mut tables: BTreeMap<String, LiveTable> = self
            .tables
            .iter()
            .map(|(name, cols)| {
                (
                    name.clone(),
                    LiveTable {
                        columns: cols.clone(),
                        indexes: BTreeSet::new(),
                    },
                )
            })
            .collect();

        for (index, table) in &self.indexes {
            if let Some(t) = tables.get_mut(table) {
                t.indexes.insert(index.clone());
            }
        }

        LiveSchema { tables }
    }
}

/// In-process server holding any number of isolated databases
#[derive(Default)]
pub struct MemoryServer {
    databases: DashMap<String, Arc<Mutex<MemDatabase>>>,
    unreachable: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the server going away; every call then fails with `ConnectionFailed`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self, database: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectionFailed {
                database: database.to_string(),
                cause: "server unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseServer for MemoryServer {
    type Connection = MemoryConnection;

    fn engine_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable("(admin)")
    }

    async fn database_exists(&self, db_name: &str) -> Result<bool> {
        self.check_reachable("(admin)")?;
        Ok(self.databases.contains_key(db_name))
    }

    async fn create_database(&self, db_name: &str) -> Result<()> {
        self.check_reachable("(admin)")?;
        match self.databases.entry(db_name.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::DatabaseAlreadyExists {
                database: db_name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(MemDatabase::default())));
                debug!("Created in-memory database {}", db_name);
                Ok(())
            }
        }
    }

    async fn drop_database(&self, db_name: &str) -> Result<()> {
        self.check_reachable("(admin)")?;
        match self.databases.remove(db_name) {
            Some(_) => Ok(()),
            None => Err(GatewayError::DatabaseNotFound {
                database: db_name.to_string(),
            }),
        }
    }

    async fn connect(&self, db_name: &str) -> Result<MemoryConnection> {
        self.check_reachable(db_name)?;
        let state = self
            .databases
            .get(db_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::ConnectionFailed {
                database: db_name.to_string(),
                cause: format!("database \"{}\" does not exist", db_name),
            })?;

        Ok(MemoryConnection {
            database: db_name.to_string(),
            state,
        })
    }
}

/// Handle bound to one in-memory database
pub struct MemoryConnection {
    database: String,
    state: Arc<Mutex<MemDatabase>>,
}

impl MemoryConnection {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemDatabase>> {
        self.state.lock().map_err(|_| GatewayError::ConnectionFailed {
            database: self.database.clone(),
            cause: "database state poisoned".to_string(),
        })
    }
}

#[async_trait]
impl TenantConnection for MemoryConnection {
    fn database(&self) -> &str {
        &self.database
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        let mut db = self.lock()?;
        if !db.ledger_ready && db.tables.contains_key(LEDGER_TABLE) {
            return Err(foreign_ledger(&self.database));
        }
        db.ledger_ready = true;
        Ok(())
    }

    async fn ledger(&mut self) -> Result<Vec<LedgerEntry>> {
        Ok(self.lock()?.ledger.clone())
    }

    async fn apply(&mut self, migration: &Migration, deadline: Duration) -> Result<()> {
        let failed = |cause: String| GatewayError::MigrationFailed {
            database: self.database.clone(),
            migration: migration.name.clone(),
            cause,
            applied_before: 0,
        };

        let statements = parse_script(&migration.sql).map_err(failed)?;

        let pause: Duration = statements
            .iter()
            .filter_map(|s| match s {
                DdlStatement::Sleep(d) => Some(*d),
                _ => None,
            })
            .sum();
        if pause > deadline {
            tokio::time::sleep(deadline).await;
            return Err(GatewayError::MigrationTimedOut {
                database: self.database.clone(),
                migration: migration.name.clone(),
                timeout_secs: deadline.as_secs(),
            });
        }
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        let mut db = self.lock()?;
        if db.ledger.iter().any(|e| e.migration_name == migration.name) {
            return Err(failed(format!(
                "duplicate key value violates unique constraint \"{}_migration_name_key\"",
                LEDGER_TABLE
            )));
        }

        let mut scratch = db.clone();
        for stmt in &statements {
            scratch.execute(stmt).map_err(failed)?;
        }
        scratch.ledger.push(LedgerEntry {
            migration_name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_at: Utc::now(),
        });
        *db = scratch;

        Ok(())
    }

    async fn introspect(&mut self) -> Result<LiveSchema> {
        Ok(self.lock()?.schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const DEADLINE: Duration = Duration::from_secs(30);

    fn migration(name: &str, sql: &str) -> Migration {
        Migration::new(1, name, sql)
    }

    async fn fresh(server: &MemoryServer, name: &str) -> MemoryConnection {
        server.create_database(name).await.unwrap();
        let mut conn = server.connect(name).await.unwrap();
        conn.ensure_ledger().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_create_and_drop_database() {
        let server = MemoryServer::new();
        assert_ok!(server.create_database("tenant_a").await);
        assert!(matches!(
            server.create_database("tenant_a").await,
            Err(GatewayError::DatabaseAlreadyExists { .. })
        ));
        assert_ok!(server.drop_database("tenant_a").await);
        assert!(matches!(
            server.drop_database("tenant_a").await,
            Err(GatewayError::DatabaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_records_ledger_and_schema() {
        let server = MemoryServer::new();
        let mut conn = fresh(&server, "tenant_a").await;

        let m = migration(
            "001_members.sql",
            "CREATE TABLE members (id SERIAL PRIMARY KEY, name TEXT);
             CREATE INDEX idx_members_name ON members (name);",
        );
        assert_ok!(conn.apply(&m, DEADLINE).await);

        let ledger = conn.ledger().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].migration_name, "001_members.sql");
        assert_eq!(ledger[0].checksum, m.checksum);

        let schema = conn.introspect().await.unwrap();
        let members = schema.table("members").unwrap();
        assert!(members.columns.contains("name"));
        assert!(members.indexes.contains("members_pkey"));
        assert!(members.indexes.contains("idx_members_name"));
        assert!(!schema.has_table(LEDGER_TABLE));
    }

    #[tokio::test]
    async fn test_failed_script_leaves_no_trace() {
        let server = MemoryServer::new();
        let mut conn = fresh(&server, "tenant_a").await;

        let bad = migration(
            "001_half.sql",
            "CREATE TABLE members (id INT); ALTER TABLE ghosts ADD COLUMN x INT;",
        );
        let err = conn.apply(&bad, DEADLINE).await.unwrap_err();
        assert!(err.to_string().contains("ghosts"));

        assert!(conn.ledger().await.unwrap().is_empty());
        assert!(!conn.introspect().await.unwrap().has_table("members"));
    }

    #[tokio::test]
    async fn test_script_past_deadline_is_stopped() {
        let server = MemoryServer::new();
        let mut conn = fresh(&server, "tenant_a").await;

        let slow = migration("001_slow.sql", "SELECT pg_sleep(5); CREATE TABLE slow (id INT);");
        let err = conn.apply(&slow, Duration::from_millis(20)).await.unwrap_err();

        assert!(matches!(err, GatewayError::MigrationTimedOut { .. }));
        assert!(conn.ledger().await.unwrap().is_empty());
        assert!(!conn.introspect().await.unwrap().has_table("slow"));
    }

    #[tokio::test]
    async fn test_foreign_ledger_table_rejected() {
        let server = MemoryServer::new();
        server.create_database("tenant_a").await.unwrap();
        let mut conn = server.connect("tenant_a").await.unwrap();

        conn.apply(&migration("000_legacy.sql", "CREATE TABLE migrations (version INT);"), DEADLINE)
            .await
            .unwrap();

        let err = conn.ensure_ledger().await.unwrap_err();
        assert!(err.to_string().contains("foreign layout"));
    }

    #[tokio::test]
    async fn test_rename_table_moves_indexes() {
        let server = MemoryServer::new();
        let mut conn = fresh(&server, "tenant_a").await;

        conn.apply(
            &migration(
                "001.sql",
                "CREATE TABLE people (id INT PRIMARY KEY, email TEXT);
                 CREATE INDEX idx_people_email ON people (email);
                 ALTER TABLE people RENAME TO members, RENAME COLUMN email TO contact_email;",
            ),
            DEADLINE,
        )
        .await
        .unwrap();

        let schema = conn.introspect().await.unwrap();
        assert!(!schema.has_table("people"));
        let members = schema.table("members").unwrap();
        assert!(members.columns.contains("contact_email"));
        assert!(members.indexes.contains("idx_people_email"));
    }

    #[tokio::test]
    async fn test_databases_are_isolated() {
        let server = MemoryServer::new();
        let mut a = fresh(&server, "tenant_a").await;
        let mut b = fresh(&server, "tenant_b").await;

        a.apply(&migration("001.sql", "CREATE TABLE only_a (id INT);"), DEADLINE)
            .await
            .unwrap();

        assert!(a.introspect().await.unwrap().has_table("only_a"));
        assert!(!b.introspect().await.unwrap().has_table("only_a"));
        assert!(b.ledger().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let server = MemoryServer::new();
        server.create_database("tenant_a").await.unwrap();
        server.set_unreachable(true);

        let err = server.connect("tenant_a").await.err().unwrap();
        assert!(err.is_fatal());
        assert_err!(server.ping().await);
    }

    #[tokio::test]
    async fn test_ledger_name_is_reserved() {
        let server = MemoryServer::new();
        let mut conn = fresh(&server, "tenant_a").await;
        assert_err!(
            conn.apply(&migration("001.sql", "CREATE TABLE migrations (id INT);"), DEADLINE)
                .await
        );
    }
}
