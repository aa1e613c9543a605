//! Tenant Manager
//!
//! Ties the registry, provisioner, migration runner and verifier together.
//! Every tenant operation opens its own connection handle to that tenant's
//! database and releases it when done. Operations on one tenant are
//! serialized by a per-tenant lock; a second caller fails fast instead of
//! queueing behind a long migration.

use crate::engine::{DatabaseServer, LedgerEntry, TenantConnection};
use crate::error::{GatewayError, Result};
use crate::provisioner::{DropOutcome, ProvisionOutcome, Provisioner};
use crate::registry::{Tenant, TenantRegistry, TenantStatus};
use crate::schema::{
    MigrationCatalog, MigrationPlan, MigrationReport, MigrationRunner, SchemaExpectation,
    SchemaVerifier, VerificationReport,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied(MigrationReport),
    DryRun(MigrationPlan),
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardReport {
    pub tenant: Tenant,
    pub provision: ProvisionOutcome,
    pub migration: MigrationReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub tenant_id: String,
    pub database: String,
    /// None when the drop failed; the failure is logged, not returned
    pub drop_outcome: Option<DropOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantMigrationResult {
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<MigrationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchMigrationReport {
    pub results: Vec<TenantMigrationResult>,
    /// Set when a connection failure stopped the batch early
    pub aborted: bool,
}

impl BatchMigrationReport {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

pub struct TenantManager<S: DatabaseServer> {
    server: Arc<S>,
    registry: TenantRegistry,
    provisioner: Provisioner<S>,
    runner: MigrationRunner,
    verifier: SchemaVerifier,
    catalog: MigrationCatalog,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: DatabaseServer> TenantManager<S> {
    pub fn new(
        server: Arc<S>,
        registry: TenantRegistry,
        catalog: MigrationCatalog,
        migration_timeout: Duration,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(server.clone()),
            server,
            registry,
            runner: MigrationRunner::new(migration_timeout),
            verifier: SchemaVerifier::new(),
            catalog,
            locks: DashMap::new(),
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    fn lock(&self, tenant_id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(tenant_id.to_string())
            .or_default()
            .value()
            .clone();

        lock.try_lock_owned()
            .map_err(|_| GatewayError::MigrationInProgress {
                tenant_id: tenant_id.to_string(),
            })
    }

    async fn connect(&self, tenant: &Tenant) -> Result<S::Connection> {
        if !self.server.database_exists(&tenant.database_name).await? {
            return Err(GatewayError::DatabaseNotFound {
                database: tenant.database_name.clone(),
            });
        }
        self.server.connect(&tenant.database_name).await
    }

    /// Register, provision and migrate a new tenant
    pub async fn onboard(&self, tenant_id: &str, slug: &str) -> Result<OnboardReport> {
        let tenant = self.registry.register(tenant_id, slug)?;
        let _guard = self.lock(tenant_id)?;

        let provision = self.provisioner.create_database(&tenant.database_name).await?;
        let migration = self.run_migrations(&tenant).await?;

        info!(
            "Onboarded tenant {} ({} migrations applied)",
            tenant_id,
            migration.applied_count()
        );

        Ok(OnboardReport {
            tenant,
            provision,
            migration,
        })
    }

    pub async fn provision(&self, tenant_id: &str) -> Result<ProvisionOutcome> {
        let tenant = self.registry.get(tenant_id)?;
        let _guard = self.lock(tenant_id)?;

        self.provisioner.create_database(&tenant.database_name).await
    }

    pub async fn migrate(&self, tenant_id: &str, dry_run: bool) -> Result<MigrationOutcome> {
        let tenant = self.registry.get(tenant_id)?;
        if !tenant.is_active() {
            return Err(GatewayError::TenantInactive {
                tenant_id: tenant_id.to_string(),
            });
        }

        let _guard = self.lock(tenant_id)?;

        if dry_run {
            let mut conn = self.connect(&tenant).await?;
            let plan = self.runner.plan(&mut conn, &self.catalog).await?;
            return Ok(MigrationOutcome::DryRun(plan));
        }

        Ok(MigrationOutcome::Applied(self.run_migrations(&tenant).await?))
    }

    async fn run_migrations(&self, tenant: &Tenant) -> Result<MigrationReport> {
        let mut conn = self.connect(tenant).await?;
        let report = self.runner.run(&mut conn, &self.catalog).await;
        drop(conn);
        debug!("Released connection to {}", tenant.database_name);
        report
    }

    /// Migrate every active tenant, one at a time.
    ///
    /// Per-tenant failures are recorded and the batch moves on; a connection
    /// failure stops it.
    pub async fn migrate_all(&self, dry_run: bool) -> Result<BatchMigrationReport> {
        let tenants: Vec<Tenant> = self
            .registry
            .list()?
            .into_iter()
            .filter(Tenant::is_active)
            .collect();

        info!("Migrating {} active tenants (dry run: {})", tenants.len(), dry_run);

        let mut results = Vec::with_capacity(tenants.len());
        let mut aborted = false;

        for tenant in tenants {
            match self.migrate(&tenant.id, dry_run).await {
                Ok(outcome) => results.push(TenantMigrationResult {
                    tenant_id: tenant.id,
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(e) => {
                    let fatal = e.is_fatal();
                    if fatal {
                        error!("Aborting batch at tenant {}: {}", tenant.id, e);
                    } else {
                        warn!("Migration of tenant {} failed: {}", tenant.id, e);
                    }
                    results.push(TenantMigrationResult {
                        tenant_id: tenant.id,
                        outcome: None,
                        error: Some(e.to_string()),
                    });
                    if fatal {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        Ok(BatchMigrationReport { results, aborted })
    }

    pub async fn verify(
        &self,
        tenant_id: &str,
        expectation: &SchemaExpectation,
    ) -> Result<VerificationReport> {
        expectation.validate()?;

        let tenant = self.registry.get(tenant_id)?;
        let _guard = self.lock(tenant_id)?;

        let mut conn = self.connect(&tenant).await?;
        self.verifier.report(&mut conn, expectation).await
    }

    pub async fn ledger(&self, tenant_id: &str) -> Result<Vec<LedgerEntry>> {
        let tenant = self.registry.get(tenant_id)?;
        let _guard = self.lock(tenant_id)?;

        let mut conn = self.connect(&tenant).await?;
        conn.ensure_ledger().await?;
        conn.ledger().await
    }

    pub fn set_status(&self, tenant_id: &str, status: TenantStatus) -> Result<Tenant> {
        self.registry.set_status(tenant_id, status)
    }

    /// Drop the tenant database (best effort) and forget the tenant
    pub async fn teardown(&self, tenant_id: &str) -> Result<TeardownReport> {
        let tenant = self.registry.get(tenant_id)?;
        let guard = self.lock(tenant_id)?;

        let drop_outcome = self.provisioner.teardown(&tenant.database_name).await;
        self.registry.remove(tenant_id)?;

        drop(guard);
        self.locks.remove(tenant_id);

        info!("Tore down tenant {}", tenant_id);

        Ok(TeardownReport {
            tenant_id: tenant.id,
            database: tenant.database_name,
            drop_outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryServer;
    use crate::pool::DatabaseRouter;
    use crate::schema::{Migration, SchemaViolation, TableExpectation};
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn full_catalog() -> MigrationCatalog {
        MigrationCatalog::from_migrations(vec![
            Migration::new(
                1,
                "001_members.sql",
                "CREATE TABLE members (id SERIAL PRIMARY KEY, name TEXT NOT NULL);",
            ),
            Migration::new(
                2,
                "002_members_tenant_user.sql",
                "ALTER TABLE members ADD COLUMN tenant_user_id INT;",
            ),
            Migration::new(
                3,
                "003_member_roles.sql",
                "CREATE TABLE member_roles (member_id INT NOT NULL, role TEXT NOT NULL, PRIMARY KEY (member_id, role));",
            ),
        ])
        .unwrap()
    }

    fn without_tenant_user() -> MigrationCatalog {
        MigrationCatalog::from_migrations(
            full_catalog()
                .migrations()
                .iter()
                .filter(|m| m.version != 2)
                .cloned()
                .collect(),
        )
        .unwrap()
    }

    fn members_expectation() -> SchemaExpectation {
        SchemaExpectation::new().table(
            TableExpectation::new("members")
                .requires(&["tenant_user_id"])
                .forbids(&["password"]),
        )
    }

    fn manager_with(
        server: Arc<MemoryServer>,
        dir: &TempDir,
        catalog: MigrationCatalog,
    ) -> TenantManager<MemoryServer> {
        let registry = TenantRegistry::new(dir.path(), DatabaseRouter::new("tenant"));
        TenantManager::new(server, registry, catalog, Duration::from_secs(5))
    }

    fn manager(dir: &TempDir) -> TenantManager<MemoryServer> {
        manager_with(Arc::new(MemoryServer::new()), dir, full_catalog())
    }

    #[tokio::test]
    async fn test_onboard_applies_full_catalog() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let report = manager.onboard("acme", "acme").await.unwrap();

        assert_eq!(report.provision, ProvisionOutcome::Created);
        assert_eq!(report.migration.applied_count(), 3);
        assert_eq!(report.tenant.database_name, "tenant_acme");
        assert_eq!(
            manager.ledger("acme").await.unwrap().len(),
            manager.catalog().len()
        );
    }

    #[tokio::test]
    async fn test_ledger_matches_catalog_of_any_size() {
        let generated: Vec<Migration> = (1..=12)
            .map(|v| {
                Migration::new(
                    v,
                    &format!("{:03}_table_{}.sql", v, v),
                    &format!("CREATE TABLE table_{} (id INT);", v),
                )
            })
            .collect();

        let mut catalogs: Vec<Vec<Migration>> = (0..=3)
            .map(|n| full_catalog().migrations()[..n].to_vec())
            .collect();
        catalogs.push(generated);

        for migrations in catalogs {
            let size = migrations.len();
            let dir = TempDir::new().unwrap();
            let catalog = MigrationCatalog::from_migrations(migrations).unwrap();
            let manager = manager_with(Arc::new(MemoryServer::new()), &dir, catalog);

            let report = manager.onboard("acme", "acme").await.unwrap();
            assert_eq!(report.migration.applied_count(), size);

            let ledger = manager.ledger("acme").await.unwrap();
            let names: Vec<&str> = ledger.iter().map(|e| e.migration_name.as_str()).collect();
            assert_eq!(names, manager.catalog().names(), "catalog of {} migrations", size);
        }
    }

    #[tokio::test]
    async fn test_shipped_catalog_meets_shipped_expectation() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"));
        let catalog = MigrationCatalog::load(&root.join("migrations")).unwrap();
        let expectation = SchemaExpectation::from_file(&root.join("expectations/members.json")).unwrap();
        assert!(!catalog.is_empty());

        let dir = TempDir::new().unwrap();
        let manager = manager_with(Arc::new(MemoryServer::new()), &dir, catalog);
        manager.onboard("acme", "acme").await.unwrap();

        let report = manager.verify("acme", &expectation).await.unwrap();
        assert!(report.passed, "{}", report.error_log());
        assert!(report.violations.is_empty());
    }

    #[tokio::test]
    async fn test_migrate_twice_matches_once() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.onboard("acme", "acme").await.unwrap();

        let ledger_once = manager.ledger("acme").await.unwrap();
        let mut conn = manager.server().connect("tenant_acme").await.unwrap();
        let schema_once = conn.introspect().await.unwrap();

        match manager.migrate("acme", false).await.unwrap() {
            MigrationOutcome::Applied(report) => assert_eq!(report.applied_count(), 0),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(manager.ledger("acme").await.unwrap(), ledger_once);
        assert_eq!(conn.introspect().await.unwrap(), schema_once);
    }

    #[tokio::test]
    async fn test_verify_members_expectation() {
        let dir_full = TempDir::new().unwrap();
        let dir_partial = TempDir::new().unwrap();
        let server = Arc::new(MemoryServer::new());
        let full = manager_with(server.clone(), &dir_full, full_catalog());
        let partial = manager_with(server, &dir_partial, without_tenant_user());

        full.onboard("acme", "acme").await.unwrap();
        partial.onboard("globex", "globex").await.unwrap();

        let passed = full.verify("acme", &members_expectation()).await.unwrap();
        assert!(passed.passed);
        assert!(passed.violations.is_empty());

        let failed = partial.verify("globex", &members_expectation()).await.unwrap();
        assert_eq!(
            failed.violations,
            vec![SchemaViolation::MissingColumn {
                table: "members".to_string(),
                column: "tenant_user_id".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_teardown_of_unprovisioned_tenant_succeeds() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.registry().register("ghost", "ghost").unwrap();

        let report = manager.teardown("ghost").await.unwrap();

        assert_eq!(report.drop_outcome, Some(DropOutcome::NotFound));
        assert!(!manager.registry().is_registered("ghost"));
    }

    #[tokio::test]
    async fn test_teardown_drops_database() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.onboard("acme", "acme").await.unwrap();

        let report = manager.teardown("acme").await.unwrap();

        assert_eq!(report.drop_outcome, Some(DropOutcome::Dropped));
        assert!(!manager.server().database_exists("tenant_acme").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_tenants_are_disjoint() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let (a, b) = tokio::join!(manager.onboard("acme", "acme"), manager.onboard("globex", "globex"));
        assert_ok!(a);
        assert_ok!(b);

        let mut acme = manager.server().connect("tenant_acme").await.unwrap();
        acme.apply(
            &Migration::new(100, "100_acme_only.sql", "CREATE TABLE acme_only (id INT);"),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let mut globex = manager.server().connect("tenant_globex").await.unwrap();
        assert!(!globex.introspect().await.unwrap().has_table("acme_only"));
        assert_eq!(globex.ledger().await.unwrap().len(), 3);

        assert!(manager.verify("acme", &members_expectation()).await.unwrap().passed);
        assert!(manager.verify("globex", &members_expectation()).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_prefix() {
        let dir = TempDir::new().unwrap();
        let mut migrations = full_catalog().migrations().to_vec();
        migrations.push(Migration::new(4, "004_broken.sql", "ALTER TABLE ghosts DROP COLUMN x;"));
        migrations.push(Migration::new(5, "005_after.sql", "CREATE TABLE invitations (id INT);"));
        let catalog = MigrationCatalog::from_migrations(migrations).unwrap();
        let manager = manager_with(Arc::new(MemoryServer::new()), &dir, catalog);

        let err = manager.onboard("acme", "acme").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::MigrationFailed { applied_before: 3, .. }
        ));

        let names: Vec<String> = manager
            .ledger("acme")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.migration_name)
            .collect();
        assert_eq!(
            names,
            vec!["001_members.sql", "002_members_tenant_user.sql", "003_member_roles.sql"]
        );

        let mut conn = manager.server().connect("tenant_acme").await.unwrap();
        assert!(!conn.introspect().await.unwrap().has_table("invitations"));
    }

    #[tokio::test]
    async fn test_same_tenant_operations_are_exclusive() {
        let dir = TempDir::new().unwrap();
        let catalog = MigrationCatalog::from_migrations(vec![Migration::new(
            1,
            "001_slow.sql",
            "SELECT pg_sleep(0.3); CREATE TABLE members (id INT);",
        )])
        .unwrap();
        let manager = manager_with(Arc::new(MemoryServer::new()), &dir, catalog);
        manager.registry().register("acme", "acme").unwrap();
        manager.provision("acme").await.unwrap();

        let (first, second) = tokio::join!(manager.migrate("acme", false), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.migrate("acme", false).await
        });

        assert_ok!(first);
        assert!(matches!(second, Err(GatewayError::MigrationInProgress { .. })));
    }

    #[tokio::test]
    async fn test_inactive_tenant_is_refused() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.onboard("acme", "acme").await.unwrap();
        manager.set_status("acme", TenantStatus::Inactive).unwrap();

        assert!(matches!(
            manager.migrate("acme", false).await,
            Err(GatewayError::TenantInactive { .. })
        ));

        let batch = manager.migrate_all(false).await.unwrap();
        assert!(batch.results.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_applies_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.registry().register("acme", "acme").unwrap();
        manager.provision("acme").await.unwrap();

        match manager.migrate("acme", true).await.unwrap() {
            MigrationOutcome::DryRun(plan) => assert_eq!(plan.pending.len(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(manager.ledger("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_all_stops_on_connection_failure() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MemoryServer::new());
        let manager = manager_with(server.clone(), &dir, full_catalog());
        manager.registry().register("acme", "acme").unwrap();
        manager.registry().register("globex", "globex").unwrap();

        server.set_unreachable(true);
        let batch = manager.migrate_all(false).await.unwrap();

        assert!(batch.aborted);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.failed(), 1);
    }

    #[tokio::test]
    async fn test_migrate_all_continues_past_unprovisioned_tenant() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.registry().register("acme", "acme").unwrap();
        manager.onboard("globex", "globex").await.unwrap();

        let batch = manager.migrate_all(false).await.unwrap();

        assert!(!batch.aborted);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.failed(), 1);
        assert!(batch.results[1].outcome.is_some());
    }
}
