use crate::engine::{LedgerEntry, TenantConnection};
use crate::error::{GatewayError, Result};
use crate::schema::catalog::{Migration, MigrationCatalog};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a successful run against one tenant database
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub database: String,
    pub applied: Vec<String>,
    pub already_applied: usize,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// A ledger row whose checksum no longer matches the catalog script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub migration: String,
    pub recorded: String,
    pub current: String,
}

/// What a run would do, computed without applying anything
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub database: String,
    pub pending: Vec<String>,
    pub already_applied: usize,
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    /// Ledger names absent from the catalog; a real run refuses these
    pub unknown: Vec<String>,
}

impl MigrationPlan {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies pending catalog migrations to one tenant database.
///
/// Each migration is committed together with its ledger row before the next
/// one starts, so an interrupted run leaves the ledger describing exactly
/// what the database contains.
pub struct MigrationRunner {
    timeout: Duration,
}

/// How long past the deadline an engine gets to stop a script on its own
const CANCEL_GRACE: Duration = Duration::from_secs(1);

impl MigrationRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Dry run. Creates the ledger table if missing but applies nothing.
    pub async fn plan<C: TenantConnection>(
        &self,
        conn: &mut C,
        catalog: &MigrationCatalog,
    ) -> Result<MigrationPlan> {
        conn.ensure_ledger().await?;
        let ledger = conn.ledger().await?;

        Ok(MigrationPlan {
            database: conn.database().to_string(),
            pending: catalog.pending(&ledger).iter().map(|m| m.name.clone()).collect(),
            already_applied: ledger.len(),
            checksum_mismatches: checksum_mismatches(catalog, &ledger),
            unknown: catalog.unknown_in(&ledger),
        })
    }

    pub async fn run<C: TenantConnection>(
        &self,
        conn: &mut C,
        catalog: &MigrationCatalog,
    ) -> Result<MigrationReport> {
        let database = conn.database().to_string();

        conn.ensure_ledger().await?;
        let ledger = conn.ledger().await?;
        debug!("Database {} has {} applied migrations", database, ledger.len());

        let unknown = catalog.unknown_in(&ledger);
        if !unknown.is_empty() {
            return Err(GatewayError::LedgerDrift { database, unknown });
        }

        for mismatch in checksum_mismatches(catalog, &ledger) {
            warn!(
                "Migration {} in {} was modified after it was applied (recorded {}, now {})",
                mismatch.migration, database, mismatch.recorded, mismatch.current
            );
        }

        let pending = catalog.pending(&ledger);
        debug!("{} pending migrations for {}", pending.len(), database);

        let mut applied = Vec::with_capacity(pending.len());

        for migration in pending {
            info!("Applying migration: {} to {}", migration.name, database);

            self.apply_one(conn, migration)
                .await
                .map_err(|e| with_progress(e, applied.len()))?;

            info!(
                "Successfully applied migration: {} (checksum: {})",
                migration.name, migration.checksum
            );
            applied.push(migration.name.clone());
        }

        if applied.is_empty() {
            debug!("Database {} is up to date", database);
        } else {
            info!("Applied {} migrations to {}", applied.len(), database);
        }

        Ok(MigrationReport {
            database,
            applied,
            already_applied: ledger.len(),
        })
    }

    async fn apply_one<C: TenantConnection>(&self, conn: &mut C, migration: &Migration) -> Result<()> {
        let database = conn.database().to_string();

        // Engines enforce the deadline themselves; this is the backstop for one that hangs
        let outcome =
            tokio::time::timeout(self.timeout + CANCEL_GRACE, conn.apply(migration, self.timeout)).await;

        match outcome {
            Ok(Err(GatewayError::MigrationTimedOut { .. })) => {
                warn!(
                    "Migration {} in {} exceeded {:?}, rolled back",
                    migration.name, database, self.timeout
                );
                Err(self.timed_out(database, migration))
            }
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Migration {} in {} did not stop after {:?}, cancelling",
                    migration.name, database, self.timeout
                );
                conn.cancel().await;
                Err(self.timed_out(database, migration))
            }
        }
    }

    fn timed_out(&self, database: String, migration: &Migration) -> GatewayError {
        GatewayError::MigrationTimedOut {
            database,
            migration: migration.name.clone(),
            timeout_secs: self.timeout.as_secs(),
        }
    }
}

fn with_progress(err: GatewayError, applied_before: usize) -> GatewayError {
    match err {
        GatewayError::MigrationFailed {
            database,
            migration,
            cause,
            ..
        } => GatewayError::MigrationFailed {
            database,
            migration,
            cause,
            applied_before,
        },
        other => other,
    }
}

fn checksum_mismatches(catalog: &MigrationCatalog, ledger: &[LedgerEntry]) -> Vec<ChecksumMismatch> {
    ledger
        .iter()
        .filter_map(|entry| {
            let current = catalog.get(&entry.migration_name)?;
            (current.checksum != entry.checksum).then(|| ChecksumMismatch {
                migration: entry.migration_name.clone(),
                recorded: entry.checksum.clone(),
                current: current.checksum.clone(),
            })
        })
        .collect()
}
