//! Database Provisioner
//!
//! Creates and destroys the physical database behind each tenant. "Already
//! exists" on create and "not found" on drop are outcomes, not errors.

use crate::engine::DatabaseServer;
use crate::error::{GatewayError, Result};
use crate::pool::is_valid_identifier;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropOutcome {
    Dropped,
    NotFound,
}

pub struct Provisioner<S: DatabaseServer> {
    server: Arc<S>,
}

impl<S: DatabaseServer> Provisioner<S> {
    pub fn new(server: Arc<S>) -> Self {
        Self { server }
    }

    pub async fn create_database(&self, db_name: &str) -> Result<ProvisionOutcome> {
        ensure_identifier(db_name)?;

        match self.server.create_database(db_name).await {
            Ok(()) => {
                info!("Provisioned database {}", db_name);
                Ok(ProvisionOutcome::Created)
            }
            Err(GatewayError::DatabaseAlreadyExists { .. }) => {
                info!("Database {} already exists", db_name);
                Ok(ProvisionOutcome::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_database(&self, db_name: &str) -> Result<DropOutcome> {
        ensure_identifier(db_name)?;

        match self.server.drop_database(db_name).await {
            Ok(()) => {
                info!("Dropped database {}", db_name);
                Ok(DropOutcome::Dropped)
            }
            Err(GatewayError::DatabaseNotFound { .. }) => {
                info!("Database {} does not exist, nothing to drop", db_name);
                Ok(DropOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort drop for cleanup paths; never fails
    pub async fn teardown(&self, db_name: &str) -> Option<DropOutcome> {
        match self.drop_database(db_name).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Teardown of database {} failed: {}", db_name, e);
                None
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryServer;

    fn provisioner() -> (Arc<MemoryServer>, Provisioner<MemoryServer>) {
        let server = Arc::new(MemoryServer::new());
        (server.clone(), Provisioner::new(server))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_, provisioner) = provisioner();

        assert_eq!(
            provisioner.create_database("tenant_acme").await.unwrap(),
            ProvisionOutcome::Created
        );
        assert_eq!(
            provisioner.create_database("tenant_acme").await.unwrap(),
            ProvisionOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_drop_nonexistent_is_benign() {
        let (_, provisioner) = provisioner();

        assert_eq!(
            provisioner.drop_database("tenant_ghost").await.unwrap(),
            DropOutcome::NotFound
        );

        provisioner.create_database("tenant_acme").await.unwrap();
        assert_eq!(
            provisioner.drop_database("tenant_acme").await.unwrap(),
            DropOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_reported() {
        let (server, provisioner) = provisioner();
        server.set_unreachable(true);

        let err = provisioner.create_database("tenant_acme").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_teardown_swallows_errors() {
        let (server, provisioner) = provisioner();
        server.set_unreachable(true);

        assert_eq!(provisioner.teardown("tenant_acme").await, None);
        assert_eq!(provisioner.teardown("bad name; --").await, None);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let (_, provisioner) = provisioner();

        assert!(matches!(
            provisioner.create_database("tenant\"; DROP DATABASE x").await,
            Err(GatewayError::InvalidRequest { .. })
        ));
    }
}
