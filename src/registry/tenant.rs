//! Tenant Registry
//!
//! One JSON file per tenant under `{data_dir}/tenants/`.

use crate::error::{GatewayError, Result};
use crate::pool::{is_valid_identifier, DatabaseRouter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantStatus::Active => write!(f, "active"),
            TenantStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Tenant metadata stored in `{id}.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    /// Bound at registration and never rewritten
    pub database_name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

pub struct TenantRegistry {
    tenants_dir: PathBuf,
    router: DatabaseRouter,
}

impl TenantRegistry {
    pub fn new(data_dir: &Path, router: DatabaseRouter) -> Self {
        Self {
            tenants_dir: data_dir.join("tenants"),
            router,
        }
    }

    pub fn router(&self) -> &DatabaseRouter {
        &self.router
    }

    fn tenant_path(&self, id: &str) -> PathBuf {
        self.tenants_dir.join(format!("{}.json", id))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        is_valid_tenant_id(id) && self.tenant_path(id).exists()
    }

    /// Register a new tenant and bind its database name
    pub fn register(&self, id: &str, slug: &str) -> Result<Tenant> {
        if !is_valid_tenant_id(id) {
            return Err(GatewayError::InvalidRequest {
                message: format!(
                    "Invalid tenant id: {}. Must be lowercase letters, digits and underscores.",
                    id
                ),
            });
        }
        if !is_valid_slug(slug) {
            return Err(GatewayError::InvalidRequest {
                message: format!("Invalid tenant slug: {}", slug),
            });
        }

        let database_name = self.router.database_name(id);
        if !is_valid_identifier(&database_name) {
            return Err(GatewayError::InvalidRequest {
                message: format!("Tenant id {} yields an invalid database name {}", id, database_name),
            });
        }

        let tenant = Tenant {
            id: id.to_string(),
            slug: slug.to_string(),
            database_name,
            status: TenantStatus::Active,
            created_at: Utc::now(),
        };

        fs::create_dir_all(&self.tenants_dir)?;

        let content = serde_json::to_string_pretty(&tenant)?;

        // Write aside, then hard-link into place: the link fails if the id is
        // taken and never exposes a half-written file
        let tmp = self.tenants_dir.join(format!(
            ".{}.{}.{}.tmp",
            id,
            std::process::id(),
            NEXT_TMP.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = fs::write(&tmp, content) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        let linked = fs::hard_link(&tmp, self.tenant_path(id));
        if let Err(e) = fs::remove_file(&tmp) {
            warn!("Could not remove temporary file {:?}: {}", tmp, e);
        }

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(GatewayError::TenantAlreadyRegistered {
                    tenant_id: id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        info!("Registered tenant: {} -> {}", id, tenant.database_name);
        Ok(tenant)
    }

    pub fn get(&self, id: &str) -> Result<Tenant> {
        let not_found = || GatewayError::TenantNotFound {
            tenant_id: id.to_string(),
        };

        if !is_valid_tenant_id(id) {
            return Err(not_found());
        }

        let content = match fs::read_to_string(self.tenant_path(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| {
            GatewayError::Internal(format!("Failed to parse tenant file for {}: {}", id, e))
        })
    }

    /// All tenants, sorted by id
    pub fn list(&self) -> Result<Vec<Tenant>> {
        if !self.tenants_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tenants = Vec::new();

        for entry in fs::read_dir(&self.tenants_dir)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext != "json").unwrap_or(true) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) if is_valid_tenant_id(id) => tenants.push(self.get(id)?),
                _ => warn!("Skipping {:?}: not a tenant file", path),
            }
        }

        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    /// Change a tenant's status; the database binding is left untouched
    pub fn set_status(&self, id: &str, status: TenantStatus) -> Result<Tenant> {
        let mut tenant = self.get(id)?;
        tenant.status = status;
        self.save(&tenant)?;

        info!("Tenant {} is now {}", id, status);
        Ok(tenant)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        if !self.is_registered(id) {
            return Err(GatewayError::TenantNotFound {
                tenant_id: id.to_string(),
            });
        }

        fs::remove_file(self.tenant_path(id))?;
        info!("Removed tenant: {}", id);
        Ok(())
    }

    fn save(&self, tenant: &Tenant) -> Result<()> {
        let path = self.tenant_path(&tenant.id);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, serde_json::to_string_pretty(tenant)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Ids map one-to-one onto database names, so no leading or trailing `_`
fn is_valid_tenant_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('_')
        && !id.ends_with('_')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
