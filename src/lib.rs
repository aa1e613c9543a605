//! TenantDB Gateway Library
//!
//! Tenant-isolated PostgreSQL management: every tenant owns a physically
//! separate database, provisioned on onboarding, migrated from a shared
//! versioned catalog with a per-tenant ledger, and verified against a
//! declarative schema expectation.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod provisioner;
pub mod registry;
pub mod schema;
pub mod security;
pub mod tenants;

pub use error::{GatewayError, Result};
