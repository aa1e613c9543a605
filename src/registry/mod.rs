mod tenant;

pub use tenant::{Tenant, TenantRegistry, TenantStatus};
