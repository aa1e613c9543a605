//! HTTP admin API
//!
//! - GET    /health                    - liveness (no IP filter, for load balancers)
//! - GET    /tenants                   - list tenants
//! - POST   /tenants                   - onboard: register, provision, migrate
//! - GET    /tenants/:id               - tenant details
//! - POST   /tenants/:id/provision     - create the tenant database
//! - POST   /tenants/:id/migrate       - apply pending migrations (`{"dry_run": true}` to plan)
//! - POST   /migrate                   - migrate every active tenant
//! - POST   /tenants/:id/verify        - verify against a schema expectation
//! - GET    /tenants/:id/ledger        - applied migrations
//! - PUT    /tenants/:id/status        - activate or deactivate
//! - DELETE /tenants/:id               - teardown (admin token)

mod health;
mod migrate;
mod tenants;

pub use health::health_check;

use crate::engine::DatabaseServer;
use crate::error::{GatewayError, Result};
use crate::security::{require_admin_token, AdminAuth, IpFilterLayer};
use crate::tenants::TenantManager;
use axum::{
    body::Bytes,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared state for all endpoints
pub struct AppState<S: DatabaseServer> {
    pub manager: TenantManager<S>,
    pub start_time: Instant,
}

impl<S: DatabaseServer> AppState<S> {
    pub fn new(manager: TenantManager<S>) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

pub fn router<S: DatabaseServer + 'static>(
    state: Arc<AppState<S>>,
    ip_filter: IpFilterLayer,
    admin: Arc<AdminAuth>,
) -> Router {
    // Only DELETE carries the admin token check
    let teardown = delete(tenants::teardown_tenant::<S>)
        .route_layer(middleware::from_fn_with_state(admin, require_admin_token));

    let tenant_routes = Router::new()
        .route(
            "/tenants",
            get(tenants::list_tenants::<S>).post(tenants::onboard_tenant::<S>),
        )
        .route("/tenants/:id", get(tenants::get_tenant::<S>).merge(teardown))
        .route("/tenants/:id/provision", post(tenants::provision_tenant::<S>))
        .route("/tenants/:id/migrate", post(migrate::migrate_tenant::<S>))
        .route("/migrate", post(migrate::migrate_all::<S>))
        .route("/tenants/:id/verify", post(tenants::verify_tenant::<S>))
        .route("/tenants/:id/ledger", get(tenants::tenant_ledger::<S>))
        .route("/tenants/:id/status", put(tenants::set_tenant_status::<S>))
        .layer(ip_filter);

    Router::new()
        .route("/health", get(health_check::<S>))
        .merge(tenant_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parse an optional JSON body; an empty body yields the default
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest {
        message: format!("Invalid JSON body: {}", e),
    })
}
