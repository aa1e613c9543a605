use super::AppState;
use crate::engine::{DatabaseServer, PoolStats};
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    engine: &'static str,
    database_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pools: Option<PoolStats>,
    catalog_size: usize,
    uptime_seconds: u64,
}

pub async fn health_check<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let server = state.manager.server();
    let database_connected = server.ping().await.is_ok();

    Json(HealthResponse {
        status: if database_connected {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        engine: server.engine_name(),
        database_connected,
        pools: server.pool_stats(),
        catalog_size: state.manager.catalog().len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
