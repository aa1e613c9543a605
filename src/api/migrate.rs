use super::{optional_json, AppState};
use crate::engine::DatabaseServer;
use crate::error::Result;
use crate::tenants::{BatchMigrationReport, MigrationOutcome};
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Body is optional; `{}` or no body means a real run
#[derive(Debug, Default, Deserialize)]
pub struct MigrateRequest {
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn migrate_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<MigrationOutcome>> {
    let request: MigrateRequest = optional_json(&body)?;
    info!("Migrate request for tenant {} (dry run: {})", id, request.dry_run);

    Ok(Json(state.manager.migrate(&id, request.dry_run).await?))
}

pub async fn migrate_all<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<BatchMigrationReport>> {
    let request: MigrateRequest = optional_json(&body)?;
    info!("Migrate request for all tenants (dry run: {})", request.dry_run);

    let report = state.manager.migrate_all(request.dry_run).await?;
    info!(
        "Batch migration finished: {} tenants, {} failed{}",
        report.results.len(),
        report.failed(),
        if report.aborted { ", aborted" } else { "" }
    );

    Ok(Json(report))
}
