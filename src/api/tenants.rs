use super::AppState;
use crate::engine::{DatabaseServer, LedgerEntry};
use crate::error::Result;
use crate::provisioner::ProvisionOutcome;
use crate::registry::{Tenant, TenantStatus};
use crate::schema::{SchemaExpectation, VerificationReport};
use crate::tenants::TeardownReport;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct OnboardRequest {
    pub id: String,
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: TenantStatus,
}

#[derive(Serialize)]
pub struct ProvisionResponse {
    pub tenant_id: String,
    pub database: String,
    pub outcome: ProvisionOutcome,
}

pub async fn list_tenants<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<Tenant>>> {
    Ok(Json(state.manager.registry().list()?))
}

pub async fn onboard_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<OnboardRequest>,
) -> Result<impl IntoResponse> {
    info!("Onboarding tenant {} ({})", request.id, request.slug);
    let report = state.manager.onboard(&request.id, &request.slug).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

pub async fn get_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Tenant>> {
    Ok(Json(state.manager.registry().get(&id)?))
}

pub async fn provision_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<ProvisionResponse>> {
    let outcome = state.manager.provision(&id).await?;
    let tenant = state.manager.registry().get(&id)?;

    Ok(Json(ProvisionResponse {
        tenant_id: tenant.id,
        database: tenant.database_name,
        outcome,
    }))
}

pub async fn verify_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(expectation): Json<SchemaExpectation>,
) -> Result<Json<VerificationReport>> {
    let report = state.manager.verify(&id, &expectation).await?;
    Ok(Json(report))
}

pub async fn tenant_ledger<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.manager.ledger(&id).await?))
}

pub async fn set_tenant_status<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Tenant>> {
    Ok(Json(state.manager.set_status(&id, request.status)?))
}

pub async fn teardown_tenant<S: DatabaseServer + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<TeardownReport>> {
    Ok(Json(state.manager.teardown(&id).await?))
}
