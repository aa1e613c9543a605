use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Connection failed to {database}: {cause}")]
    ConnectionFailed { database: String, cause: String },

    #[error("Database already exists: {database}")]
    DatabaseAlreadyExists { database: String },

    #[error("Database not found: {database}")]
    DatabaseNotFound { database: String },

    #[error("Migration failed in {database}: {migration} - {cause} ({applied_before} applied before failure)")]
    MigrationFailed {
        database: String,
        migration: String,
        cause: String,
        applied_before: usize,
    },

    #[error("Migration {migration} in {database} exceeded its deadline of {timeout_secs}s")]
    MigrationTimedOut {
        database: String,
        migration: String,
        timeout_secs: u64,
    },

    #[error("Migration already in progress for tenant {tenant_id}")]
    MigrationInProgress { tenant_id: String },

    #[error("Ledger of {database} records migrations unknown to the catalog: {unknown:?}")]
    LedgerDrift {
        database: String,
        unknown: Vec<String>,
    },

    #[error("Invalid migration catalog: {cause}")]
    CatalogInvalid { cause: String },

    #[error("Invalid schema expectation: {cause}")]
    ExpectationInvalid { cause: String },

    #[error("Schema introspection failed for {database}: {cause}")]
    IntrospectionFailed { database: String, cause: String },

    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: String },

    #[error("Tenant already registered: {tenant_id}")]
    TenantAlreadyRegistered { tenant_id: String },

    #[error("Tenant {tenant_id} is inactive")]
    TenantInactive { tenant_id: String },

    #[error("Unauthorized access from IP: {ip}")]
    Unauthorized { ip: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the error is a connection-level failure that must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::ConnectionFailed { .. })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorResponse {
    fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_string(),
            message,
            database: None,
            cause: None,
        }
    }

    fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    fn cause(mut self, cause: &str) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, body) = match &self {
            GatewayError::ConnectionFailed { database, cause } => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("connection_failed", format!("Failed to connect to database '{}'", database))
                    .database(database)
                    .cause(cause),
            ),
            GatewayError::DatabaseAlreadyExists { database } => (
                StatusCode::CONFLICT,
                ErrorResponse::new("database_already_exists", message).database(database),
            ),
            GatewayError::DatabaseNotFound { database } => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("database_not_found", message).database(database),
            ),
            GatewayError::MigrationFailed {
                database,
                migration,
                cause,
                ..
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("migration_failed", format!("Migration {} failed", migration))
                    .database(database)
                    .cause(cause),
            ),
            GatewayError::MigrationTimedOut { database, .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::new("migration_timed_out", message).database(database),
            ),
            GatewayError::MigrationInProgress { .. } => (
                StatusCode::CONFLICT,
                ErrorResponse::new("migration_in_progress", message),
            ),
            GatewayError::LedgerDrift { database, .. } => (
                StatusCode::CONFLICT,
                ErrorResponse::new("ledger_drift", message).database(database),
            ),
            GatewayError::CatalogInvalid { cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("catalog_invalid", "Migration catalog could not be loaded".to_string())
                    .cause(cause),
            ),
            GatewayError::ExpectationInvalid { cause } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("expectation_invalid", "Schema expectation is malformed".to_string())
                    .cause(cause),
            ),
            GatewayError::IntrospectionFailed { database, cause } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("introspection_failed", "Failed to read live schema".to_string())
                    .database(database)
                    .cause(cause),
            ),
            GatewayError::TenantNotFound { .. } => {
                (StatusCode::NOT_FOUND, ErrorResponse::new("tenant_not_found", message))
            }
            GatewayError::TenantAlreadyRegistered { .. } => (
                StatusCode::CONFLICT,
                ErrorResponse::new("tenant_already_registered", message),
            ),
            GatewayError::TenantInactive { .. } => {
                (StatusCode::CONFLICT, ErrorResponse::new("tenant_inactive", message))
            }
            GatewayError::Unauthorized { ip } => (
                StatusCode::FORBIDDEN,
                ErrorResponse::new("unauthorized", format!("Access denied for IP address: {}", ip)),
            ),
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_request", message.clone()),
            ),
            GatewayError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal_error", msg.clone()),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<deadpool_postgres::PoolError> for GatewayError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        GatewayError::Internal(format!("Pool error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
