use std::net::SocketAddr;
use std::sync::Arc;
use tenantdb_gateway::api::{self, AppState};
use tenantdb_gateway::config::Config;
use tenantdb_gateway::pool::{DatabaseRouter, PoolManager};
use tenantdb_gateway::registry::TenantRegistry;
use tenantdb_gateway::schema::MigrationCatalog;
use tenantdb_gateway::security::{AdminAuth, IpFilterLayer};
use tenantdb_gateway::tenants::TenantManager;
use tokio::signal;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());

    std::fs::create_dir_all(&log_dir).unwrap_or_else(|e| {
        eprintln!("Warning: Could not create log directory {}: {}", log_dir, e);
    });

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "tenantdb-gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tenantdb_gateway=debug")),
        )
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        // JSON file output for log shipping
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(non_blocking),
        )
        .init();

    debug!("Logging initialized - log directory: {}", log_dir);

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file found or error loading it: {}", e);
    }

    let config = Config::from_env()?;
    let socket_addr = config.socket_addr()?;

    info!("Starting TenantDB Gateway on {}", socket_addr);
    info!("Max connections per pool: {}", config.max_connections_per_pool);
    info!("Max total connections: {}", config.max_total_connections);
    info!("Pool idle timeout: {:?}", config.pool_idle_timeout);
    info!("Migration timeout: {:?}", config.migration_timeout);
    info!("Allowed networks: {:?}", config.allowed_networks);

    let catalog = MigrationCatalog::load(&config.migrations_dir)?;
    info!(
        "Loaded {} migrations from {:?}",
        catalog.len(),
        config.migrations_dir
    );

    let pool_manager = Arc::new(PoolManager::new(config.clone()).await?);
    let registry = TenantRegistry::new(
        &config.data_dir,
        DatabaseRouter::new(&config.tenant_db_prefix),
    );
    let manager = TenantManager::new(
        pool_manager.clone(),
        registry,
        catalog,
        config.migration_timeout,
    );

    let admin = Arc::new(AdminAuth::new(config.admin_token.clone()));
    if !admin.is_enabled() {
        warn!("ADMIN_TOKEN not set; DELETE /tenants/:id is disabled");
    }

    let app = api::router(
        Arc::new(AppState::new(manager)),
        IpFilterLayer::new(config.allowed_networks.clone()),
        admin,
    );

    // Idle pool cleanup
    let cleanup_pool_manager = pool_manager.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;
            let removed = cleanup_pool_manager.cleanup_idle_pools();
            if removed > 0 {
                info!("Cleanup task removed {} idle pools", removed);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&socket_addr).await?;
    info!("Server listening on {}", socket_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
