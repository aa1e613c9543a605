//! Command-line driver for tenant database operations
//!
//! Reads the same environment as the gateway (`.env` honored) and talks to
//! PostgreSQL directly. Results are printed as JSON on stdout; logs go to
//! stderr.
//!
//! Exit codes: 0 success, 1 error, 2 schema violations or failed tenants.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tenantdb_gateway::config::Config;
use tenantdb_gateway::pool::{DatabaseRouter, PoolManager};
use tenantdb_gateway::registry::TenantRegistry;
use tenantdb_gateway::schema::{MigrationCatalog, SchemaExpectation};
use tenantdb_gateway::tenants::{MigrationOutcome, TenantManager};
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tenantdb-migrate")]
#[command(author, version, about = "Provision, migrate and verify tenant databases", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Directory of NNN_name.sql migration files
    #[arg(long, global = true, env = "MIGRATIONS_DIR")]
    migrations_dir: Option<PathBuf>,

    /// Directory holding the tenant registry
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations to one tenant or to every active tenant
    Migrate(MigrateArgs),

    /// Register a tenant, create its database and migrate it
    Onboard(OnboardArgs),

    /// Create the database of a registered tenant
    Provision(TenantArgs),

    /// Check a tenant database against a schema expectation file
    Verify(VerifyArgs),

    /// Drop a tenant database and remove the tenant
    Teardown(TenantArgs),

    /// List registered tenants
    Tenants,

    /// Show the applied migrations of a tenant
    Ledger(TenantArgs),
}

#[derive(Args, Debug)]
struct TenantArgs {
    #[arg(long)]
    tenant: String,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Tenant id
    #[arg(long, required_unless_present = "all", conflicts_with = "all")]
    tenant: Option<String>,

    /// Migrate every active tenant
    #[arg(long)]
    all: bool,

    /// Show pending migrations without applying them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct OnboardArgs {
    #[arg(long)]
    tenant: String,

    #[arg(long)]
    slug: String,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    #[arg(long)]
    tenant: String,

    /// JSON schema expectation
    #[arg(long)]
    expectation: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tenantdb_gateway=info")),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::from_env()?;
    if let Some(dir) = cli.global.migrations_dir {
        config.migrations_dir = dir;
    }
    if let Some(dir) = cli.global.data_dir {
        config.data_dir = dir;
    }

    let catalog = MigrationCatalog::load(&config.migrations_dir)?;
    debug!("Catalog holds {} migrations", catalog.len());

    let registry = TenantRegistry::new(
        &config.data_dir,
        DatabaseRouter::new(&config.tenant_db_prefix),
    );

    let server = Arc::new(PoolManager::new(config.clone()).await?);
    let manager = TenantManager::new(server, registry, catalog, config.migration_timeout);

    match cli.command {
        Commands::Migrate(args) => {
            if args.all {
                let report = manager.migrate_all(args.dry_run).await?;
                print_json(&report)?;
                if report.aborted || report.failed() > 0 {
                    return Ok(ExitCode::from(2));
                }
            } else if let Some(tenant) = args.tenant {
                let outcome = manager.migrate(&tenant, args.dry_run).await?;
                if let MigrationOutcome::DryRun(plan) = &outcome {
                    if !plan.unknown.is_empty() {
                        eprintln!("ledger lists migrations missing from the catalog: {:?}", plan.unknown);
                    }
                }
                print_json(&outcome)?;
            }
        }
        Commands::Onboard(args) => {
            print_json(&manager.onboard(&args.tenant, &args.slug).await?)?;
        }
        Commands::Provision(args) => {
            print_json(&manager.provision(&args.tenant).await?)?;
        }
        Commands::Verify(args) => {
            let expectation = SchemaExpectation::from_file(&args.expectation)?;
            let report = manager.verify(&args.tenant, &expectation).await?;
            print_json(&report)?;
            if !report.passed {
                eprintln!("{}", report.error_log());
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Teardown(args) => {
            print_json(&manager.teardown(&args.tenant).await?)?;
        }
        Commands::Ledger(args) => {
            print_json(&manager.ledger(&args.tenant).await?)?;
        }
        Commands::Tenants => {
            print_json(&manager.registry().list()?)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
