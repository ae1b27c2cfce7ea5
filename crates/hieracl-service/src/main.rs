use std::sync::Arc;

use clap::{CommandFactory, Parser};
use hieracl_core::{AclCache, Sid};
use hieracl_service::cli::{Cli, Command};
use hieracl_service::config::{AppConfig, LogFormat};
use hieracl_service::service::{AclService, StaticPrincipal};
use hieracl_storage::PostgresStore;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer().json();
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().pretty();
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    if let Command::Migrate = command {
        return run_migrate(&config).await;
    }

    let service = connect(&config).await?;
    let result = run_command(&service, &command).await;

    if config.cache.report_stats {
        let report = service.cache_stats();
        tracing::info!(
            entries = report.entries,
            hits = report.hits,
            misses = report.misses,
            "acl cache stats"
        );
    }
    result
}

async fn run_migrate(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("running database migrations");
    let store =
        PostgresStore::connect(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    tracing::info!("migrations completed successfully");
    Ok(())
}

async fn connect(
    config: &AppConfig,
) -> Result<AclService<PostgresStore>, Box<dyn std::error::Error>> {
    let store =
        PostgresStore::connect(&config.database.url, config.database.max_connections).await?;

    let principal = match config.service.principal.as_deref() {
        Some(name) => StaticPrincipal::new(Sid::principal(name)?),
        None => StaticPrincipal::anonymous(),
    };

    Ok(AclService::new(
        Arc::new(store),
        Arc::new(AclCache::new()),
        Arc::new(principal),
        config.to_service_config(),
    ))
}

async fn run_command(
    service: &AclService<PostgresStore>,
    command: &Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Show { .. } => {
            let identity = command.object_identity().ok_or("missing identity")??;
            let acl = service.read_acl_by_id(&identity, &[]).await?;

            let chain = std::iter::once(acl.as_ref()).chain(acl.ancestors());
            for (depth, node) in chain.enumerate() {
                let indent = "  ".repeat(depth);
                println!("{indent}{node}");
                println!("{indent}  inheriting: {}", node.is_entries_inheriting());
                for entry in node.entries() {
                    println!("{indent}  {entry}");
                }
            }
        }
        Command::Children { .. } => {
            let identity = command.object_identity().ok_or("missing identity")??;
            for child in service.find_children(&identity).await? {
                println!("{child}");
            }
        }
        Command::DeleteSid { .. } => {
            let sid = command.sid().ok_or("either --principal or --authority is required")??;
            service.delete_sid(&sid).await?;
            println!("Deleted {sid}");
        }
        Command::Migrate => {}
    }
    Ok(())
}
