use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use sqlscout::ai::OpenAiGateway;
use sqlscout::commands::QueryService;
use sqlscout::config::AppConfig;
use sqlscout::db::{ConnectionManager, PgIntrospector, PgRowSource};
use sqlscout::logging;
use sqlscout::server::{self, AppState};
use sqlscout::storage::{AuditLog, AuditSink};

#[derive(Debug, Parser)]
#[command(name = "sqlscout", version, about = "Natural-language to read-only SQL gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "sqlscout.toml")]
    config: PathBuf,
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        AppConfig::from_file(path)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn open_audit_log(config: &AppConfig) -> anyhow::Result<Option<Arc<AuditLog>>> {
    if !config.audit.enabled {
        info!("audit log disabled");
        return Ok(None);
    }
    let log = AuditLog::open(&config.audit.path)?;
    if config.audit.retention_days > 0 {
        let removed = log.prune_older_than(config.audit.retention_days).await?;
        info!(removed, days = config.audit.retention_days, "pruned audit log");
    }
    Ok(Some(Arc::new(log)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    logging::init_logging(&config.logging)?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let connections = Arc::new(ConnectionManager::connect(config.database.clone()).await?);
    let schema = Arc::new(PgIntrospector::new(
        connections.clone(),
        config.database.schema.clone(),
    ));
    let rows = Arc::new(PgRowSource::new(connections));
    let completion = Arc::new(OpenAiGateway::new(config.ai.clone())?);

    let audit_log = open_audit_log(&config).await?;
    let audit_sink = audit_log
        .clone()
        .map(|log| log as Arc<dyn AuditSink>);

    let service = QueryService::new(
        schema,
        completion,
        rows,
        audit_sink,
        config.query.clone(),
        &config.ai.locale,
    );

    let state = AppState {
        service: Arc::new(service),
        audit_log,
    };

    server::serve(
        &config.server.host,
        config.server.port,
        state,
        shutdown_signal(),
    )
    .await
}
