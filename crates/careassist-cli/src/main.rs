use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use careassist_config::{AppConfig, ConfigLoader};
use careassist_db::{IdempotencyRecords, IdempotencyStore};
use careassist_gateway::{AppState, GatewayServer};
use careassist_security::RedactingWriter;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "careassist", version, about = "Chat orchestrator for the healthcare portal")]
struct Cli {
    /// Path to config.yml (defaults to ~/.careassist/config.yml)
    #[arg(short, long, global = true, env = "CAREASSIST_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        /// Override gateway.host
        #[arg(long)]
        host: Option<String>,
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then print a summary
    CheckConfig,
    /// Delete idempotency records older than the retention window
    PurgeIdempotency {
        /// Override idempotency.retention_hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(loader: &ConfigLoader, path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => loader.load_path(path),
        None => loader.load(),
    };
    config.context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_dir(
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        ),
        None => ConfigLoader::new().context("failed to locate config directory")?,
    };
    let mut config = load_config(&loader, cli.config.as_ref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let db_path = loader.resolve_db_path(&config)?;
            info!("using database at {}", db_path.display());
            let state = AppState::open(config, &db_path).context("failed to initialise gateway")?;
            GatewayServer::new(state)
                .run()
                .await
                .context("gateway exited with an error")?;
        }
        Command::CheckConfig => {
            let db_path = loader.resolve_db_path(&config)?;
            let summary = serde_json::json!({
                "listen": format!("{}:{}", config.gateway.host, config.gateway.port),
                "api_key_required": config.gateway.api_key.is_some(),
                "llm": {
                    "provider": config.llm.provider,
                    "model": config.llm.model,
                    "api_key_set": config.llm.api_key.is_some(),
                    "base_url": config.llm.base_url,
                },
                "retry": {
                    "max_retries": config.retry.max_retries,
                    "base_delay_ms": config.retry.base_delay_ms,
                    "max_delay_ms": config.retry.max_delay_ms,
                },
                "budget": {
                    "max_context_tokens": config.budget.max_context_tokens,
                    "response_reserve": config.budget.response_reserve,
                },
                "database": db_path.display().to_string(),
                "subject_grants": config.subjects.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::PurgeIdempotency { older_than_hours } => {
            let db_path = loader.resolve_db_path(&config)?;
            let hours = older_than_hours.unwrap_or(config.idempotency.retention_hours);
            let store = IdempotencyStore::open(&db_path)?;
            let removed = store.purge_expired(Duration::from_secs(hours * 3600))?;
            println!("removed {removed} idempotency record(s) older than {hours}h");
        }
    }

    Ok(())
}
