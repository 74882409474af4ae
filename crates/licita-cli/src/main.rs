use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use licita_core::MonitoringEvent;
use licita_storage::PgOpportunityStore;
use licita_sync::{MonitoringConfig, MonitoringEngine};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "licita")]
#[command(about = "Public procurement monitoring engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every active source's ticker and run until Ctrl-C.
    Run,
    /// Like `run`, plus the HTTP control surface.
    Serve,
    /// Fetch the first page of a source without persisting anything.
    TestSource { id: String },
    /// Run a single cycle for one source right now.
    Cycle { id: String },
    /// Print monitoring stats as JSON.
    Stats,
    /// Apply the Postgres schema.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LICITA_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = MonitoringConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let engine = MonitoringEngine::from_config(config).await?;
            tokio::spawn(log_events(engine.clone()));
            engine.start().await;
            shutdown_signal().await;
            info!("shutting down; waiting for in-flight cycles");
            engine.shutdown().await;
        }
        Commands::Serve => {
            let port = config.web_port;
            let engine = MonitoringEngine::from_config(config).await?;
            tokio::spawn(log_events(engine.clone()));
            engine.start().await;
            licita_web::serve(engine.clone(), port, shutdown_signal()).await?;
            engine.shutdown().await;
        }
        Commands::TestSource { id } => {
            let engine = MonitoringEngine::from_config(config).await?;
            let result = engine.test_source(&id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Cycle { id } => {
            let engine = MonitoringEngine::from_config(config).await?;
            let report = engine.run_cycle(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Stats => {
            let engine = MonitoringEngine::from_config(config).await?;
            let stats = engine.get_monitoring_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgOpportunityStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn log_events(engine: MonitoringEngine) {
    let mut rx = engine.subscribe();
    loop {
        match rx.recv().await {
            Ok(MonitoringEvent::OpportunityFound { opportunity, watch_lists }) => info!(
                source_id = %opportunity.source_id,
                title = %opportunity.title,
                deadline = %opportunity.deadline,
                watch_lists = ?watch_lists,
                "opportunity found"
            ),
            Ok(event) => info!(event = event.name(), "event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
    }
}
