//! # Candidate Intake Entry Point
//!
//! `intake serve` runs the operator API (and the dispatch loop), `intake dispatch` runs a
//! single tick and prints its statistics, `intake migrate` applies pending migrations.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use intake::{
    config::ConfigLoader,
    db,
    pipeline::Pipeline,
    server::run_server,
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "intake", version, about = "Spreadsheet intake pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the operator API
    Serve,
    /// Run one dispatcher tick
    Dispatch {
        /// Override the number of jobs fetched
        #[arg(long)]
        max_jobs: Option<u64>,
    },
    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    init_tracing(&config).context("initializing telemetry")?;
    tracing::debug!(config = %config.redacted_json().unwrap_or_default(), "Configuration loaded");

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => db::run_migrations(&db).await,
        Command::Dispatch { max_jobs } => {
            db::run_migrations(&db).await?;
            let pipeline = Pipeline::from_config(db, &config).context("building pipeline")?;
            let mut options = pipeline.default_options();
            if let Some(max_jobs) = max_jobs {
                options.max_jobs = max_jobs;
            }
            let stats = pipeline.run_dispatcher(options).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Serve => {
            db::run_migrations(&db).await?;
            let pipeline =
                Pipeline::from_config(db.clone(), &config).context("building pipeline")?;
            run_server(config, db, pipeline)
                .await
                .map_err(|err| anyhow!("server failed: {err}"))
        }
    }
}
