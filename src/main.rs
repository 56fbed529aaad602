mod cache;
mod db;
mod error;
mod extractor;
mod parser;
mod pipeline;
mod server;
mod settings;

use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use crate::cache::{CacheStore, MemoryStore};
use crate::db::Database;
use crate::pipeline::{Orchestrator, RunStatus};
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "company_scraper", about = "Company record scraper with cache-first lookups")]
struct Cli {
    /// SQLite path (overrides SCRAPER_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve POST /scrape/
    Serve {
        /// Listen address (overrides SCRAPER_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Cache-first lookup; on a miss run the pipeline in the foreground
    Scrape {
        idno: String,
        /// Skip the cache and always fetch
        #[arg(long)]
        force: bool,
    },
    /// Print the stored record for an identifier
    Show {
        idno: String,
    },
    /// Snapshot and record counts
    Stats,
}

struct Components {
    orchestrator: Orchestrator,
    store: Arc<MemoryStore>,
}

fn build(settings: &Settings, database: Database) -> anyhow::Result<Components> {
    let fetcher = extractor::from_settings(settings)?;
    let store = Arc::new(MemoryStore::new());
    let cache = CacheStore::new(store.clone(), settings.cache_ttl(), settings.status_ttl());
    let orchestrator = Orchestrator::new(
        fetcher,
        Arc::new(database.clone()),
        Arc::new(database),
        cache,
        settings.max_concurrent_runs,
    );
    Ok(Components {
        orchestrator,
        store,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| settings.bind.clone());
            let database = Database::open(&settings.db_path)?;
            let c = build(&settings, database)?;
            server::serve(&bind, c.orchestrator, c.store).await?;
        }
        Commands::Scrape { idno, force } => {
            let database = Database::open(&settings.db_path)?;
            let c = build(&settings, database)?;
            let mut outcomes = c.orchestrator.subscribe();
            let accepted = c.orchestrator.request(&idno, force).await?;
            if let Some(record) = accepted.record {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }
            let outcome = loop {
                match outcomes.recv().await {
                    Ok(outcome) if outcome.idno == idno => break outcome,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        bail!("pipeline for {} ended without an outcome", idno)
                    }
                }
            };
            tracing::info!(idno = %outcome.idno, finished_at = %outcome.finished_at, "run done");
            match outcome.status {
                RunStatus::Completed => {
                    let record = c.orchestrator.status(&idno).await?.record;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                RunStatus::NoData => println!("Fetched {} but recognised no fields (snapshot kept).", idno),
                RunStatus::HttpStatus(code) => {
                    println!("Fetched {} with HTTP {} (snapshot kept, not parsed).", idno, code)
                }
                RunStatus::Failed(reason) => bail!("scrape of {} failed: {}", idno, reason),
            }
        }
        Commands::Show { idno } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            match db::fetch_record(&conn, &idno)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("No record for {}.", idno),
            }
            println!("Snapshots: {}", db::count_snapshots(&conn, &idno)?);
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Snapshots:   {}", s.snapshots);
            println!("Non-2xx:     {}", s.non_success);
            println!("Identifiers: {}", s.identifiers);
            println!("Records:     {}", s.records);
        }
    }

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }
    Ok(())
}
