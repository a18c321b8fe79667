//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to the service
//! components: database init, catalog load, the crawl loop, the API
//! server and one-off checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::analysis::{self, read_catalog_file, Analyser};
use crate::config::Settings;
use crate::crawl::Scheduler;
use crate::queue::WorkQueue;
use crate::repository::{run_migrations, MirrorRepository};
use crate::server::{self, AppState};
use crate::webhook::WebhookSender;

#[derive(Parser)]
#[command(name = "freshet")]
#[command(about = "Resource availability crawler and change detection for data catalogs")]
#[command(version)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Load a catalog dump (CSV with dataset_id, resource_id, url)
    Load {
        /// Path to the catalog file
        file: PathBuf,
    },

    /// Run the crawl loop and analysis workers until interrupted
    Crawl,

    /// Serve the HTTP API
    Serve {
        /// Bind address: port, host, or host:port
        #[arg(short, long, default_value = "0.0.0.0:8000")]
        bind: String,
    },

    /// Probe one resource immediately and print the resulting check
    Check {
        /// Resource UUID from the catalog
        resource_id: Uuid,
    },
}

/// Built service components sharing one queue and one database.
struct Components {
    state: AppState,
    analyser: Arc<Analyser>,
    queue: Arc<WorkQueue>,
}

fn build_components(settings: Arc<Settings>) -> anyhow::Result<Components> {
    let queue = Arc::new(WorkQueue::new(
        Duration::from_secs(settings.queue.visibility_secs),
        settings.queue.max_attempts,
    ));
    let state = AppState::new(settings.clone(), queue.clone())?;
    let mirror = Arc::new(MirrorRepository::new(&settings.database_path)?);
    let webhook = Arc::new(WebhookSender::new(
        settings.webhook_url.clone(),
        &settings.crawl.user_agent,
    )?);
    let analyser = Arc::new(Analyser::new(
        state.catalog.clone(),
        state.checks.clone(),
        state.exceptions.clone(),
        mirror,
        queue.clone(),
        webhook,
        state.crawler.policy.clone(),
        settings,
    )?);
    Ok(Components {
        state,
        analyser,
        queue,
    })
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Arc::new(Settings::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Init => cmd_init(&settings),
        Commands::Load { file } => cmd_load(&settings, &file),
        Commands::Crawl => cmd_crawl(settings).await,
        Commands::Serve { bind } => cmd_serve(settings, &bind).await,
        Commands::Check { resource_id } => cmd_check(settings, resource_id).await,
    }
}

fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    let tables = run_migrations(&settings.database_path)?;
    println!(
        "Database ready at {} ({} tables)",
        settings.database_path.display(),
        tables.len()
    );
    Ok(())
}

fn cmd_load(settings: &Settings, file: &std::path::Path) -> anyhow::Result<()> {
    run_migrations(&settings.database_path)?;
    let catalog = crate::repository::CatalogRepository::new(&settings.database_path)?;
    let entries = read_catalog_file(file)?;
    let inserted = catalog.insert_many(&entries)?;
    println!(
        "Loaded {} new resources ({} listed in {})",
        inserted,
        entries.len(),
        file.display()
    );
    Ok(())
}

async fn cmd_crawl(settings: Arc<Settings>) -> anyhow::Result<()> {
    run_migrations(&settings.database_path)?;
    let components = build_components(settings.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = analysis::spawn_workers(
        components.analyser.clone(),
        settings.analysis.workers,
        shutdown_rx.clone(),
    );
    let scheduler = Scheduler::new(
        components.state.crawler.clone(),
        settings.crawl.pool_size,
        Duration::from_secs(settings.crawl.idle_sleep_secs),
        shutdown_rx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    info!("Crawler running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    scheduler_handle.await??;
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn cmd_serve(settings: Arc<Settings>, bind: &str) -> anyhow::Result<()> {
    run_migrations(&settings.database_path)?;
    let components = build_components(settings.clone())?;

    // the on-demand check endpoint enqueues analysis work
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _workers = analysis::spawn_workers(
        components.analyser.clone(),
        settings.analysis.workers,
        shutdown_rx,
    );

    let (host, port) = parse_bind_address(bind)?;
    server::serve(components.state, &host, port).await
}

async fn cmd_check(settings: Arc<Settings>, resource_id: Uuid) -> anyhow::Result<()> {
    run_migrations(&settings.database_path)?;
    let components = build_components(settings)?;

    let resource = components
        .state
        .catalog
        .get(resource_id)?
        .ok_or_else(|| anyhow::anyhow!("resource {} not found in catalog", resource_id))?;
    if !components.state.catalog.claim_for_probe(resource_id)? {
        anyhow::bail!("resource {} is already being processed", resource_id);
    }

    let check = components
        .state
        .crawler
        .probe_resource(&resource, true)
        .await?;

    // drain the follow-up jobs (analysis, webhook, CSV) inline
    while let Some(job) = components.queue.try_pop() {
        match components.analyser.handle(&job.kind).await {
            Ok(()) => components.queue.ack(job.id),
            Err(e) => {
                tracing::warn!("Job {} failed: {}", job.id, e);
                components.queue.nack(job.id);
            }
        }
    }

    let latest = components
        .state
        .checks
        .get(check.id)?
        .unwrap_or(check);
    println!("{}", serde_json::to_string_pretty(&latest.to_api_json(false))?);
    Ok(())
}

/// Parse a bind address that can be:
/// - Just a port: "8000" -> 0.0.0.0:8000
/// - Just a host: "127.0.0.1" -> 127.0.0.1:8000
/// - Host and port: "0.0.0.0:8000" -> 0.0.0.0:8000
fn parse_bind_address(bind: &str) -> anyhow::Result<(String, u16)> {
    if let Ok(port) = bind.parse::<u16>() {
        return Ok(("0.0.0.0".to_string(), port));
    }
    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }
    Ok((bind.to_string(), 8000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(
            parse_bind_address("8000").unwrap(),
            ("0.0.0.0".to_string(), 8000)
        );
        assert_eq!(
            parse_bind_address("127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            parse_bind_address("localhost").unwrap(),
            ("localhost".to_string(), 8000)
        );
    }
}
