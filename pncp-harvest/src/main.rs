//! pncp-harvest - procurement tender harvesting service
//!
//! Discovers procurement notices in a query window, narrows them through
//! the staged filter pipeline, and persists the confirmed subset. Reads
//! `harvest.toml` from the working directory (defaults apply when absent).

use anyhow::Result;
use pncp_harvest::cache::TieredCache;
use pncp_harvest::client::HttpTransport;
use pncp_harvest::events::EventBus;
use pncp_harvest::rules::RuleTable;
use pncp_harvest::HarvestPipeline;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_PATH: &str = "harvest.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting pncp-harvest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Configuration (missing file falls back to defaults)
    let config = pncp_common::config::load_config(Path::new(CONFIG_PATH))?;

    // Step 2: Open or create the store
    let pool = pncp_common::db::init_database(&config.db_path).await?;
    info!("Database connection established");

    // Step 3: Verdict cache - load snapshot, seed known organizations
    let cache = Arc::new(TieredCache::load(&config.cache_path, config.cache_ttl_days));
    cache.seed_known_organizations();

    // Step 4: Rule table (shipped medical rule set)
    let rules = RuleTable::builtin();
    info!(version = rules.version, "Relevance rule table loaded");

    // Step 5: Assemble the pipeline
    let events = EventBus::new(128);
    let cache_path = config.cache_path.clone();
    let transport = HttpTransport::new(config.api_base_url.clone());
    let pipeline = HarvestPipeline::new(
        transport,
        config,
        pool,
        Arc::clone(&cache),
        rules,
        events.sender(),
    );

    // Ctrl-C cancels between stages; the in-flight stage drains first
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, run will stop at the next stage barrier");
            signal_cancel.cancel();
        }
    });

    // Step 6: Run
    let outcome = pipeline.run(cancel).await?;

    // Step 7: Checkpoint the verdict cache for the next run
    cache.checkpoint(&cache_path)?;

    // Summary
    for stage in &outcome.metrics.stages {
        info!(
            stage = stage.stage.label(),
            input = stage.input,
            output = stage.output,
            api_calls = stage.api_calls,
            duration_ms = stage.duration.as_millis() as u64,
            "Stage summary"
        );
    }
    info!(
        run_id = %outcome.run_id,
        confirmed = outcome.confirmed.len(),
        failed = outcome.failed.len(),
        total_api_calls = outcome.metrics.total_api_calls(),
        efficiency = format!("{:.3}", outcome.metrics.efficiency()),
        "Harvest summary"
    );
    for shortfall in &outcome.shortfalls {
        warn!(
            modality = shortfall.modality,
            page = shortfall.page,
            kind = %shortfall.kind,
            "Shortfall: discovery page could not be retrieved"
        );
    }
    if let Some(reason) = &outcome.aborted {
        warn!(%reason, "Run ended early; results above are partial");
    }

    Ok(())
}
