//! # Itinerary-routing CLI
//!
//! Command-line interface for the itinerary-routing library.
//! Recalculates the routes of an itinerary plan and prints them as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use itinerary_routing::{
    DayKind, DayReport, EngineConfig, MemoryItinerary, MemoryPlaces, PlanFile, RecalcOutcome,
    RecalculationOrchestrator, RouteCache, TravelMode,
};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli;

/// Command-line interface for itinerary-routing
#[derive(Parser)]
#[command(name = "itinerary-routing")]
#[command(about = "Compute and cache day routes for a travel itinerary")]
#[command(long_about = "Routes every day of an itinerary plan through an OSRM-compatible service:
  itinerary-routing plan.json                      # All route days of the first itinerary
  itinerary-routing plan.json --day day-2          # A single day
  itinerary-routing plan.json --cache routes.json  # Reuse and update a route cache

Environment:
  ROUTING_BASE_URL, ROUTING_PROFILE, ROUTING_TIMEOUT_SECS, ROUTING_MAX_RETRIES, ROUTING_MODE")]
#[command(version)]
struct Cli {
    /// JSON plan with itineraries, days and places
    plan: PathBuf,

    /// Itinerary to recalculate (defaults to the first one in the plan)
    #[arg(long)]
    itinerary: Option<String>,

    /// Recalculate only this day
    #[arg(long)]
    day: Option<String>,

    /// Route cache snapshot, loaded if present and written back afterwards
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Travel mode: driving, walking, cycling or transit
    #[arg(long)]
    mode: Option<TravelMode>,

    /// Routing service base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Show which days would be routed without contacting the provider
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    let mut config = EngineConfig::from_env().context("Invalid ROUTING_* environment")?;
    if let Some(url) = &cli.base_url {
        config.provider.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }

    let plan = PlanFile::load(&cli.plan)
        .await
        .with_context(|| format!("Failed to load plan {}", cli.plan.display()))?;
    let itinerary_id = select_itinerary(&plan, cli.itinerary.as_deref())?;
    let days = days_to_route(&plan, &itinerary_id, cli.day.as_deref())?;

    if cli.dry_run {
        eprintln!(
            "[DRY RUN] Would route {} day(s) of '{itinerary_id}' in {} mode via {}",
            days.len(),
            config.mode,
            config.provider.base_url
        );
        for day in &days {
            eprintln!("  {day}");
        }
        return Ok(());
    }

    let cache = match &cli.cache {
        Some(path) if path.exists() => RouteCache::load_from_file(path, config.cache.clone())
            .await
            .with_context(|| format!("Failed to load cache {}", path.display()))?,
        _ => RouteCache::new(config.cache.clone()),
    };
    let cache = Arc::new(cache);
    let shutdown = CancellationToken::new();
    let sweeper = Arc::clone(&cache).spawn_sweeper(config.cache.sweep_interval, shutdown.clone());

    let progress =
        cli::DayProgress::new(days.len() as u64, &format!("Routing itinerary '{itinerary_id}'"));
    let orchestrator = RecalculationOrchestrator::from_config(
        &config,
        Arc::new(MemoryItinerary::from_plan(&plan)),
        Arc::new(MemoryPlaces::from_plan(&plan)),
        Arc::clone(&cache),
    )?
    .with_progress(progress.callback());

    let observer = {
        let progress = progress.clone();
        let mut updates = Box::pin(orchestrator.updates());
        tokio::spawn(async move {
            while let Some(routing) = updates.next().await {
                progress.observe(&routing);
            }
        })
    };

    let reports = match &cli.day {
        Some(day_key) => {
            let outcome = orchestrator.recalculate_day(day_key).await;
            progress.callback()(1, 1);
            vec![DayReport {
                day_key: day_key.clone(),
                outcome,
            }]
        }
        None => orchestrator.recalculate_all(&itinerary_id).await?,
    };
    observer.abort();

    let output: Vec<Value> = reports
        .iter()
        .map(|report| report_json(report, config.mode))
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);

    shutdown.cancel();
    let _ = sweeper.await;

    let metrics = cache.metrics();
    info!(
        "Cache: {} hit(s), {} similar hit(s), {} miss(es), {} route(s) stored",
        metrics.hits,
        metrics.similar_hits,
        metrics.misses,
        cache.len()
    );
    if let Some(path) = &cli.cache {
        cache
            .save_to_file(path)
            .await
            .with_context(|| format!("Failed to save cache {}", path.display()))?;
    }

    let failed = reports
        .iter()
        .filter(|report| matches!(report.outcome, RecalcOutcome::Failed(_)))
        .count();
    if failed > 0 {
        warn!("{failed} day(s) could not be recalculated");
    }

    Ok(())
}

/// Pick the requested itinerary, or the first one in the plan
fn select_itinerary(plan: &PlanFile, requested: Option<&str>) -> Result<String> {
    match requested {
        Some(id) if plan.itineraries.iter().any(|itinerary| itinerary.id == id) => {
            Ok(id.to_string())
        }
        Some(id) => bail!("Itinerary '{id}' not found in plan"),
        None => match plan.itineraries.first() {
            Some(itinerary) => Ok(itinerary.id.clone()),
            None => bail!("Plan contains no itineraries"),
        },
    }
}

/// Keys of the route days that will be recalculated
fn days_to_route(plan: &PlanFile, itinerary_id: &str, day: Option<&str>) -> Result<Vec<String>> {
    let route_days: Vec<String> = plan
        .itineraries
        .iter()
        .filter(|itinerary| itinerary.id == itinerary_id)
        .flat_map(|itinerary| itinerary.days.iter())
        .filter(|plan_day| plan_day.kind == DayKind::Route)
        .map(|plan_day| plan_day.key.clone())
        .collect();

    match day {
        Some(key) if route_days.iter().any(|k| k == key) => Ok(vec![key.to_string()]),
        Some(key) => bail!("Day '{key}' is not a route day of '{itinerary_id}'"),
        None => Ok(route_days),
    }
}

fn report_json(report: &DayReport, mode: TravelMode) -> Value {
    match &report.outcome {
        RecalcOutcome::Completed(routing) => json!({
            "day": report.day_key,
            "status": "completed",
            "failed_legs": routing.failed_legs(),
            "statistics": routing.statistics(mode),
            "routing": routing,
        }),
        RecalcOutcome::AlreadyCalculating => json!({
            "day": report.day_key,
            "status": "already_calculating",
        }),
        RecalcOutcome::Failed(reason) => json!({
            "day": report.day_key,
            "status": "failed",
            "reason": reason,
        }),
    }
}
