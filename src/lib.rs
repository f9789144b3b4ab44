//! # Itinerary-routing Library
//!
//! Computes, caches and maintains travel-day routes against an
//! OSRM-compatible routing provider.
//!
//! ## Features
//!
//! - **Per-leg resilience**: an unroutable leg becomes a placeholder, the day still resolves
//! - **Bounded retries**: HTTP 429 and transient failures are retried with fixed backoff
//! - **Route cache**: per-mode TTLs, near-identical request reuse and JSON snapshots
//! - **Single flight per day**: a day is never computed twice at the same time
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use itinerary_routing::Waypoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let day = vec![
//!         Waypoint::new("Hotel", 10.7769, 106.7009),
//!         Waypoint::new("Market", 10.7725, 106.6980),
//!     ];
//!     let routing = itinerary_routing::route_day("day-1", &day).await?;
//!     println!("{} m in {} s", routing.total_distance_m, routing.total_duration_s);
//!     Ok(())
//! }
//! ```
//!
//! ## Whole Itineraries
//!
//! ```rust,no_run
//! use itinerary_routing::{
//!     EngineConfig, MemoryItinerary, MemoryPlaces, PlanFile, RecalculationOrchestrator,
//!     RouteCache,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plan = PlanFile::load("plan.json").await?;
//!     let config = EngineConfig::from_env()?;
//!     let orchestrator = RecalculationOrchestrator::from_config(
//!         &config,
//!         Arc::new(MemoryItinerary::from_plan(&plan)),
//!         Arc::new(MemoryPlaces::from_plan(&plan)),
//!         Arc::new(RouteCache::new(config.cache.clone())),
//!     )?;
//!     for report in orchestrator.recalculate_all("trip").await? {
//!         println!("{}: {:?}", report.day_key, report.outcome);
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub use crate::core::aggregator::{DayRouteAggregator, RoutingStrategy};
pub use crate::core::cache::{
    CacheMetricsSnapshot, CacheStatus, CachedRoute, PointKey, RouteCache, RouteKey,
};
pub use crate::core::config::{
    CachePolicy, EngineConfig, ProgressCallback, ProviderConfig, RetryPolicy, SchedulePolicy,
};
pub use crate::core::error::{Error, Result};
pub use crate::core::itinerary::{
    DayEntry, DayKind, DayPlan, ItineraryStore, MemoryItinerary, MemoryPlaces, PlaceLookup,
    PlanFile, PlanItinerary,
};
pub use crate::core::model::{
    Coordinates, DayOutcome, DayRouting, Maneuver, RouteSegment, RouteStatistics, TravelMode,
    Waypoint, INSUFFICIENT_WAYPOINTS,
};
pub use crate::core::orchestrator::{DayReport, RecalcOutcome, RecalculationOrchestrator};
pub use crate::core::provider::{OsrmClient, RoutingProvider};
pub use crate::core::resolver::{Resolution, WaypointResolver};
pub use crate::core::state::{DayStateStore, InFlight};

// Internal modules
mod core;

/// Route one day with configuration taken from the environment
///
/// No cache is used; failed legs are reported through the routing's `error`.
pub async fn route_day(day_key: &str, waypoints: &[Waypoint]) -> Result<DayRouting> {
    let config = EngineConfig::from_env()?;
    let client = OsrmClient::new(config.provider.clone(), config.retry.clone())?;
    DayRouteAggregator::new(Arc::new(client), Arc::new(DayStateStore::new()))
        .with_mode(config.mode)
        .with_schedule(&config.schedule)
        .compute_day_routes(day_key, waypoints)
        .await
}

/// Route a single leg with configuration taken from the environment
pub async fn route_leg(from: &Waypoint, to: &Waypoint, mode: TravelMode) -> Result<RouteSegment> {
    let config = EngineConfig::from_env()?;
    let client = OsrmClient::new(config.provider, config.retry)?;
    client.compute_leg(from, to, mode).await
}
