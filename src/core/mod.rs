//! Core library modules for itinerary-routing
//!
//! The routing engine: data model, provider client, aggregation, caching,
//! per-day state and orchestration.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod itinerary;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod state;

// Re-export main types for internal use
pub use aggregator::{DayRouteAggregator, RoutingStrategy};
pub use cache::{CacheStatus, CachedRoute, RouteCache, RouteKey};
pub use config::EngineConfig;
pub use orchestrator::{RecalcOutcome, RecalculationOrchestrator};
