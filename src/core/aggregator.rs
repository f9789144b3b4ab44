//! Day route aggregation
//!
//! Walks a day's waypoints pairwise, routes every leg in order and folds the
//! results into a `DayRouting`. A failed leg becomes a placeholder segment so
//! that `segments[i]` always describes `waypoints[i] -> waypoints[i + 1]`.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::{RouteCache, RouteKey};
use crate::core::config::SchedulePolicy;
use crate::core::error::{Error, Result};
use crate::core::model::{DayOutcome, DayRouting, RouteSegment, TravelMode, Waypoint};
use crate::core::provider::RoutingProvider;
use crate::core::state::{DayStateStore, InFlight};

/// How legs are requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    /// One request per leg
    #[default]
    PerLeg,
    /// One request for the whole day, falling back to per-leg routing if it fails
    WholePath,
}

/// Turns waypoint lists into day routings
pub struct DayRouteAggregator {
    provider: Arc<dyn RoutingProvider>,
    cache: Option<Arc<RouteCache>>,
    states: Arc<DayStateStore>,
    mode: TravelMode,
    strategy: RoutingStrategy,
    inter_leg_delay: Duration,
    similarity_radius_m: f64,
}

impl DayRouteAggregator {
    pub fn new(provider: Arc<dyn RoutingProvider>, states: Arc<DayStateStore>) -> Self {
        Self {
            provider,
            cache: None,
            states,
            mode: TravelMode::default(),
            strategy: RoutingStrategy::default(),
            inter_leg_delay: SchedulePolicy::default().inter_leg_delay,
            similarity_radius_m: 0.0,
        }
    }

    pub fn with_cache(mut self, cache: Arc<RouteCache>) -> Self {
        self.similarity_radius_m = cache.policy().similarity_radius_m;
        self.cache = Some(cache);
        self
    }

    pub fn with_mode(mut self, mode: TravelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_schedule(mut self, schedule: &SchedulePolicy) -> Self {
        self.inter_leg_delay = schedule.inter_leg_delay;
        self
    }

    /// Radius for near-identical cache reuse; zero disables it.
    pub fn with_similarity_radius(mut self, radius_m: f64) -> Self {
        self.similarity_radius_m = radius_m;
        self
    }

    pub fn states(&self) -> &Arc<DayStateStore> {
        &self.states
    }

    pub fn mode(&self) -> TravelMode {
        self.mode
    }

    /// Compute the routing for one day.
    ///
    /// Routing failures are folded into the returned value; the only error is
    /// `AlreadyCalculating` when another computation holds `day_key`.
    pub async fn compute_day_routes(
        &self,
        day_key: &str,
        waypoints: &[Waypoint],
    ) -> Result<DayRouting> {
        let flight = self.states.begin(day_key)?;
        let routing = self.route_claimed(&flight, waypoints).await;
        Ok(flight.finish(routing))
    }

    /// Route a day the caller has already claimed.
    ///
    /// The claim stays live so the caller can persist the result before
    /// releasing it with `InFlight::finish`.
    pub async fn route_claimed(&self, flight: &InFlight, waypoints: &[Waypoint]) -> DayRouting {
        let day_key = flight.day_key();
        if waypoints.len() < 2 {
            info!("Day '{day_key}': {} waypoint(s), nothing to route", waypoints.len());
            return DayRouting::insufficient(day_key);
        }

        let mut routing = DayRouting::new(day_key);
        routing.is_calculating = true;

        if self.strategy == RoutingStrategy::WholePath
            && self.route_whole_path(flight, &mut routing, waypoints).await
        {
            return self.complete(routing, 0);
        }

        let total = waypoints.len() - 1;
        let mut skipped = 0;
        let mut previous_used_network = false;
        for (i, pair) in waypoints.windows(2).enumerate() {
            if skipped == 0 && previous_used_network && !self.inter_leg_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.inter_leg_delay) => {}
                    _ = flight.cancellation().cancelled() => {}
                }
            }
            if skipped > 0 || flight.is_cancelled() {
                if skipped == 0 {
                    warn!("Day '{day_key}' cancelled before leg {} of {total}", i + 1);
                }
                skipped += 1;
                let reason = Error::Cancelled(day_key.to_string()).to_string();
                routing.push_segment(RouteSegment::placeholder(&pair[0], &pair[1], reason));
                continue;
            }

            let (segment, used_network) = self.route_leg(&pair[0], &pair[1]).await;
            previous_used_network = used_network;
            routing.push_segment(segment);
            flight.progress(&routing);
        }

        self.complete(routing, skipped)
    }

    /// Try the whole day in one request; `false` means fall back to per-leg routing.
    async fn route_whole_path(
        &self,
        flight: &InFlight,
        routing: &mut DayRouting,
        waypoints: &[Waypoint],
    ) -> bool {
        match self.provider.compute_path(waypoints, self.mode).await {
            Ok(segments) if segments.len() == waypoints.len() - 1 => {
                for (segment, pair) in segments.into_iter().zip(waypoints.windows(2)) {
                    if let Some(cache) = &self.cache {
                        cache.put_leg(&pair[0], &pair[1], self.mode, segment.clone());
                    }
                    routing.push_segment(segment);
                }
                flight.progress(routing);
                true
            }
            Ok(segments) => {
                warn!(
                    "Day '{}': path request returned {} legs for {} waypoints, \
                     routing legs individually",
                    flight.day_key(),
                    segments.len(),
                    waypoints.len()
                );
                false
            }
            Err(e) => {
                warn!(
                    "Day '{}': path request failed ({e}), routing legs individually",
                    flight.day_key()
                );
                false
            }
        }
    }

    /// Route one leg, consulting the cache first. Never fails: errors become placeholders.
    ///
    /// The flag reports whether the provider was contacted.
    async fn route_leg(&self, from: &Waypoint, to: &Waypoint) -> (RouteSegment, bool) {
        let key = RouteKey::for_leg(from, to, self.mode);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                return (hit.segment.relabelled(from, to), false);
            }
            if self.similarity_radius_m > 0.0 {
                if let Some(similar) = cache.find_similar(
                    from.coordinates,
                    to.coordinates,
                    self.mode,
                    self.similarity_radius_m,
                ) {
                    return (similar.segment.relabelled(from, to), false);
                }
            }
            cache.mark_calculating(&key);
        }

        match self.provider.compute_leg(from, to, self.mode).await {
            Ok(segment) => {
                debug!(
                    "Leg {} -> {}: {} m, {} s",
                    from.name, to.name, segment.distance_m, segment.duration_s
                );
                if let Some(cache) = &self.cache {
                    cache.put_leg(from, to, self.mode, segment.clone());
                }
                (segment, true)
            }
            Err(e) => {
                warn!("Leg {} -> {} could not be routed: {e}", from.name, to.name);
                if let Some(cache) = &self.cache {
                    cache.mark_failed(&key);
                }
                let used_network = !matches!(e, Error::InvalidCoordinates { .. });
                (RouteSegment::placeholder(from, to, e.to_string()), used_network)
            }
        }
    }

    fn complete(&self, mut routing: DayRouting, skipped: usize) -> DayRouting {
        routing.is_calculating = false;
        routing.last_updated = Some(Utc::now());
        routing.error = if skipped > 0 {
            Some(cancelled_summary(&routing, skipped))
        } else {
            summarize(&routing)
        };

        info!(
            "Day '{}' routed: {} segment(s), {} m, {} s{}",
            routing.day_key,
            routing.segments.len(),
            routing.total_distance_m,
            routing.total_duration_s,
            routing.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default()
        );
        routing
    }
}

/// Error text for a finished day, `None` when every leg succeeded.
fn summarize(routing: &DayRouting) -> Option<String> {
    match routing.outcome() {
        DayOutcome::Partial { failed, total } => {
            Some(format!("{failed} of {total} legs failed to route"))
        }
        DayOutcome::Failed { total } => Some(format!("all {total} legs failed to route")),
        DayOutcome::Complete | DayOutcome::Insufficient | DayOutcome::Pending => None,
    }
}

/// Error text for a day cut short; legs that failed before the cut are counted apart.
fn cancelled_summary(routing: &DayRouting, skipped: usize) -> String {
    let total = routing.segments.len();
    let failed = routing.failed_legs().saturating_sub(skipped);
    if failed > 0 {
        format!("cancelled: {skipped} of {total} legs not routed, {failed} failed to route")
    } else {
        format!("cancelled: {skipped} of {total} legs not routed")
    }
}
