//! Recalculation orchestration
//!
//! Decides when days are recomputed and in what order: one day on demand,
//! every route day of an itinerary in sequence, or a single day after its
//! waypoints change and the edit has settled.

use futures::stream::{self, Stream};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::aggregator::DayRouteAggregator;
use crate::core::cache::RouteCache;
use crate::core::config::{EngineConfig, ProgressCallback, SchedulePolicy};
use crate::core::error::{Error, Result};
use crate::core::itinerary::{DayKind, ItineraryStore, PlaceLookup};
use crate::core::model::DayRouting;
use crate::core::provider::OsrmClient;
use crate::core::resolver::WaypointResolver;
use crate::core::state::DayStateStore;

/// Result of asking for one day to be recomputed
#[derive(Debug, Clone, PartialEq)]
pub enum RecalcOutcome {
    /// The day resolved; its `error` field tells success from partial or total failure
    Completed(DayRouting),
    /// A computation for the day was already in flight; nothing was started
    AlreadyCalculating,
    /// The day's entries could not be read or its routing could not be stored
    Failed(String),
}

/// One line of an itinerary-wide recalculation
#[derive(Debug, Clone, PartialEq)]
pub struct DayReport {
    pub day_key: String,
    pub outcome: RecalcOutcome,
}

pub struct RecalculationOrchestrator {
    aggregator: DayRouteAggregator,
    resolver: WaypointResolver,
    itinerary: Arc<dyn ItineraryStore>,
    schedule: SchedulePolicy,
    progress: Option<ProgressCallback>,
    /// Latest change notification per day, for debouncing
    generations: Mutex<HashMap<String, u64>>,
}

impl RecalculationOrchestrator {
    pub fn new(
        aggregator: DayRouteAggregator,
        resolver: WaypointResolver,
        itinerary: Arc<dyn ItineraryStore>,
    ) -> Self {
        Self {
            aggregator,
            resolver,
            itinerary,
            schedule: SchedulePolicy::default(),
            progress: None,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Wire an OSRM-backed engine from configuration.
    pub fn from_config(
        config: &EngineConfig,
        itinerary: Arc<dyn ItineraryStore>,
        places: Arc<dyn PlaceLookup>,
        cache: Arc<RouteCache>,
    ) -> Result<Self> {
        let client = OsrmClient::new(config.provider.clone(), config.retry.clone())?;
        let aggregator = DayRouteAggregator::new(Arc::new(client), Arc::new(DayStateStore::new()))
            .with_cache(cache)
            .with_mode(config.mode)
            .with_schedule(&config.schedule);

        Ok(Self::new(aggregator, WaypointResolver::new(places), itinerary)
            .with_schedule(config.schedule.clone()))
    }

    pub fn with_schedule(mut self, schedule: SchedulePolicy) -> Self {
        self.schedule = schedule;
        self
    }

    /// Called with (days finished, route days total) during `recalculate_all`.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn aggregator(&self) -> &DayRouteAggregator {
        &self.aggregator
    }

    /// Recompute one day from its current entries and store the result.
    ///
    /// The day is claimed before its entries are read and released only
    /// after the routing is stored.
    pub async fn recalculate_day(&self, day_key: &str) -> RecalcOutcome {
        let flight = match self.aggregator.states().begin(day_key) {
            Ok(flight) => flight,
            Err(e) => {
                debug!("Day '{day_key}' not recalculated: {e}");
                return RecalcOutcome::AlreadyCalculating;
            }
        };

        let entries = match self.itinerary.day_entries(day_key).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not load entries for day '{day_key}': {e}");
                flight.abandon(e.to_string());
                return RecalcOutcome::Failed(e.to_string());
            }
        };

        let waypoints = match self.resolver.resolve(&entries).await {
            Ok(resolution) => resolution.waypoints,
            // Routed as an insufficient day
            Err(Error::InsufficientWaypoints { .. }) => Vec::new(),
            Err(e) => {
                flight.abandon(e.to_string());
                return RecalcOutcome::Failed(e.to_string());
            }
        };

        let routing = self.aggregator.route_claimed(&flight, &waypoints).await;
        if let Err(e) = self.itinerary.store_routing(day_key, &routing).await {
            warn!("Could not store routing for day '{day_key}': {e}");
            flight.finish(routing);
            return RecalcOutcome::Failed(e.to_string());
        }
        RecalcOutcome::Completed(flight.finish(routing))
    }

    /// Recompute every route day of an itinerary, one after the other.
    ///
    /// Day N+1 starts only after day N resolved and the inter-day delay passed.
    pub async fn recalculate_all(&self, itinerary_id: &str) -> Result<Vec<DayReport>> {
        let days: Vec<_> = self
            .itinerary
            .days(itinerary_id)
            .await?
            .into_iter()
            .filter(|day| day.kind == DayKind::Route)
            .collect();
        let total = days.len() as u64;
        info!("Recalculating {total} route day(s) of itinerary '{itinerary_id}'");

        let mut reports = Vec::with_capacity(days.len());
        for (i, day) in days.into_iter().enumerate() {
            if i > 0 && !self.schedule.inter_day_delay.is_zero() {
                tokio::time::sleep(self.schedule.inter_day_delay).await;
            }

            let outcome = self.recalculate_day(&day.key).await;
            reports.push(DayReport {
                day_key: day.key,
                outcome,
            });

            if let Some(progress) = &self.progress {
                progress(i as u64 + 1, total);
            }
        }

        Ok(reports)
    }

    /// Stop the day's computation before its next leg.
    pub fn cancel_day(&self, day_key: &str) -> bool {
        let cancelled = self.aggregator.states().cancel(day_key);
        if cancelled {
            info!("Cancellation requested for day '{day_key}'");
        }
        cancelled
    }

    pub fn day_state(&self, day_key: &str) -> Option<DayRouting> {
        self.aggregator.states().get(day_key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DayRouting> {
        self.aggregator.states().subscribe()
    }

    /// Every published day snapshot as a stream; ends when the state store goes away.
    pub fn updates(&self) -> impl Stream<Item = DayRouting> + Send + 'static {
        stream::unfold(self.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(routing) => return Some((routing, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Update stream skipped {skipped} snapshot(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.generations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, day_key: &str, generation: u64) -> bool {
        self.generations().get(day_key) == Some(&generation)
    }

    /// Schedule a recomputation after a waypoint was added to or removed from a day.
    ///
    /// Notifications arriving within `settle_delay` of each other collapse into
    /// one recomputation; superseded tasks resolve to `None`. A change that
    /// lands while the day is calculating waits for it and then recomputes.
    pub fn notify_waypoints_changed(
        self: &Arc<Self>,
        day_key: &str,
    ) -> JoinHandle<Option<RecalcOutcome>> {
        let generation = {
            let mut generations = self.generations();
            let counter = generations.entry(day_key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let this = Arc::clone(self);
        let day_key = day_key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.schedule.settle_delay).await;

            loop {
                if !this.is_current(&day_key, generation) {
                    debug!("Change #{generation} for day '{day_key}' superseded");
                    return None;
                }
                match this.recalculate_day(&day_key).await {
                    RecalcOutcome::AlreadyCalculating => {
                        this.aggregator.states().wait_idle(&day_key).await
                    }
                    outcome => return Some(outcome),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::itinerary::{DayEntry, DayPlan, MemoryItinerary, MemoryPlaces};
    use crate::core::model::Coordinates;
    use crate::core::provider::testing::ScriptedProvider;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};
    use tokio_test::assert_ok;

    fn route_day(key: &str, entries: Vec<DayEntry>) -> DayPlan {
        DayPlan {
            key: key.to_string(),
            kind: DayKind::Route,
            entries,
        }
    }

    fn three_stops() -> Vec<DayEntry> {
        vec![
            DayEntry::at("A", 10.0, 106.0),
            DayEntry::place("B", "b"),
            DayEntry::at("C", 10.02, 106.02),
        ]
    }

    fn provider() -> ScriptedProvider {
        ScriptedProvider::new().route("A", "B", 1000, 120).route("B", "C", 1500, 180)
    }

    struct Fixture {
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryItinerary>,
        orchestrator: Arc<RecalculationOrchestrator>,
    }

    fn fixture(
        provider: ScriptedProvider,
        days: Vec<DayPlan>,
        schedule: SchedulePolicy,
    ) -> Fixture {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryItinerary::new());
        store.insert_itinerary("trip", days);
        let places = MemoryPlaces::new();
        places.insert("b", Coordinates::new(10.01, 106.01));

        let aggregator = DayRouteAggregator::new(provider.clone(), Arc::new(DayStateStore::new()))
            .with_schedule(&schedule);
        let resolver = WaypointResolver::new(Arc::new(places));
        let orchestrator = RecalculationOrchestrator::new(aggregator, resolver, store.clone())
            .with_schedule(schedule);

        Fixture {
            provider,
            store,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn completed(outcome: RecalcOutcome) -> DayRouting {
        match outcome {
            RecalcOutcome::Completed(routing) => routing,
            other => panic!("Expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recalculate_day_stores_routing() {
        let f = fixture(
            provider(),
            vec![route_day("day-1", three_stops())],
            SchedulePolicy::immediate(),
        );

        let routing = completed(f.orchestrator.recalculate_day("day-1").await);
        assert_eq!(routing.total_distance_m, 2500);
        assert_eq!(routing.total_duration_s, 300);
        assert_eq!(routing.error, None);
        assert_eq!(f.store.routing("day-1"), Some(routing.clone()));
        assert_eq!(f.orchestrator.day_state("day-1"), Some(routing));
    }

    #[tokio::test]
    async fn test_day_with_one_stop_is_insufficient() {
        let f = fixture(
            provider(),
            vec![route_day(
                "day-1",
                vec![DayEntry::at("A", 10.0, 106.0), DayEntry::place("Gone", "gone")],
            )],
            SchedulePolicy::immediate(),
        );

        let routing = completed(f.orchestrator.recalculate_day("day-1").await);
        assert!(routing.segments.is_empty());
        assert_eq!(routing.error.as_deref(), Some("insufficient waypoints"));
        assert!(f.provider.calls().is_empty());
        assert!(f.store.routing("day-1").is_some());
    }

    #[tokio::test]
    async fn test_unknown_day_fails() {
        let f = fixture(provider(), Vec::new(), SchedulePolicy::immediate());
        assert!(matches!(
            f.orchestrator.recalculate_day("day-9").await,
            RecalcOutcome::Failed(_)
        ));
        let state = f.orchestrator.day_state("day-9").unwrap();
        assert!(!state.is_calculating);
        assert!(state.error.is_some());
    }

    /// Place lookup that takes a while to answer
    struct SlowPlaces {
        places: MemoryPlaces,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl PlaceLookup for SlowPlaces {
        async fn lookup_coordinates(&self, place_id: &str) -> Result<Coordinates> {
            tokio::time::sleep(self.delay).await;
            self.places.lookup_coordinates(place_id).await
        }
    }

    #[tokio::test]
    async fn test_claim_covers_waypoint_resolution() {
        let provider = Arc::new(provider());
        let store = Arc::new(MemoryItinerary::new());
        store.insert_itinerary("trip", vec![route_day("day-1", three_stops())]);
        let places = MemoryPlaces::new();
        places.insert("b", Coordinates::new(10.01, 106.01));
        let places = SlowPlaces {
            places,
            delay: Duration::from_millis(40),
        };

        let aggregator = DayRouteAggregator::new(provider.clone(), Arc::new(DayStateStore::new()))
            .with_schedule(&SchedulePolicy::immediate());
        let orchestrator = RecalculationOrchestrator::new(
            aggregator,
            WaypointResolver::new(Arc::new(places)),
            store.clone(),
        );

        // Neither call has reached the provider when the second one starts
        let (first, second) = tokio::join!(
            orchestrator.recalculate_day("day-1"),
            orchestrator.recalculate_day("day-1")
        );

        assert_eq!(second, RecalcOutcome::AlreadyCalculating);
        let routing = completed(first);
        assert_eq!(routing.total_distance_m, 2500);
        assert_eq!(provider.calls(), vec!["A->B", "B->C"]);
        assert_eq!(store.routing("day-1"), Some(routing));
    }

    #[tokio::test]
    async fn test_second_request_while_calculating_is_rejected() {
        let f = fixture(
            ScriptedProvider::with_latency(Duration::from_millis(50))
                .route("A", "B", 1000, 120)
                .route("B", "C", 1500, 180),
            vec![route_day("day-1", three_stops())],
            SchedulePolicy::immediate(),
        );

        let first = {
            let orchestrator = Arc::clone(&f.orchestrator);
            tokio::spawn(async move { orchestrator.recalculate_day("day-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            f.orchestrator.recalculate_day("day-1").await,
            RecalcOutcome::AlreadyCalculating
        );
        completed(first.await.unwrap());
        assert_eq!(f.provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_recalculate_all_runs_route_days_in_order() {
        let days = vec![
            route_day("day-1", three_stops()),
            DayPlan {
                key: "day-2".to_string(),
                kind: DayKind::Free,
                entries: three_stops(),
            },
            route_day("day-3", vec![DayEntry::place("B", "b"), DayEntry::at("C", 10.02, 106.02)]),
        ];
        let schedule = SchedulePolicy {
            inter_day_delay: Duration::from_millis(30),
            ..SchedulePolicy::immediate()
        };
        let f = fixture(provider(), days, schedule);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = {
            let seen = Arc::clone(&seen);
            let progress: ProgressCallback =
                Arc::new(move |done: u64, total: u64| seen.lock().unwrap().push((done, total)));
            Arc::try_unwrap(f.orchestrator).ok().unwrap().with_progress(progress)
        };

        let start = Instant::now();
        let reports = assert_ok!(orchestrator.recalculate_all("trip").await);
        assert!(start.elapsed() >= Duration::from_millis(30));

        let keys: Vec<_> = reports.iter().map(|r| r.day_key.as_str()).collect();
        assert_eq!(keys, vec!["day-1", "day-3"]);
        assert_eq!(f.provider.calls(), vec!["A->B", "B->C", "B->C"]);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2)]);
        assert!(f.store.routing("day-2").is_none());
    }

    #[tokio::test]
    async fn test_recalculate_all_continues_after_failed_day() {
        let days = vec![
            route_day(
                "day-1",
                vec![DayEntry::at("X", 10.0, 106.0), DayEntry::at("Y", 10.01, 106.01)],
            ),
            route_day("day-2", three_stops()),
        ];
        let f = fixture(provider(), days, SchedulePolicy::immediate());

        let reports = f.orchestrator.recalculate_all("trip").await.unwrap();
        let first = completed(reports[0].outcome.clone());
        assert_eq!(first.error.as_deref(), Some("all 1 legs failed to route"));
        assert_eq!(completed(reports[1].outcome.clone()).total_distance_m, 2500);
    }

    #[tokio::test]
    async fn test_recalculate_all_unknown_itinerary() {
        let f = fixture(provider(), Vec::new(), SchedulePolicy::immediate());
        assert!(f.orchestrator.recalculate_all("nowhere").await.is_err());
    }

    #[tokio::test]
    async fn test_rapid_changes_collapse_to_one_recalculation() {
        let schedule = SchedulePolicy {
            settle_delay: Duration::from_millis(30),
            ..SchedulePolicy::immediate()
        };
        let f = fixture(provider(), vec![route_day("day-1", three_stops())], schedule);

        let handles: Vec<_> = (0..3)
            .map(|_| f.orchestrator.notify_waypoints_changed("day-1"))
            .collect();
        let outcomes: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(outcomes[0], None);
        assert_eq!(outcomes[1], None);
        assert_eq!(completed(outcomes[2].clone().unwrap()).total_distance_m, 2500);
        assert_eq!(f.provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_change_during_calculation_reruns_afterwards() {
        let f = fixture(
            ScriptedProvider::with_latency(Duration::from_millis(30))
                .route("A", "B", 1000, 120)
                .route("B", "C", 1500, 180)
                .route("A", "C", 2000, 240),
            vec![route_day("day-1", three_stops())],
            SchedulePolicy::immediate(),
        );

        let running = {
            let orchestrator = Arc::clone(&f.orchestrator);
            tokio::spawn(async move { orchestrator.recalculate_day("day-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.store
            .set_entries(
                "day-1",
                vec![DayEntry::at("A", 10.0, 106.0), DayEntry::at("C", 10.02, 106.02)],
            )
            .unwrap();
        let rerun = f.orchestrator.notify_waypoints_changed("day-1").await.unwrap();

        assert_eq!(completed(running.await.unwrap()).total_distance_m, 2500);
        let routing = completed(rerun.unwrap());
        assert_eq!(routing.total_distance_m, 2000);
        assert_eq!(f.store.routing("day-1"), Some(routing));
    }

    #[tokio::test]
    async fn test_cancel_day() {
        let f = fixture(
            ScriptedProvider::with_latency(Duration::from_millis(40))
                .route("A", "B", 1000, 120)
                .route("B", "C", 1500, 180),
            vec![route_day("day-1", three_stops())],
            SchedulePolicy::immediate(),
        );
        assert!(!f.orchestrator.cancel_day("day-1"));

        let running = {
            let orchestrator = Arc::clone(&f.orchestrator);
            tokio::spawn(async move { orchestrator.recalculate_day("day-1").await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(f.orchestrator.cancel_day("day-1"));

        let routing = completed(running.await.unwrap());
        assert_eq!(routing.segments.len(), 2);
        assert!(routing.error.unwrap().starts_with("cancelled"));
        assert_eq!(f.provider.calls(), vec!["A->B"]);
    }

    #[tokio::test]
    async fn test_updates_stream_reports_progress() {
        let f = fixture(
            provider(),
            vec![route_day("day-1", three_stops())],
            SchedulePolicy::immediate(),
        );
        let updates = f.orchestrator.updates();

        f.orchestrator.recalculate_day("day-1").await;

        let snapshots: Vec<_> = updates.take(4).collect().await;
        assert!(snapshots[0].is_calculating);
        assert!(snapshots[0].segments.is_empty());
        assert_eq!(snapshots[1].segments.len(), 1);
        assert_eq!(snapshots[2].segments.len(), 2);
        assert!(!snapshots[3].is_calculating);
        assert!(snapshots.iter().all(|s| s.day_key == "day-1"));
    }

    #[tokio::test]
    async fn test_progress_counts_every_route_day() {
        let days = vec![route_day("day-1", three_stops()), route_day("day-2", three_stops())];
        let calls = Arc::new(AtomicU64::new(0));
        let f = fixture(provider(), days, SchedulePolicy::immediate());
        let orchestrator = {
            let calls = Arc::clone(&calls);
            Arc::try_unwrap(f.orchestrator)
                .ok()
                .unwrap()
                .with_progress(Arc::new(move |_: u64, _: u64| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }))
        };

        orchestrator.recalculate_all("trip").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
