//! Routing provider client for itinerary-routing
//!
//! Issues OSRM-style route requests, one per leg or multi-point path, with a
//! bounded retry loop for rate limiting and transient failures.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use std::future::Future;

use crate::core::config::{ProviderConfig, RetryPolicy};
use crate::core::error::{Error, Result};
use crate::core::model::{Coordinates, Maneuver, RouteSegment, TravelMode, Waypoint};

/// Something that can route between waypoints.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Route a single leg.
    async fn compute_leg(
        &self,
        from: &Waypoint,
        to: &Waypoint,
        mode: TravelMode,
    ) -> Result<RouteSegment>;

    /// Route an ordered path in one request, returning one segment per leg.
    async fn compute_path(
        &self,
        points: &[Waypoint],
        mode: TravelMode,
    ) -> Result<Vec<RouteSegment>>;
}

/// Run `operation` until it succeeds, fails permanently or the retry budget is spent.
///
/// The closure receives the zero-based attempt number.
async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = match e {
                    Error::ProviderRateLimited => policy.rate_limit_backoff,
                    _ => policy.transient_backoff,
                };
                attempt += 1;
                warn!(
                    "Provider attempt {attempt} failed: {e}. Retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(Error::RoutingFailed {
                    attempts: attempt + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// HTTP client for an OSRM-compatible `/route/v1` endpoint
#[derive(Debug, Clone)]
pub struct OsrmClient {
    client: Client,
    config: ProviderConfig,
    retry: RetryPolicy,
}

impl OsrmClient {
    pub fn new(config: ProviderConfig, retry: RetryPolicy) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config, retry })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// One request, no retries.
    ///
    /// A successful answer without routes fails permanently, so the retry
    /// loop reports how many attempts it took to get there.
    async fn fetch_route(&self, points: &[Coordinates], mode: TravelMode) -> Result<RouteAnswer> {
        let coords = points
            .iter()
            .map(Coordinates::to_lon_lat)
            .collect::<Vec<_>>()
            .join(";");
        let url = format!(
            "{}/route/v1/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile_for(mode),
            coords
        );
        debug!("GET {url}");

        let response = self
            .client
            .get(&url)
            .query(&[("overview", "full"), ("geometries", "polyline"), ("steps", "true")])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::ProviderRateLimited);
        }

        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<OsrmErrorBody>(&text)
                .map(|body| body.message.unwrap_or(body.code))
                .unwrap_or(text);
            return Err(Error::ProviderError { status: status.as_u16(), message });
        }

        let body: OsrmRouteResponse = serde_json::from_str(&text)?;
        if let Some(code) = body.code.as_deref() {
            if code != "Ok" {
                return Err(Error::ProviderError {
                    status: status.as_u16(),
                    message: body.message.clone().unwrap_or_else(|| code.to_string()),
                });
            }
        }

        let route = body.routes.into_iter().next().ok_or_else(|| Error::ProviderError {
            status: status.as_u16(),
            message: "provider returned no routes".to_string(),
        })?;

        Ok(RouteAnswer {
            status: status.as_u16(),
            route,
            waypoints: body.waypoints,
        })
    }
}

/// First route of a successful response
struct RouteAnswer {
    status: u16,
    route: OsrmRoute,
    waypoints: Vec<OsrmWaypoint>,
}

#[async_trait]
impl RoutingProvider for OsrmClient {
    async fn compute_leg(
        &self,
        from: &Waypoint,
        to: &Waypoint,
        mode: TravelMode,
    ) -> Result<RouteSegment> {
        from.coordinates.validate()?;
        to.coordinates.validate()?;

        let points = [from.coordinates, to.coordinates];
        let RouteAnswer { status, route, waypoints } = retry_transient(&self.retry, |attempt| {
            debug!("Routing {} -> {} (attempt {})", from.name, to.name, attempt + 1);
            self.fetch_route(&points, mode)
        })
        .await?;

        Ok(RouteSegment {
            from_place: from.name.clone(),
            to_place: to.name.clone(),
            distance_m: route.distance.round() as u64,
            duration_s: route.duration.round() as u64,
            geometry: route.geometry,
            maneuvers: route.legs.iter().flat_map(OsrmLeg::maneuvers).collect(),
            provider_status: Some(status),
            waypoints_used: waypoints.iter().map(OsrmWaypoint::coordinates).collect(),
            failure: None,
        })
    }

    async fn compute_path(
        &self,
        points: &[Waypoint],
        mode: TravelMode,
    ) -> Result<Vec<RouteSegment>> {
        if points.len() < 2 {
            return Err(Error::InsufficientWaypoints { found: points.len() });
        }
        for point in points {
            point.coordinates.validate()?;
        }

        let coords: Vec<Coordinates> = points.iter().map(|p| p.coordinates).collect();
        let RouteAnswer { status, route, waypoints } = retry_transient(&self.retry, |attempt| {
            debug!("Routing path of {} points (attempt {})", coords.len(), attempt + 1);
            self.fetch_route(&coords, mode)
        })
        .await?;

        if route.legs.len() != points.len() - 1 {
            return Err(Error::MalformedResponse(format!(
                "expected {} legs, provider returned {}",
                points.len() - 1,
                route.legs.len()
            )));
        }

        let single_leg = route.legs.len() == 1;
        let snapped: Vec<Coordinates> = waypoints.iter().map(OsrmWaypoint::coordinates).collect();

        Ok(route
            .legs
            .iter()
            .enumerate()
            .map(|(i, leg)| RouteSegment {
                from_place: points[i].name.clone(),
                to_place: points[i + 1].name.clone(),
                distance_m: leg.distance.round() as u64,
                duration_s: leg.duration.round() as u64,
                geometry: if single_leg { route.geometry.clone() } else { None },
                maneuvers: leg.maneuvers(),
                provider_status: Some(status),
                waypoints_used: snapped
                    .get(i..=i + 1)
                    .map(|pair| pair.to_vec())
                    .unwrap_or_default(),
                failure: None,
            })
            .collect())
    }
}

// --- Provider wire format ---

#[derive(Debug, Deserialize)]
struct OsrmErrorBody {
    code: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
    #[serde(default)]
    waypoints: Vec<OsrmWaypoint>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: Option<String>,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    distance: f64,
    duration: f64,
    #[serde(default)]
    steps: Vec<OsrmStep>,
}

impl OsrmLeg {
    fn maneuvers(&self) -> Vec<Maneuver> {
        self.steps.iter().map(OsrmStep::to_maneuver).collect()
    }
}

#[derive(Debug, Deserialize)]
struct OsrmStep {
    distance: f64,
    duration: f64,
    #[serde(default)]
    name: String,
    geometry: Option<String>,
    maneuver: OsrmManeuver,
}

impl OsrmStep {
    fn to_maneuver(&self) -> Maneuver {
        Maneuver {
            instruction: instruction_text(
                &self.maneuver.kind,
                self.maneuver.modifier.as_deref(),
                &self.name,
            ),
            street_name: self.name.clone(),
            maneuver_type: self.maneuver.kind.clone(),
            distance_m: self.distance,
            duration_s: self.duration,
            geometry: self.geometry.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OsrmManeuver {
    #[serde(rename = "type")]
    kind: String,
    modifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsrmWaypoint {
    /// `[lon, lat]`
    location: [f64; 2],
}

impl OsrmWaypoint {
    fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.location[1], self.location[0])
    }
}

/// Human-readable instruction for a provider maneuver.
fn instruction_text(kind: &str, modifier: Option<&str>, street: &str) -> String {
    let onto = if street.is_empty() {
        String::new()
    } else {
        format!(" onto {street}")
    };
    let direction = modifier.map(|m| format!(" {m}")).unwrap_or_default();

    match kind {
        "depart" if street.is_empty() => "Depart".to_string(),
        "depart" => format!("Depart on {street}"),
        "arrive" => "Arrive at destination".to_string(),
        "roundabout" | "rotary" => format!("Enter the roundabout and exit{onto}"),
        "merge" => format!("Merge{direction}{onto}"),
        "fork" => format!("Keep{direction}{onto}"),
        "on ramp" => format!("Take the ramp{direction}{onto}"),
        "off ramp" => format!("Take the exit{direction}{onto}"),
        "continue" | "new name" => format!("Continue{direction}{onto}"),
        _ => format!("Turn{direction}{onto}"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider used by aggregator and orchestrator tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Route { distance_m: u64, duration_s: u64 },
        Fail(String),
    }

    /// Answers legs by `from->to` name, recording every call.
    #[derive(Default)]
    pub struct ScriptedProvider {
        answers: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
        latency: Duration,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self { latency, ..Self::default() }
        }

        /// Queue an answer; the last queued answer repeats once the queue drains.
        pub fn answer(self, from: &str, to: &str, answer: Scripted) -> Self {
            self.answers
                .lock()
                .unwrap()
                .entry(format!("{from}->{to}"))
                .or_default()
                .push_back(answer);
            self
        }

        pub fn route(self, from: &str, to: &str, distance_m: u64, duration_s: u64) -> Self {
            self.answer(from, to, Scripted::Route { distance_m, duration_s })
        }

        pub fn fail(self, from: &str, to: &str) -> Self {
            self.answer(from, to, Scripted::Fail("no route".to_string()))
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next_answer(&self, key: &str) -> Option<Scripted> {
            let mut answers = self.answers.lock().unwrap();
            let queue = answers.get_mut(key)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    #[async_trait]
    impl RoutingProvider for ScriptedProvider {
        async fn compute_leg(
            &self,
            from: &Waypoint,
            to: &Waypoint,
            _mode: TravelMode,
        ) -> Result<RouteSegment> {
            from.coordinates.validate()?;
            to.coordinates.validate()?;

            let key = format!("{}->{}", from.name, to.name);
            self.calls.lock().unwrap().push(key.clone());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            match self.next_answer(&key) {
                Some(Scripted::Route { distance_m, duration_s }) => Ok(RouteSegment {
                    from_place: from.name.clone(),
                    to_place: to.name.clone(),
                    distance_m,
                    duration_s,
                    geometry: Some(format!("poly:{key}")),
                    maneuvers: Vec::new(),
                    provider_status: Some(200),
                    waypoints_used: vec![from.coordinates, to.coordinates],
                    failure: None,
                }),
                Some(Scripted::Fail(reason)) => Err(Error::RoutingFailed { attempts: 3, reason }),
                None => Err(Error::RoutingFailed {
                    attempts: 3,
                    reason: format!("no scripted answer for {key}"),
                }),
            }
        }

        async fn compute_path(
            &self,
            points: &[Waypoint],
            mode: TravelMode,
        ) -> Result<Vec<RouteSegment>> {
            let mut segments = Vec::new();
            for pair in points.windows(2) {
                segments.push(self.compute_leg(&pair[0], &pair[1], mode).await?);
            }
            Ok(segments)
        }
    }
}
