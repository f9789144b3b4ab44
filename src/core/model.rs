//! Route data model
//!
//! Waypoints, routed segments and the per-day aggregate handed back to the
//! itinerary collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{Error, Result};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Rejects NaN and out-of-range components.
    pub fn validate(&self) -> Result<()> {
        let lat_ok = (-90.0..=90.0).contains(&self.lat);
        let lon_ok = (-180.0..=180.0).contains(&self.lon);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(Error::InvalidCoordinates { lat: self.lat, lon: self.lon })
        }
    }

    /// `lon,lat` as expected in provider request paths.
    pub fn to_lon_lat(&self) -> String {
        format!("{:.6},{:.6}", self.lon, self.lat)
    }
}

/// A named point visited during a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub coordinates: Coordinates,
    /// Itinerary place this waypoint was resolved from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            name: name.into(),
            coordinates: Coordinates::new(lat, lon),
            place_id: None,
        }
    }

    pub fn with_place_id(mut self, place_id: impl Into<String>) -> Self {
        self.place_id = Some(place_id.into());
        self
    }
}

/// How the traveller moves between waypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    Cycling,
    Transit,
}

impl TravelMode {
    /// Routing profile segment used in provider URLs.
    pub fn profile(&self) -> &'static str {
        match self {
            TravelMode::Driving | TravelMode::Transit => "driving",
            TravelMode::Walking => "foot",
            TravelMode::Cycling => "bike",
        }
    }

    /// Cache lifetime: driving routes are traffic-sensitive.
    pub fn default_ttl(&self) -> Duration {
        match self {
            TravelMode::Driving => Duration::from_secs(60 * 60),
            _ => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Estimated emissions in grams of CO2 per kilometre.
    pub fn emission_factor_g_per_km(&self) -> f64 {
        match self {
            TravelMode::Driving => 171.0,
            TravelMode::Transit => 41.0,
            TravelMode::Walking | TravelMode::Cycling => 0.0,
        }
    }
}

impl fmt::Display for TravelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TravelMode::Driving => "driving",
            TravelMode::Walking => "walking",
            TravelMode::Cycling => "cycling",
            TravelMode::Transit => "transit",
        };
        f.write_str(name)
    }
}

impl FromStr for TravelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "driving" | "car" => Ok(TravelMode::Driving),
            "walking" | "foot" => Ok(TravelMode::Walking),
            "cycling" | "bike" => Ok(TravelMode::Cycling),
            "transit" => Ok(TravelMode::Transit),
            other => Err(Error::InvalidInput(format!("unknown travel mode '{other}'"))),
        }
    }
}

/// One turn-by-turn step of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maneuver {
    pub instruction: String,
    pub street_name: String,
    pub maneuver_type: String,
    pub distance_m: f64,
    pub duration_s: f64,
    pub geometry: Option<String>,
}

/// The routed leg between two consecutive waypoints.
///
/// A placeholder (failed leg) has zero distance and duration and no
/// `provider_status`; a degenerate but successful leg keeps its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSegment {
    pub from_place: String,
    pub to_place: String,
    pub distance_m: u64,
    pub duration_s: u64,
    pub geometry: Option<String>,
    pub maneuvers: Vec<Maneuver>,
    pub provider_status: Option<u16>,
    pub waypoints_used: Vec<Coordinates>,
    pub failure: Option<String>,
}

impl RouteSegment {
    /// Zero-valued segment standing in for a leg that could not be routed.
    pub fn placeholder(from: &Waypoint, to: &Waypoint, reason: impl Into<String>) -> Self {
        Self {
            from_place: from.name.clone(),
            to_place: to.name.clone(),
            distance_m: 0,
            duration_s: 0,
            geometry: None,
            maneuvers: Vec::new(),
            provider_status: None,
            waypoints_used: Vec::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.provider_status.is_none()
    }

    /// Same leg relabelled for a different pair of waypoint names.
    pub fn relabelled(&self, from: &Waypoint, to: &Waypoint) -> Self {
        Self {
            from_place: from.name.clone(),
            to_place: to.name.clone(),
            ..self.clone()
        }
    }
}

/// Totals derived from a list of segments.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteStatistics {
    pub total_distance_m: u64,
    pub total_duration_s: u64,
    pub carbon_estimate_g: u64,
}

impl RouteStatistics {
    pub fn from_segments(segments: &[RouteSegment], mode: TravelMode) -> Self {
        let total_distance_m: u64 = segments.iter().map(|s| s.distance_m).sum();
        let total_duration_s: u64 = segments.iter().map(|s| s.duration_s).sum();
        let km = total_distance_m as f64 / 1000.0;
        Self {
            total_distance_m,
            total_duration_s,
            carbon_estimate_g: (km * mode.emission_factor_g_per_km()).round() as u64,
        }
    }
}

/// How a day computation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOutcome {
    Complete,
    Partial { failed: usize, total: usize },
    Failed { total: usize },
    Insufficient,
    Pending,
}

pub const INSUFFICIENT_WAYPOINTS: &str = "insufficient waypoints";

/// Routing state for one itinerary day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRouting {
    pub day_key: String,
    pub segments: Vec<RouteSegment>,
    pub total_distance_m: u64,
    pub total_duration_s: u64,
    pub is_calculating: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DayRouting {
    pub fn new(day_key: impl Into<String>) -> Self {
        Self {
            day_key: day_key.into(),
            segments: Vec::new(),
            total_distance_m: 0,
            total_duration_s: 0,
            is_calculating: false,
            last_updated: None,
            error: None,
        }
    }

    pub fn insufficient(day_key: impl Into<String>) -> Self {
        Self {
            error: Some(INSUFFICIENT_WAYPOINTS.to_string()),
            last_updated: Some(Utc::now()),
            ..Self::new(day_key)
        }
    }

    /// Appends a segment and refreshes the totals.
    pub fn push_segment(&mut self, segment: RouteSegment) {
        self.segments.push(segment);
        self.recompute_totals();
    }

    fn recompute_totals(&mut self) {
        self.total_distance_m = self.segments.iter().map(|s| s.distance_m).sum();
        self.total_duration_s = self.segments.iter().map(|s| s.duration_s).sum();
    }

    pub fn failed_legs(&self) -> usize {
        self.segments.iter().filter(|s| s.is_placeholder()).count()
    }

    pub fn outcome(&self) -> DayOutcome {
        if self.is_calculating {
            return DayOutcome::Pending;
        }
        if self.segments.is_empty() {
            return DayOutcome::Insufficient;
        }
        let total = self.segments.len();
        match self.failed_legs() {
            0 => DayOutcome::Complete,
            failed if failed == total => DayOutcome::Failed { total },
            failed => DayOutcome::Partial { failed, total },
        }
    }

    pub fn statistics(&self, mode: TravelMode) -> RouteStatistics {
        RouteStatistics::from_segments(&self.segments, mode)
    }
}
