//! Waypoint resolution
//!
//! Turns day entries into waypoints, looking up coordinates for entries that
//! only carry a place identifier. Unusable entries are dropped with a warning;
//! the surviving order matches the input order.

use log::warn;
use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::core::itinerary::{DayEntry, PlaceLookup};
use crate::core::model::Waypoint;

/// Waypoints that survived resolution, plus one message per dropped entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub waypoints: Vec<Waypoint>,
    pub warnings: Vec<String>,
}

impl Resolution {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub struct WaypointResolver {
    places: Arc<dyn PlaceLookup>,
}

impl WaypointResolver {
    pub fn new(places: Arc<dyn PlaceLookup>) -> Self {
        Self { places }
    }

    /// Resolve entries in order.
    ///
    /// Fails with `InsufficientWaypoints` when fewer than two remain.
    pub async fn resolve(&self, entries: &[DayEntry]) -> Result<Resolution> {
        let mut resolution = Resolution::default();

        for entry in entries {
            match self.resolve_entry(entry).await {
                Ok(waypoint) => resolution.waypoints.push(waypoint),
                Err(e) => {
                    warn!("Dropping '{}' from route: {e}", entry.name);
                    resolution.warnings.push(format!("{}: {e}", entry.name));
                }
            }
        }

        if resolution.waypoints.len() < 2 {
            return Err(Error::InsufficientWaypoints {
                found: resolution.waypoints.len(),
            });
        }
        Ok(resolution)
    }

    async fn resolve_entry(&self, entry: &DayEntry) -> Result<Waypoint> {
        let coordinates = match (entry.coordinates, entry.place_id.as_deref()) {
            (Some(coordinates), _) => coordinates,
            (None, Some(place_id)) => self.places.lookup_coordinates(place_id).await?,
            (None, None) => {
                return Err(Error::InvalidInput("no coordinates or place identifier".to_string()));
            }
        };
        coordinates.validate()?;

        Ok(Waypoint {
            name: entry.name.clone(),
            coordinates,
            place_id: entry.place_id.clone(),
        })
    }
}
