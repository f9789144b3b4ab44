//! Itinerary and place collaborators
//!
//! The engine reads day entries and writes day routings through
//! `ItineraryStore`, and resolves bare place identifiers through
//! `PlaceLookup`. In-memory implementations back the CLI and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::error::{Error, Result};
use crate::core::model::{Coordinates, DayRouting};

/// One stop of an itinerary day, with coordinates or only a place identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

impl DayEntry {
    pub fn at(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            name: name.into(),
            place_id: None,
            coordinates: Some(Coordinates::new(lat, lon)),
        }
    }

    pub fn place(name: impl Into<String>, place_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            place_id: Some(place_id.into()),
            coordinates: None,
        }
    }
}

/// Only route days are recalculated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayKind {
    #[default]
    Route,
    Free,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayPlan {
    pub key: String,
    #[serde(default)]
    pub kind: DayKind,
    #[serde(default)]
    pub entries: Vec<DayEntry>,
}

/// Storage for itinerary days and their computed routings
#[async_trait]
pub trait ItineraryStore: Send + Sync {
    /// Days of an itinerary, in itinerary order.
    async fn days(&self, itinerary_id: &str) -> Result<Vec<DayPlan>>;

    /// Current entries of one day, in visiting order.
    async fn day_entries(&self, day_key: &str) -> Result<Vec<DayEntry>>;

    async fn store_routing(&self, day_key: &str, routing: &DayRouting) -> Result<()>;
}

/// Coordinates for places referenced only by identifier
#[async_trait]
pub trait PlaceLookup: Send + Sync {
    /// Fails with `PlaceNotFound` for unknown identifiers.
    async fn lookup_coordinates(&self, place_id: &str) -> Result<Coordinates>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItinerary {
    pub id: String,
    pub days: Vec<DayPlan>,
}

/// JSON plan consumed by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanFile {
    pub itineraries: Vec<PlanItinerary>,
    #[serde(default)]
    pub places: HashMap<String, Coordinates>,
}

impl PlanFile {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidInput(format!("Invalid plan file {}: {e}", path.display())))
    }
}

/// `ItineraryStore` held in memory
#[derive(Default)]
pub struct MemoryItinerary {
    itineraries: RwLock<Vec<PlanItinerary>>,
    routings: RwLock<HashMap<String, DayRouting>>,
}

impl MemoryItinerary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: &PlanFile) -> Self {
        Self {
            itineraries: RwLock::new(plan.itineraries.clone()),
            routings: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PlanItinerary>> {
        self.itineraries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PlanItinerary>> {
        self.itineraries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an itinerary, replacing one with the same id.
    pub fn insert_itinerary(&self, id: impl Into<String>, days: Vec<DayPlan>) {
        let id = id.into();
        let mut itineraries = self.write();
        itineraries.retain(|itinerary| itinerary.id != id);
        itineraries.push(PlanItinerary { id, days });
    }

    /// Replace the entries of an existing day.
    pub fn set_entries(&self, day_key: &str, entries: Vec<DayEntry>) -> Result<()> {
        let mut itineraries = self.write();
        let day = itineraries
            .iter_mut()
            .flat_map(|itinerary| itinerary.days.iter_mut())
            .find(|day| day.key == day_key)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown day '{day_key}'")))?;
        day.entries = entries;
        Ok(())
    }

    /// Last routing stored for a day.
    pub fn routing(&self, day_key: &str) -> Option<DayRouting> {
        self.routings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(day_key)
            .cloned()
    }
}

#[async_trait]
impl ItineraryStore for MemoryItinerary {
    async fn days(&self, itinerary_id: &str) -> Result<Vec<DayPlan>> {
        self.read()
            .iter()
            .find(|itinerary| itinerary.id == itinerary_id)
            .map(|itinerary| itinerary.days.clone())
            .ok_or_else(|| Error::InvalidInput(format!("Unknown itinerary '{itinerary_id}'")))
    }

    async fn day_entries(&self, day_key: &str) -> Result<Vec<DayEntry>> {
        self.read()
            .iter()
            .flat_map(|itinerary| itinerary.days.iter())
            .find(|day| day.key == day_key)
            .map(|day| day.entries.clone())
            .ok_or_else(|| Error::InvalidInput(format!("Unknown day '{day_key}'")))
    }

    async fn store_routing(&self, day_key: &str, routing: &DayRouting) -> Result<()> {
        self.routings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(day_key.to_string(), routing.clone());
        Ok(())
    }
}

/// `PlaceLookup` over a fixed table
#[derive(Default)]
pub struct MemoryPlaces {
    places: RwLock<HashMap<String, Coordinates>>,
}

impl MemoryPlaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: &PlanFile) -> Self {
        Self {
            places: RwLock::new(plan.places.clone()),
        }
    }

    pub fn insert(&self, place_id: impl Into<String>, coordinates: Coordinates) {
        self.places
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(place_id.into(), coordinates);
    }
}

#[async_trait]
impl PlaceLookup for MemoryPlaces {
    async fn lookup_coordinates(&self, place_id: &str) -> Result<Coordinates> {
        self.places
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(place_id)
            .copied()
            .ok_or_else(|| Error::PlaceNotFound(place_id.to_string()))
    }
}
