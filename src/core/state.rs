//! Per-day routing state
//!
//! Holds the latest `DayRouting` for every day key and enforces the
//! at-most-one-computation-per-day rule at its write boundary.

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::error::{Error, Result};
use crate::core::model::DayRouting;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

struct DaySlot {
    routing: DayRouting,
    cancel: Option<CancellationToken>,
}

/// Keyed store of day routing state, observable through a broadcast channel
pub struct DayStateStore {
    days: Mutex<HashMap<String, DaySlot>>,
    updates: broadcast::Sender<DayRouting>,
}

impl Default for DayStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DayStateStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            days: Mutex::new(HashMap::new()),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DaySlot>> {
        self.days.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Receive every published snapshot, intermediate ones included.
    pub fn subscribe(&self) -> broadcast::Receiver<DayRouting> {
        self.updates.subscribe()
    }

    pub fn get(&self, day_key: &str) -> Option<DayRouting> {
        self.lock().get(day_key).map(|slot| slot.routing.clone())
    }

    pub fn is_calculating(&self, day_key: &str) -> bool {
        self.lock()
            .get(day_key)
            .is_some_and(|slot| slot.routing.is_calculating)
    }

    fn publish(&self, routing: DayRouting) {
        // No subscribers is not an error
        let _ = self.updates.send(routing);
    }

    /// Claim `day_key` for one computation.
    ///
    /// Fails with `AlreadyCalculating` while another claim is live.
    pub fn begin(self: &Arc<Self>, day_key: &str) -> Result<InFlight> {
        let cancel = CancellationToken::new();
        let (previous, snapshot) = {
            let mut days = self.lock();
            let slot = days.entry(day_key.to_string()).or_insert_with(|| DaySlot {
                routing: DayRouting::new(day_key),
                cancel: None,
            });
            if slot.routing.is_calculating {
                return Err(Error::AlreadyCalculating(day_key.to_string()));
            }

            let mut routing = DayRouting::new(day_key);
            routing.is_calculating = true;
            routing.last_updated = slot.routing.last_updated;
            let previous = std::mem::replace(&mut slot.routing, routing.clone());
            slot.cancel = Some(cancel.clone());
            (previous, routing)
        };

        debug!("Day '{day_key}' claimed for calculation");
        self.publish(snapshot);

        Ok(InFlight {
            store: Arc::clone(self),
            day_key: day_key.to_string(),
            cancel,
            previous,
            finished: false,
        })
    }

    /// Ask the live computation for `day_key` to stop before its next leg.
    pub fn cancel(&self, day_key: &str) -> bool {
        match self.lock().get(day_key).and_then(|slot| slot.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resolve once no computation for `day_key` is live.
    pub async fn wait_idle(&self, day_key: &str) {
        let mut updates = self.subscribe();
        while self.is_calculating(day_key) {
            match updates.recv().await {
                Ok(routing) if routing.day_key == day_key && !routing.is_calculating => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn update_in_flight(&self, routing: &DayRouting) {
        if let Some(slot) = self.lock().get_mut(&routing.day_key) {
            slot.routing = routing.clone();
        }
        self.publish(routing.clone());
    }

    fn release(&self, routing: DayRouting) {
        if let Some(slot) = self.lock().get_mut(&routing.day_key) {
            slot.routing = routing.clone();
            slot.cancel = None;
        }
        self.publish(routing);
    }
}

/// A live claim on one day key; dropping it unfinished releases the day.
pub struct InFlight {
    store: Arc<DayStateStore>,
    day_key: String,
    cancel: CancellationToken,
    /// State of the day before the claim, restored by `abandon`
    previous: DayRouting,
    finished: bool,
}

impl InFlight {
    pub fn day_key(&self) -> &str {
        &self.day_key
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish an intermediate snapshot.
    pub fn progress(&self, routing: &DayRouting) {
        self.store.update_in_flight(routing);
    }

    /// Store the final routing and release the claim.
    pub fn finish(mut self, mut routing: DayRouting) -> DayRouting {
        routing.is_calculating = false;
        self.finished = true;
        self.store.release(routing.clone());
        routing
    }

    /// Release the claim without a result, keeping the day's earlier routing.
    pub fn abandon(mut self, reason: impl Into<String>) -> DayRouting {
        let mut routing = std::mem::replace(&mut self.previous, DayRouting::new(&self.day_key));
        routing.is_calculating = false;
        routing.error = Some(reason.into());
        self.finished = true;
        self.store.release(routing.clone());
        routing
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            let mut routing = self
                .store
                .get(&self.day_key)
                .unwrap_or_else(|| DayRouting::new(&self.day_key));
            routing.is_calculating = false;
            routing.error = Some("calculation abandoned".to_string());
            self.store.release(routing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_claim_is_rejected() {
        let store = Arc::new(DayStateStore::new());
        let first = store.begin("day-1").unwrap();
        assert!(store.is_calculating("day-1"));

        match store.begin("day-1") {
            Err(Error::AlreadyCalculating(day)) => assert_eq!(day, "day-1"),
            _ => panic!("Expected AlreadyCalculating"),
        }
        // Other days are independent
        let other = store.begin("day-2").unwrap();

        first.finish(DayRouting::new("day-1"));
        other.finish(DayRouting::new("day-2"));
        assert!(!store.is_calculating("day-1"));
        assert!(store.begin("day-1").is_ok());
    }

    #[test]
    fn test_dropped_claim_releases_day() {
        let store = Arc::new(DayStateStore::new());
        {
            let _claim = store.begin("day-1").unwrap();
        }
        let state = store.get("day-1").unwrap();
        assert!(!state.is_calculating);
        assert_eq!(state.error.as_deref(), Some("calculation abandoned"));
    }

    #[test]
    fn test_abandon_restores_previous_routing() {
        let store = Arc::new(DayStateStore::new());
        let mut done = DayRouting::new("day-1");
        done.total_distance_m = 2500;
        store.begin("day-1").unwrap().finish(done);

        let claim = store.begin("day-1").unwrap();
        assert_eq!(store.get("day-1").unwrap().total_distance_m, 0);
        let restored = claim.abandon("Unknown day 'day-1'");

        assert_eq!(restored.total_distance_m, 2500);
        assert_eq!(restored.error.as_deref(), Some("Unknown day 'day-1'"));
        assert_eq!(store.get("day-1"), Some(restored));
        assert!(!store.is_calculating("day-1"));
    }

    #[test]
    fn test_cancel_signals_claim() {
        let store = Arc::new(DayStateStore::new());
        assert!(!store.cancel("day-1"));
        let claim = store.begin("day-1").unwrap();
        assert!(store.cancel("day-1"));
        assert!(claim.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribers_see_progress() {
        let store = Arc::new(DayStateStore::new());
        let mut updates = store.subscribe();

        let claim = store.begin("day-1").unwrap();
        let mut partial = DayRouting::new("day-1");
        partial.is_calculating = true;
        partial.total_distance_m = 10;
        claim.progress(&partial);
        claim.finish(partial);

        let first = updates.recv().await.unwrap();
        assert!(first.is_calculating);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.total_distance_m, 10);
        let last = updates.recv().await.unwrap();
        assert!(!last.is_calculating);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_finish() {
        let store = Arc::new(DayStateStore::new());
        let claim = store.begin("day-1").unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_idle("day-1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        claim.finish(DayRouting::new("day-1"));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
