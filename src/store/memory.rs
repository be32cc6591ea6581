use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::models::trip::{RouteSample, Trip, TripStatus};
use crate::store::TripStore;

/// Reference store used by tests and local development. All trips live in a
/// single map; the CAS guard is evaluated under the write lock.
#[derive(Clone, Default)]
pub struct InMemoryTripStore {
    trips: Arc<RwLock<HashMap<String, Trip>>>,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn create(&self, trip: &Trip) -> Result<(), AppError> {
        let mut trips = self.trips.write().await;
        trips.insert(trip.id.clone(), trip.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Trip>, AppError> {
        let trips = self.trips.read().await;
        Ok(trips.get(id).cloned())
    }

    async fn get_active_by_traveler(
        &self,
        traveler_id: &str,
    ) -> Result<Option<Trip>, AppError> {
        let trips = self.trips.read().await;
        Ok(trips
            .values()
            .find(|t| t.traveler_id == traveler_id && t.status == TripStatus::Active)
            .cloned())
    }

    async fn list_by_traveler(&self, traveler_id: &str) -> Result<Vec<Trip>, AppError> {
        let trips = self.trips.read().await;
        let mut items: Vec<Trip> = trips
            .values()
            .filter(|t| t.traveler_id == traveler_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(items)
    }

    async fn list_active_with_expired_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trip>, AppError> {
        let trips = self.trips.read().await;
        Ok(trips
            .values()
            .filter(|t| t.is_overdue_at(now))
            .cloned()
            .collect())
    }

    async fn compare_and_swap_status(
        &self,
        expected: TripStatus,
        updated: &Trip,
    ) -> Result<Trip, AppError> {
        let mut trips = self.trips.write().await;
        let stored = trips.get_mut(&updated.id).ok_or(AppError::NotFound)?;
        if stored.status != expected {
            return Err(AppError::ConcurrentModification);
        }
        stored.status = updated.status;
        stored.expected_end_at = updated.expected_end_at;
        stored.last_check_in_at = updated.last_check_in_at;
        stored.alerted_at = updated.alerted_at;
        stored.completed_at = updated.completed_at;
        stored.cancelled_at = updated.cancelled_at;
        Ok(stored.clone())
    }

    async fn touch_check_in(&self, id: &str, at: DateTime<Utc>) -> Result<Trip, AppError> {
        let mut trips = self.trips.write().await;
        let stored = trips.get_mut(id).ok_or(AppError::NotFound)?;
        if stored.status != TripStatus::Active {
            return Err(AppError::ConcurrentModification);
        }
        stored.last_check_in_at = Some(at);
        Ok(stored.clone())
    }

    async fn append_route_sample(
        &self,
        id: &str,
        sample: RouteSample,
    ) -> Result<Trip, AppError> {
        let mut trips = self.trips.write().await;
        let stored = trips.get_mut(id).ok_or(AppError::NotFound)?;
        if let Some(last) = stored.route.last() {
            if sample.recorded_at < last.recorded_at {
                return Err(AppError::InvalidTripParameters(
                    "route sample timestamps must be non-decreasing".into(),
                ));
            }
        }
        stored.route.push(sample);
        Ok(stored.clone())
    }
}
