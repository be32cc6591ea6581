pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::trip::{RouteSample, Trip, TripStatus};

/// Persistence seam for Guardian Mode trips. Status transitions go through
/// `compare_and_swap_status`, which rejects a write whose expected prior
/// status no longer matches the stored one; that CAS is the only
/// linearization point the engine relies on.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn create(&self, trip: &Trip) -> Result<(), AppError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Trip>, AppError>;

    async fn get_active_by_traveler(&self, traveler_id: &str)
        -> Result<Option<Trip>, AppError>;

    async fn list_by_traveler(&self, traveler_id: &str) -> Result<Vec<Trip>, AppError>;

    /// Scan candidates: every trip still `active` whose deadline lies
    /// strictly before `now`.
    async fn list_active_with_expired_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trip>, AppError>;

    /// Writes the lifecycle fields of `updated` (status, expected_end_at,
    /// last_check_in_at, alerted_at, completed_at, cancelled_at) if and only
    /// if the stored status still equals `expected`. Never touches `route`
    /// or `trusted_contacts`, so a concurrent sample append cannot be lost.
    /// Fails with `ConcurrentModification` when the guard does not hold.
    async fn compare_and_swap_status(
        &self,
        expected: TripStatus,
        updated: &Trip,
    ) -> Result<Trip, AppError>;

    /// Stamps `last_check_in_at` on a still-active trip without touching the
    /// deadline or any other lifecycle field. A plain check-in must not carry
    /// a stale `expected_end_at` back into the store, so it does not go
    /// through the full CAS write. Fails with `ConcurrentModification` when
    /// the trip is no longer active; the caller re-reads and retries.
    async fn touch_check_in(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Trip, AppError>;

    /// Appends one sample to the trip's route. No status guard; route
    /// history is independent of the lifecycle. The store itself enforces
    /// that sample timestamps are non-decreasing, atomically with the
    /// append.
    async fn append_route_sample(
        &self,
        id: &str,
        sample: RouteSample,
    ) -> Result<Trip, AppError>;
}
