use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::trip::{RouteSample, Trip, TripStatus, TrustedContact};
use crate::store::TripStore;

#[derive(Clone)]
pub struct SqliteTripStore {
    pool: DbPool,
}

impl SqliteTripStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Trip>, AppError> {
        let row = sqlx::query_as::<_, TripRow>("SELECT * FROM trips WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trip::try_from).transpose()
    }
}

#[derive(FromRow)]
struct TripRow {
    id: String,
    traveler_id: String,
    traveler_name: String,
    destination: String,
    destination_lat: Option<f64>,
    destination_lon: Option<f64>,
    started_at: DateTime<Utc>,
    expected_duration_minutes: i64,
    expected_end_at: DateTime<Utc>,
    check_in_interval_minutes: Option<i64>,
    last_check_in_at: Option<DateTime<Utc>>,
    trusted_contacts: Json<Vec<TrustedContact>>,
    route: Json<Vec<RouteSample>>,
    status: String,
    alerted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<TripRow> for Trip {
    type Error = AppError;

    fn try_from(row: TripRow) -> Result<Self, Self::Error> {
        let status = TripStatus::parse(&row.status)
            .ok_or_else(|| AppError::Other(anyhow!("unknown trip status in store: {}", row.status)))?;
        Ok(Trip {
            id: row.id,
            traveler_id: row.traveler_id,
            traveler_name: row.traveler_name,
            destination: row.destination,
            destination_lat: row.destination_lat,
            destination_lon: row.destination_lon,
            started_at: row.started_at,
            expected_duration_minutes: row.expected_duration_minutes,
            expected_end_at: row.expected_end_at,
            check_in_interval_minutes: row.check_in_interval_minutes,
            last_check_in_at: row.last_check_in_at,
            trusted_contacts: row.trusted_contacts.0,
            route: row.route.0,
            status,
            alerted_at: row.alerted_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[async_trait]
impl TripStore for SqliteTripStore {
    async fn create(&self, trip: &Trip) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO trips (
                id, traveler_id, traveler_name, destination,
                destination_lat, destination_lon, started_at,
                expected_duration_minutes, expected_end_at,
                check_in_interval_minutes, last_check_in_at,
                trusted_contacts, route, status,
                alerted_at, completed_at, cancelled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trip.id)
        .bind(&trip.traveler_id)
        .bind(&trip.traveler_name)
        .bind(&trip.destination)
        .bind(trip.destination_lat)
        .bind(trip.destination_lon)
        .bind(trip.started_at)
        .bind(trip.expected_duration_minutes)
        .bind(trip.expected_end_at)
        .bind(trip.check_in_interval_minutes)
        .bind(trip.last_check_in_at)
        .bind(Json(&trip.trusted_contacts))
        .bind(Json(&trip.route))
        .bind(trip.status.as_str())
        .bind(trip.alerted_at)
        .bind(trip.completed_at)
        .bind(trip.cancelled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Trip>, AppError> {
        self.fetch(id).await
    }

    async fn get_active_by_traveler(
        &self,
        traveler_id: &str,
    ) -> Result<Option<Trip>, AppError> {
        let row = sqlx::query_as::<_, TripRow>(
            "SELECT * FROM trips WHERE traveler_id = ? AND status = 'active'",
        )
        .bind(traveler_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Trip::try_from).transpose()
    }

    async fn list_by_traveler(&self, traveler_id: &str) -> Result<Vec<Trip>, AppError> {
        let rows = sqlx::query_as::<_, TripRow>(
            "SELECT * FROM trips WHERE traveler_id = ? ORDER BY started_at DESC",
        )
        .bind(traveler_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Trip::try_from).collect()
    }

    async fn list_active_with_expired_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trip>, AppError> {
        let rows = sqlx::query_as::<_, TripRow>(
            "SELECT * FROM trips WHERE status = 'active' AND expected_end_at < ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Trip::try_from).collect()
    }

    async fn compare_and_swap_status(
        &self,
        expected: TripStatus,
        updated: &Trip,
    ) -> Result<Trip, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE trips
            SET status = ?, expected_end_at = ?, last_check_in_at = ?,
                alerted_at = ?, completed_at = ?, cancelled_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(updated.status.as_str())
        .bind(updated.expected_end_at)
        .bind(updated.last_check_in_at)
        .bind(updated.alerted_at)
        .bind(updated.completed_at)
        .bind(updated.cancelled_at)
        .bind(&updated.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.fetch(&updated.id).await? {
                Some(_) => Err(AppError::ConcurrentModification),
                None => Err(AppError::NotFound),
            };
        }

        self.fetch(&updated.id).await?.ok_or(AppError::NotFound)
    }

    async fn touch_check_in(&self, id: &str, at: DateTime<Utc>) -> Result<Trip, AppError> {
        let result =
            sqlx::query("UPDATE trips SET last_check_in_at = ? WHERE id = ? AND status = 'active'")
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return match self.fetch(id).await? {
                Some(_) => Err(AppError::ConcurrentModification),
                None => Err(AppError::NotFound),
            };
        }

        self.fetch(id).await?.ok_or(AppError::NotFound)
    }

    async fn append_route_sample(
        &self,
        id: &str,
        sample: RouteSample,
    ) -> Result<Trip, AppError> {
        let encoded = serde_json::to_string(&sample).map_err(|err| AppError::Other(err.into()))?;
        // Guard and append in one statement ('$[#]' appends at the tail,
        // '$[#-1]' is the current tail), so two concurrent appends cannot
        // both pass a check against the same stale tail. strftime normalizes
        // the 'Z'-suffixed JSON timestamps and sqlx's bound encoding to one
        // comparable form.
        let result = sqlx::query(
            r#"
            UPDATE trips
            SET route = json_insert(route, '$[#]', json(?))
            WHERE id = ?
              AND (json_array_length(route) = 0
                   OR strftime('%Y-%m-%d %H:%M:%f', json_extract(route, '$[#-1].recorded_at'))
                      <= strftime('%Y-%m-%d %H:%M:%f', ?))
            "#,
        )
        .bind(encoded)
        .bind(id)
        .bind(sample.recorded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.fetch(id).await? {
                Some(_) => Err(AppError::InvalidTripParameters(
                    "route sample timestamps must be non-decreasing".into(),
                )),
                None => Err(AppError::NotFound),
            };
        }

        self.fetch(id).await?.ok_or(AppError::NotFound)
    }
}
