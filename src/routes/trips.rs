use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    auth::CurrentTraveler,
    error::AppError,
    models::trip::{RouteSample, Trip, TripParams},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trips", get(trip_history).post(start_trip))
        .route("/trips/active", get(active_trip))
        .route("/trips/:id", get(get_trip))
        .route("/trips/:id/check-in", post(check_in))
        .route("/trips/:id/extend", post(extend_deadline))
        .route("/trips/:id/unsafe", post(report_unsafe))
        .route("/trips/:id/arrived", post(mark_arrived))
        .route("/trips/:id/cancel", post(cancel_trip))
        .route("/trips/:id/location", post(append_location))
}

async fn start_trip(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Json(params): Json<TripParams>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state
        .engine
        .start_trip(&traveler.id, &traveler.display_name, &params)
        .await?;
    Ok(Json(trip))
}

async fn trip_history(
    State(state): State<AppState>,
    current: CurrentTraveler,
) -> Result<Json<Vec<Trip>>, AppError> {
    let traveler = current.require()?;
    let trips = state.engine.trip_history(&traveler.id).await?;
    Ok(Json(trips))
}

async fn active_trip(
    State(state): State<AppState>,
    current: CurrentTraveler,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state
        .engine
        .active_trip(&traveler.id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(trip))
}

async fn get_trip(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state.engine.get_trip(&traveler.id, &trip_id).await?;
    Ok(Json(trip))
}

#[derive(Deserialize)]
struct CheckInRequest {
    #[serde(default)]
    new_deadline: Option<DateTime<Utc>>,
}

async fn check_in(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
    Json(body): Json<CheckInRequest>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state
        .engine
        .check_in(&traveler.id, &trip_id, body.new_deadline)
        .await?;
    Ok(Json(trip))
}

#[derive(Deserialize)]
struct ExtendDeadlineRequest {
    expected_end_at: DateTime<Utc>,
}

async fn extend_deadline(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
    Json(body): Json<ExtendDeadlineRequest>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state
        .engine
        .extend_deadline(&traveler.id, &trip_id, body.expected_end_at)
        .await?;
    Ok(Json(trip))
}

async fn report_unsafe(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state.engine.report_unsafe(&traveler.id, &trip_id).await?;
    Ok(Json(trip))
}

async fn mark_arrived(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state.engine.mark_arrived(&traveler.id, &trip_id).await?;
    Ok(Json(trip))
}

async fn cancel_trip(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let trip = state.engine.cancel_trip(&traveler.id, &trip_id).await?;
    Ok(Json(trip))
}

#[derive(Deserialize)]
struct LocationRequest {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
}

async fn append_location(
    State(state): State<AppState>,
    current: CurrentTraveler,
    Path(trip_id): Path<String>,
    Json(body): Json<LocationRequest>,
) -> Result<Json<Trip>, AppError> {
    let traveler = current.require()?;
    let sample = RouteSample {
        latitude: body.latitude,
        longitude: body.longitude,
        recorded_at: body.recorded_at.unwrap_or_else(Utc::now),
    };
    let trip = state
        .engine
        .append_location_sample(&traveler.id, &trip_id, sample)
        .await?;
    Ok(Json(trip))
}
