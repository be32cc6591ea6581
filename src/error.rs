use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid trip parameters: {0}")]
    InvalidTripParameters(String),
    #[error("trip is already in a terminal state")]
    TripAlreadyTerminal,
    #[error("trip was modified concurrently")]
    ConcurrentModification,
    #[error("notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Database(_)
            | AppError::Other(_)
            | AppError::NotificationDeliveryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InvalidTripParameters(_) => StatusCode::BAD_REQUEST,
            AppError::TripAlreadyTerminal | AppError::ConcurrentModification => {
                StatusCode::CONFLICT
            }
        };

        (status, self.to_string()).into_response()
    }
}
