use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Active,
    Overdue,
    Emergency,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Active => "active",
            TripStatus::Overdue => "overdue",
            TripStatus::Emergency => "emergency",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(TripStatus::Active),
            "overdue" => Some(TripStatus::Overdue),
            "emergency" => Some(TripStatus::Emergency),
            "completed" => Some(TripStatus::Completed),
            "cancelled" => Some(TripStatus::Cancelled),
            _ => None,
        }
    }

    /// Emergency trips are resolved by a responder, not by the traveler,
    /// so they count as terminal for every operation the engine exposes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TripStatus::Completed | TripStatus::Cancelled | TripStatus::Emergency
        )
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Email,
    Sms,
    Matrix,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Matrix => "matrix",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "push" => Some(Channel::Push),
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "matrix" => Some(Channel::Matrix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedContact {
    pub display_name: String,
    pub address: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RouteSample {
    pub latitude: f64,
    pub longitude: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Caller input for starting a trip. Exactly one of
/// `expected_duration_minutes` and `expected_end_at` carries the deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripParams {
    pub destination: String,
    #[serde(default)]
    pub destination_lat: Option<f64>,
    #[serde(default)]
    pub destination_lon: Option<f64>,
    #[serde(default)]
    pub expected_duration_minutes: Option<i64>,
    #[serde(default)]
    pub expected_end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_in_interval_minutes: Option<i64>,
    #[serde(default)]
    pub trusted_contacts: Vec<TrustedContact>,
}

impl TripParams {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), AppError> {
        if self.destination.trim().is_empty() {
            return Err(AppError::InvalidTripParameters(
                "destination must not be empty".into(),
            ));
        }
        match (self.expected_duration_minutes, self.expected_end_at) {
            (None, None) => Err(AppError::InvalidTripParameters(
                "either expected_duration_minutes or expected_end_at is required".into(),
            )),
            (Some(_), Some(_)) => Err(AppError::InvalidTripParameters(
                "expected_duration_minutes and expected_end_at are mutually exclusive".into(),
            )),
            (Some(minutes), None) if minutes <= 0 => Err(AppError::InvalidTripParameters(
                "expected_duration_minutes must be positive".into(),
            )),
            (None, Some(end)) if end <= now => Err(AppError::InvalidTripParameters(
                "expected_end_at must lie in the future".into(),
            )),
            _ => {
                if let Some(interval) = self.check_in_interval_minutes {
                    if interval <= 0 {
                        return Err(AppError::InvalidTripParameters(
                            "check_in_interval_minutes must be positive".into(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// A Guardian Mode escort session. Aggregate root of the subsystem; trips
/// are never deleted, terminal trips stay around for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub traveler_id: String,
    pub traveler_name: String,
    pub destination: String,
    pub destination_lat: Option<f64>,
    pub destination_lon: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub expected_duration_minutes: i64,
    pub expected_end_at: DateTime<Utc>,
    pub check_in_interval_minutes: Option<i64>,
    pub last_check_in_at: Option<DateTime<Utc>>,
    pub trusted_contacts: Vec<TrustedContact>,
    pub route: Vec<RouteSample>,
    pub status: TripStatus,
    pub alerted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Trip {
    /// Builds a fresh active trip from validated params. Contacts are
    /// deduplicated by (channel, address) and fixed for the trip's lifetime.
    pub fn new(
        traveler_id: impl Into<String>,
        traveler_name: impl Into<String>,
        params: &TripParams,
        now: DateTime<Utc>,
    ) -> Self {
        let (expected_end_at, expected_duration_minutes) = match params.expected_end_at {
            Some(end) => (end, (end - now).num_minutes().max(1)),
            None => {
                let minutes = params.expected_duration_minutes.unwrap_or(1);
                (now + Duration::minutes(minutes), minutes)
            }
        };

        let mut trusted_contacts: Vec<TrustedContact> = Vec::new();
        for contact in &params.trusted_contacts {
            let address = contact.address.trim();
            if address.is_empty() {
                continue;
            }
            let duplicate = trusted_contacts
                .iter()
                .any(|c| c.channel == contact.channel && c.address == address);
            if !duplicate {
                trusted_contacts.push(TrustedContact {
                    display_name: contact.display_name.trim().to_string(),
                    address: address.to_string(),
                    channel: contact.channel,
                });
            }
        }

        Self {
            id: Uuid::new_v4().to_string(),
            traveler_id: traveler_id.into(),
            traveler_name: traveler_name.into(),
            destination: params.destination.trim().to_string(),
            destination_lat: params.destination_lat,
            destination_lon: params.destination_lon,
            started_at: now,
            expected_duration_minutes,
            expected_end_at,
            check_in_interval_minutes: params.check_in_interval_minutes,
            last_check_in_at: None,
            trusted_contacts,
            route: Vec::new(),
            status: TripStatus::Active,
            alerted_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub fn last_route_sample(&self) -> Option<&RouteSample> {
        self.route.last()
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TripStatus::Active && self.expected_end_at < now
    }
}
