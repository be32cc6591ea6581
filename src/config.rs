use std::{env, net::SocketAddr};

use crate::error::AppError;
use crate::models::trip::{Channel, TrustedContact};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub scan_interval_secs: u64,
    pub matrix: Option<MatrixConfig>,
    pub escalation_contact: Option<TrustedContact>,
}

/// Credentials for the Matrix account the backend sends DMs from.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub homeserver_url: String,
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://guardian.db".to_string());
        let listen_addr: SocketAddr = env::var("APP_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid APP_LISTEN_ADDR: {err}")))?;

        let scan_interval_secs = match env::var("GUARDIAN_SCAN_INTERVAL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|err| AppError::Config(format!("invalid GUARDIAN_SCAN_INTERVAL_SECS: {err}")))?,
            Err(_) => 60,
        };
        if scan_interval_secs == 0 {
            return Err(AppError::Config(
                "GUARDIAN_SCAN_INTERVAL_SECS must be at least 1".into(),
            ));
        }

        let matrix = Self::matrix_from_env()?;
        let escalation_contact = Self::escalation_from_env()?;

        Ok(Self {
            database_url,
            listen_addr,
            scan_interval_secs,
            matrix,
            escalation_contact,
        })
    }

    fn matrix_from_env() -> Result<Option<MatrixConfig>, AppError> {
        let Ok(access_token) = env::var("GUARDIAN_MATRIX_ACCESS_TOKEN") else {
            return Ok(None);
        };
        if access_token.trim().is_empty() {
            return Ok(None);
        }
        let homeserver_url = env::var("GUARDIAN_MATRIX_HOMESERVER")
            .unwrap_or_else(|_| "https://matrix.org".to_string());
        let user_id = env::var("GUARDIAN_MATRIX_USER_ID")
            .map_err(|_| AppError::Config("GUARDIAN_MATRIX_USER_ID is required when a Matrix token is set".into()))?;
        let device_id = env::var("GUARDIAN_MATRIX_DEVICE_ID")
            .map_err(|_| AppError::Config("GUARDIAN_MATRIX_DEVICE_ID is required when a Matrix token is set".into()))?;
        Ok(Some(MatrixConfig {
            homeserver_url,
            user_id,
            device_id,
            access_token,
        }))
    }

    // The campus security desk notified on every report_unsafe, if configured.
    fn escalation_from_env() -> Result<Option<TrustedContact>, AppError> {
        let Ok(address) = env::var("GUARDIAN_ESCALATION_ADDRESS") else {
            return Ok(None);
        };
        if address.trim().is_empty() {
            return Ok(None);
        }
        let channel = match env::var("GUARDIAN_ESCALATION_CHANNEL") {
            Ok(raw) => Channel::parse(&raw)
                .ok_or_else(|| AppError::Config(format!("unknown GUARDIAN_ESCALATION_CHANNEL: {raw}")))?,
            Err(_) => Channel::Matrix,
        };
        let display_name = env::var("GUARDIAN_ESCALATION_NAME")
            .unwrap_or_else(|_| "Campus Security".to_string());
        Ok(Some(TrustedContact {
            display_name,
            address: address.trim().to_string(),
            channel,
        }))
    }
}
