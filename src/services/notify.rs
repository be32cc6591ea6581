use std::sync::Arc;

use async_trait::async_trait;
use matrix_sdk::{
    matrix_auth::{MatrixSession, MatrixSessionTokens},
    ruma::{events::room::message::RoomMessageEventContent, OwnedDeviceId, OwnedUserId, UserId},
    Client, SessionMeta,
};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use url::Url;

use crate::{
    config::MatrixConfig,
    error::AppError,
    models::trip::{Channel, TrustedContact},
};

/// Delivery boundary. The dispatcher is best-effort and does not dedupe;
/// at-most-once triggering per transition is the engine's job.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        contact: &TrustedContact,
        channel: Channel,
        message: &str,
    ) -> Result<(), AppError>;
}

/// Default dispatcher for local development: logs instead of delivering.
#[derive(Clone, Default)]
pub struct LogDispatcher;

impl LogDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(
        &self,
        contact: &TrustedContact,
        channel: Channel,
        message: &str,
    ) -> Result<(), AppError> {
        info!(
            contact = %contact.address,
            channel = channel.as_str(),
            message,
            "notification (log only)"
        );
        Ok(())
    }
}

/// Sends one Matrix DM per contact from a dedicated backend account.
/// Contacts on non-Matrix channels are left to the out-of-scope push/email/
/// SMS providers and skipped here with a warning.
///
/// The client is built and its session restored once, on the first send,
/// then shared across all subsequent sends.
#[derive(Clone)]
pub struct MatrixDispatcher {
    config: MatrixConfig,
    client: Arc<OnceCell<Client>>,
}

impl MatrixDispatcher {
    pub fn new(config: MatrixConfig) -> Self {
        Self {
            config,
            client: Arc::new(OnceCell::new()),
        }
    }

    async fn client(&self) -> Result<&Client, AppError> {
        self.client.get_or_try_init(|| self.prepare_client()).await
    }

    async fn prepare_client(&self) -> Result<Client, AppError> {
        let homeserver = Url::parse(&self.config.homeserver_url)
            .map_err(|err| AppError::Config(format!("invalid Matrix homeserver URL: {err}")))?;

        let client = Client::builder()
            .homeserver_url(homeserver)
            .build()
            .await
            .map_err(|err| AppError::Other(err.into()))?;

        let user_id = UserId::parse(&self.config.user_id)
            .map_err(|_| AppError::Config("Matrix user id is invalid".into()))?;
        let device_id = OwnedDeviceId::try_from(self.config.device_id.clone())
            .map_err(|_| AppError::Config("Matrix device id is invalid".into()))?;

        let session = MatrixSession {
            meta: SessionMeta {
                user_id: user_id.to_owned(),
                device_id,
            },
            tokens: MatrixSessionTokens {
                access_token: self.config.access_token.clone(),
                refresh_token: None,
            },
        };

        client
            .restore_session(session)
            .await
            .map_err(|err| AppError::Other(err.into()))?;

        Ok(client)
    }
}

#[async_trait]
impl NotificationDispatcher for MatrixDispatcher {
    async fn send(
        &self,
        contact: &TrustedContact,
        channel: Channel,
        message: &str,
    ) -> Result<(), AppError> {
        if channel != Channel::Matrix {
            warn!(
                contact = %contact.address,
                channel = channel.as_str(),
                "no transport wired for channel, skipping"
            );
            return Ok(());
        }

        let client = self.client().await?;
        let user_id = OwnedUserId::try_from(contact.address.clone()).map_err(|_| {
            AppError::NotificationDeliveryFailed(format!(
                "contact address is not a Matrix user id: {}",
                contact.address
            ))
        })?;

        let room = client
            .create_dm(user_id.as_ref())
            .await
            .map_err(|err| AppError::NotificationDeliveryFailed(err.to_string()))?;
        room.send(RoomMessageEventContent::text_plain(message))
            .await
            .map_err(|err| AppError::NotificationDeliveryFailed(err.to_string()))?;

        info!(contact = %contact.address, "Matrix DM sent");
        Ok(())
    }
}
