//! Out-of-band emergency notification.
//!
//! When deliveries keep failing, the retry controller asks the
//! [`FallbackNotifier`] to text the configured emergency contact with the
//! device's last known coordinates. A failure here is reported back to the
//! caller and never escalated further.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::identity::EmergencyContact;
use crate::sample::LocationSample;
use crate::storage::{Storage, KEY_LAST_KNOWN_SAMPLE};

/// Default timeout for one SMS gateway request.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome reported by the SMS channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentStatus {
    /// The message was handed off for delivery.
    #[default]
    Sent,
    /// The send was cancelled before it went out.
    Cancelled,
    /// The channel cannot tell whether the message went out.
    Unknown,
}

impl std::fmt::Display for SentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors from the fallback notification path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// No emergency contact has been set up.
    #[error("no emergency contact configured")]
    NoContactConfigured,

    /// The SMS capability is not available on this device.
    #[error("SMS channel unavailable")]
    ChannelUnavailable,

    /// The channel reported that the message did not go out.
    #[error("emergency message not delivered (status: {0})")]
    NotDelivered(SentStatus),

    /// The SMS gateway failed.
    #[error("SMS gateway error: {0}")]
    Gateway(String),

    /// The emergency contact could not be read.
    #[error("failed to read emergency contact: {0}")]
    ContactLookup(String),
}

/// Platform SMS capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsChannel: Send + Sync {
    /// Whether this channel can send at all.
    async fn is_available(&self) -> bool;

    /// Send `body` to every number in `recipients`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Gateway`] if the channel fails.
    async fn send_text(
        &self,
        recipients: &[String],
        body: &str,
    ) -> std::result::Result<SentStatus, NotifyError>;
}

/// A channel for hosts with no SMS capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableChannel;

#[async_trait]
impl SmsChannel for UnavailableChannel {
    async fn is_available(&self) -> bool {
        false
    }

    async fn send_text(
        &self,
        _recipients: &[String],
        _body: &str,
    ) -> std::result::Result<SentStatus, NotifyError> {
        Err(NotifyError::ChannelUnavailable)
    }
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    recipients: &'a [String],
    body: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    status: SentStatus,
}

/// Sends SMS through an HTTP gateway.
///
/// The gateway receives `POST {url}` with `{"recipients": [..], "body": ".."}`
/// and may answer with `{"status": "sent" | "cancelled" | "unknown"}`.
#[derive(Debug, Clone)]
pub struct HttpSmsGateway {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpSmsGateway {
    /// Create a gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| Error::config(format!("invalid SMS gateway url '{url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SmsChannel for HttpSmsGateway {
    async fn is_available(&self) -> bool {
        true
    }

    async fn send_text(
        &self,
        recipients: &[String],
        body: &str,
    ) -> std::result::Result<SentStatus, NotifyError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&GatewayRequest { recipients, body })
            .send()
            .await
            .map_err(|e| NotifyError::Gateway(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NotifyError::Gateway(e.to_string()))?;

        if !status.is_success() {
            return Err(NotifyError::Gateway(format!("gateway returned {status}: {text}")));
        }

        let parsed: GatewayResponse = serde_json::from_str(&text).unwrap_or_default();
        Ok(parsed.status)
    }
}

/// Texts the emergency contact when deliveries keep failing.
#[derive(Clone)]
pub struct FallbackNotifier {
    storage: Arc<Storage>,
    channel: Arc<dyn SmsChannel>,
}

impl std::fmt::Debug for FallbackNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackNotifier")
            .field("storage", &self.storage.path())
            .finish_non_exhaustive()
    }
}

impl FallbackNotifier {
    /// Create a notifier reading the contact from `storage`.
    #[must_use]
    pub fn new(storage: Arc<Storage>, channel: Arc<dyn SmsChannel>) -> Self {
        Self { storage, channel }
    }

    /// The emergency message for `sample`.
    #[must_use]
    pub fn message_for(sample: &LocationSample) -> String {
        format!(
            "Emergency: Unable to send location for device {}. Last known coordinates - Latitude: {}, Longitude: {} (captured {})",
            sample.device_id,
            sample.latitude,
            sample.longitude,
            sample.timestamp_iso()
        )
    }

    /// Send one emergency message about `sample` to the configured contact.
    ///
    /// # Errors
    ///
    /// - [`NotifyError::NoContactConfigured`] if there is no contact
    /// - [`NotifyError::ChannelUnavailable`] if SMS cannot be sent here
    /// - [`NotifyError::NotDelivered`] if the channel cancelled the send
    /// - [`NotifyError::Gateway`] if the channel failed
    pub async fn notify(&self, sample: &LocationSample) -> std::result::Result<(), NotifyError> {
        let contact = EmergencyContact::load(&self.storage)
            .map_err(|e| NotifyError::ContactLookup(e.to_string()))?
            .ok_or(NotifyError::NoContactConfigured)?;

        if !self.channel.is_available().await {
            error!("SMS channel unavailable, emergency message not sent");
            return Err(NotifyError::ChannelUnavailable);
        }

        let body = Self::message_for(sample);
        let status = self
            .channel
            .send_text(std::slice::from_ref(&contact.phone_number), &body)
            .await?;

        if status == SentStatus::Cancelled {
            error!(contact = %contact.name, "Emergency message was cancelled");
            return Err(NotifyError::NotDelivered(status));
        }

        info!(contact = %contact.name, %status, "Emergency message sent");
        Ok(())
    }

    /// Send the emergency message for the last known location, regardless of
    /// delivery state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoKnownLocation`] if no sample has been captured yet,
    /// or the notification error.
    pub async fn alert_last_known(&self) -> Result<LocationSample> {
        let sample: LocationSample = self
            .storage
            .get_meta_json(KEY_LAST_KNOWN_SAMPLE)?
            .ok_or(Error::NoKnownLocation)?;
        self.notify(&sample).await?;
        Ok(sample)
    }
}
