//! Delivery of one sample to the remote collector.
//!
//! A transmitter makes exactly one request per call and never retries; the
//! retry controller decides what happens after a failure. Every send is
//! raced against a hard deadline that is independent of the HTTP client's own
//! timeouts. If the deadline wins, the request is dropped and any later
//! response is never observed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sample::LocationSample;

/// Default hard deadline for one delivery attempt.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Collector endpoint that stores location pings.
pub const DEVICE_LOCATION_PATH: &str = "api/device-location";

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitErrorKind {
    /// The deadline elapsed before the collector answered.
    Timeout,
    /// The request could not be sent or the response could not be read.
    NetworkFailure,
    /// The collector answered with a non-2xx status.
    RemoteRejected(u16),
}

impl std::fmt::Display for TransmitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NetworkFailure => write!(f, "network failure"),
            Self::RemoteRejected(status) => write!(f, "rejected with status {status}"),
        }
    }
}

/// A failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transmit failed ({kind}): {message}")]
pub struct TransmitError {
    /// Failure category.
    pub kind: TransmitErrorKind,
    /// Detail for logs.
    pub message: String,
}

impl TransmitError {
    /// The deadline elapsed.
    #[must_use]
    pub fn timeout(deadline: Duration) -> Self {
        Self {
            kind: TransmitErrorKind::Timeout,
            message: format!("no response within {deadline:?}"),
        }
    }

    /// Transport-level failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: TransmitErrorKind::NetworkFailure,
            message: message.into(),
        }
    }

    /// The collector refused the sample.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: TransmitErrorKind::RemoteRejected(status),
            message: message.into(),
        }
    }
}

/// Collector acknowledgement of a stored sample.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Ack {
    /// Message returned by the collector.
    #[serde(default)]
    pub message: String,
}

/// Sends a single sample to the collector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transmit: Send + Sync {
    /// Deliver `sample`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransmitError`] describing why delivery failed.
    async fn send(&self, sample: &LocationSample) -> std::result::Result<Ack, TransmitError>;
}

/// Run `fut`, failing with [`TransmitErrorKind::Timeout`] if it does not
/// finish within `deadline`. The losing future is dropped.
///
/// # Errors
///
/// Returns the future's own error, or a timeout error.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> std::result::Result<T, TransmitError>
where
    F: Future<Output = std::result::Result<T, TransmitError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransmitError::timeout(deadline)),
    }
}

/// Request body for `POST /api/device-location`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceLocationPayload<'a> {
    device_id: &'a str,
    latitude: f64,
    longitude: f64,
    timestamp: String,
}

impl<'a> From<&'a LocationSample> for DeviceLocationPayload<'a> {
    fn from(sample: &'a LocationSample) -> Self {
        Self {
            device_id: &sample.device_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.timestamp_iso(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectorErrorBody {
    error: String,
}

/// Delivers samples to the collector over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransmitter {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    timeout: Duration,
}

/// Build the device-location endpoint under `base_url`, keeping any path
/// prefix the base already has.
///
/// # Errors
///
/// Returns [`Error::ConfigValidation`] if the URL does not parse.
pub fn endpoint_url(base_url: &str) -> Result<reqwest::Url> {
    let joined = format!("{}/{DEVICE_LOCATION_PATH}", base_url.trim_end_matches('/'));
    reqwest::Url::parse(&joined)
        .map_err(|e| Error::config(format!("invalid collector url '{base_url}': {e}")))
}

impl HttpTransmitter {
    /// Create a transmitter for the collector at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint_url(base_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    /// The URL samples are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    async fn post(&self, sample: &LocationSample) -> std::result::Result<Ack, TransmitError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&DeviceLocationPayload::from(sample))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        if status.is_success() {
            // The collector has stored the sample; an odd body must not cause a resend.
            return Ok(serde_json::from_str(&body).unwrap_or_default());
        }

        let message = serde_json::from_str::<CollectorErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(TransmitError::rejected(status.as_u16(), message))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransmitError {
    if err.is_timeout() {
        TransmitError {
            kind: TransmitErrorKind::Timeout,
            message: err.to_string(),
        }
    } else {
        TransmitError::network(err.to_string())
    }
}

#[async_trait]
impl Transmit for HttpTransmitter {
    async fn send(&self, sample: &LocationSample) -> std::result::Result<Ack, TransmitError> {
        debug!(endpoint = %self.endpoint, device_id = %sample.device_id, "Sending sample");
        with_deadline(self.timeout, self.post(sample)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Position;
    use crate::test_support::{closed_url, serve_once};

    fn sample() -> LocationSample {
        LocationSample::new("device_test", Position::new(51.5, -0.12))
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("http://10.0.0.5:3000").unwrap().as_str(),
            "http://10.0.0.5:3000/api/device-location"
        );
        assert_eq!(
            endpoint_url("https://example.com/collector/").unwrap().as_str(),
            "https://example.com/collector/api/device-location"
        );
        assert!(endpoint_url("not a url").is_err());
    }

    #[test]
    fn test_payload_shape() {
        let sample = sample();
        let json = serde_json::to_value(DeviceLocationPayload::from(&sample)).unwrap();

        assert_eq!(json["deviceId"], "device_test");
        assert_eq!(json["latitude"], 51.5);
        assert_eq!(json["longitude"], -0.12);
        assert_eq!(json["timestamp"], sample.timestamp_iso());
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(TransmitErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(
            TransmitErrorKind::RemoteRejected(500).to_string(),
            "rejected with status 500"
        );
        let err = TransmitError::network("connection refused");
        assert!(err.to_string().contains("network failure"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_discards_late_success() {
        let late = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TransmitError>(Ack {
                message: "stored".to_string(),
            })
        };

        let err = with_deadline(Duration::from_secs(5), late).await.unwrap_err();
        assert_eq!(err.kind, TransmitErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passes_fast_result() {
        let fast = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Err::<Ack, _>(TransmitError::rejected(500, "boom"))
        };

        let err = with_deadline(Duration::from_secs(5), fast).await.unwrap_err();
        assert_eq!(err.kind, TransmitErrorKind::RemoteRejected(500));
    }

    #[tokio::test]
    async fn test_send_success() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"message":"Device location stored successfully"}"#,
            Duration::ZERO,
        )
        .await;

        let transmitter = HttpTransmitter::new(&base, Duration::from_secs(5)).unwrap();
        let ack = transmitter.send(&sample()).await.unwrap();
        assert_eq!(ack.message, "Device location stored successfully");

        let request: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request["deviceId"], "device_test");
    }

    #[tokio::test]
    async fn test_send_success_with_unexpected_body() {
        let (base, _server) = serve_once("200 OK", "ok", Duration::ZERO).await;

        let transmitter = HttpTransmitter::new(&base, Duration::from_secs(5)).unwrap();
        let ack = transmitter.send(&sample()).await.unwrap();
        assert_eq!(ack, Ack::default());
    }

    #[tokio::test]
    async fn test_send_remote_rejected() {
        let (base, _server) = serve_once(
            "500 Internal Server Error",
            r#"{"error":"Failed to store device location"}"#,
            Duration::ZERO,
        )
        .await;

        let transmitter = HttpTransmitter::new(&base, Duration::from_secs(5)).unwrap();
        let err = transmitter.send(&sample()).await.unwrap_err();
        assert_eq!(err.kind, TransmitErrorKind::RemoteRejected(500));
        assert_eq!(err.message, "Failed to store device location");
    }

    #[tokio::test]
    async fn test_send_times_out_even_if_response_arrives_later() {
        let (base, _server) = serve_once(
            "200 OK",
            r#"{"message":"stored"}"#,
            Duration::from_secs(2),
        )
        .await;

        let transmitter = HttpTransmitter::new(&base, Duration::from_millis(200)).unwrap();
        let err = transmitter.send(&sample()).await.unwrap_err();
        assert_eq!(err.kind, TransmitErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_send_network_failure() {
        let base = closed_url().await;

        let transmitter = HttpTransmitter::new(&base, Duration::from_secs(5)).unwrap();
        let err = transmitter.send(&sample()).await.unwrap_err();
        assert_eq!(err.kind, TransmitErrorKind::NetworkFailure);
    }
}
