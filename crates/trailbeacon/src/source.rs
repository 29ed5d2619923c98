//! Sample acquisition.
//!
//! A [`PositionProvider`] wraps whatever the platform offers for getting a
//! position fix. [`SampleSource`] turns fixes into [`LocationSample`] values,
//! bounding each acquisition with a timeout. A failed acquisition is not
//! retried here: the next scheduled tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::identity::DeviceIdentity;
use crate::sample::{LocationSample, Position};

/// Default bound on how long one position fix may take.
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while acquiring a position fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    /// No fix arrived within the acquisition timeout.
    #[error("no position fix within {0:?}")]
    Timeout(Duration),

    /// The positioning service could not be reached.
    #[error("positioning unavailable: {0}")]
    Unavailable(String),

    /// The positioning service answered but had no usable fix.
    #[error("no position fix available: {0}")]
    NoFix(String),
}

/// Platform access to the current position.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Obtain the current position.
    ///
    /// # Errors
    ///
    /// Returns an [`AcquisitionError`] if no fix can be obtained.
    async fn current_position(&self) -> Result<Position, AcquisitionError>;
}

/// Produces location samples for this device.
#[derive(Clone)]
pub struct SampleSource {
    provider: Arc<dyn PositionProvider>,
    identity: DeviceIdentity,
    acquisition_timeout: Duration,
}

impl std::fmt::Debug for SampleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSource")
            .field("provider", &self.provider.name())
            .field("device_id", &self.identity.device_id)
            .field("acquisition_timeout", &self.acquisition_timeout)
            .finish()
    }
}

impl SampleSource {
    /// Create a sample source.
    #[must_use]
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        identity: DeviceIdentity,
        acquisition_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            identity,
            acquisition_timeout,
        }
    }

    /// Take one reading.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError::Timeout`] if the provider does not answer
    /// within the acquisition timeout, or the provider's own error.
    pub async fn produce(&self) -> Result<LocationSample, AcquisitionError> {
        let position =
            match tokio::time::timeout(self.acquisition_timeout, self.provider.current_position())
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(AcquisitionError::Timeout(self.acquisition_timeout)),
            };

        if !position.is_valid() {
            return Err(AcquisitionError::NoFix(format!(
                "provider '{}' returned out-of-range coordinates",
                self.provider.name()
            )));
        }

        debug!(
            provider = self.provider.name(),
            latitude = position.latitude,
            longitude = position.longitude,
            "Acquired position"
        );
        Ok(LocationSample::new(&self.identity.device_id, position))
    }
}

/// A provider that always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedProvider {
    position: Position,
}

impl FixedProvider {
    /// Create a provider for a stationary device.
    #[must_use]
    pub const fn new(position: Position) -> Self {
        Self { position }
    }
}

#[async_trait]
impl PositionProvider for FixedProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn current_position(&self) -> Result<Position, AcquisitionError> {
        Ok(self.position)
    }
}

/// Reads fixes from a gpsd daemon over its JSON socket protocol.
#[derive(Debug, Clone)]
pub struct GpsdProvider {
    address: String,
}

const GPSD_WATCH: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// The subset of a gpsd report this provider reads.
#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
}

impl GpsdProvider {
    /// Create a provider for the gpsd instance at `address` (`host:port`).
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Extract a 2D or 3D fix from one line of gpsd output.
    fn parse_fix(line: &str) -> Option<Position> {
        let report: GpsdReport = serde_json::from_str(line).ok()?;
        if report.class != "TPV" || report.mode < 2 {
            return None;
        }
        Some(Position::new(report.lat?, report.lon?))
    }
}

#[async_trait]
impl PositionProvider for GpsdProvider {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    async fn current_position(&self) -> Result<Position, AcquisitionError> {
        let mut stream = TcpStream::connect(&self.address).await.map_err(|e| {
            AcquisitionError::Unavailable(format!("cannot reach gpsd at {}: {e}", self.address))
        })?;
        stream
            .write_all(GPSD_WATCH)
            .await
            .map_err(|e| AcquisitionError::Unavailable(e.to_string()))?;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AcquisitionError::Unavailable(e.to_string()))?
        {
            trace!(line = %line, "gpsd report");
            if let Some(position) = Self::parse_fix(&line) {
                return Ok(position);
            }
        }

        Err(AcquisitionError::NoFix(
            "gpsd closed the connection before reporting a fix".to_string(),
        ))
    }
}
