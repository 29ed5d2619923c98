//! Location samples.
//!
//! A [`LocationSample`] is one GPS reading tagged with the device identity and
//! the time it was captured. Samples are immutable once created.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in decimal degrees, positive north.
    pub latitude: f64,
    /// Longitude in decimal degrees, positive east.
    pub longitude: f64,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both coordinates are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One location reading from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// Identity of the device that produced the reading.
    pub device_id: String,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// When the reading was taken.
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    /// Create a sample captured now.
    #[must_use]
    pub fn new(device_id: impl Into<String>, position: Position) -> Self {
        Self::at(device_id, position, Utc::now())
    }

    /// Create a sample with an explicit capture time.
    #[must_use]
    pub fn at(device_id: impl Into<String>, position: Position, captured_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            latitude: position.latitude,
            longitude: position.longitude,
            captured_at,
        }
    }

    /// The coordinates of this sample.
    #[must_use]
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }

    /// Capture time as an ISO-8601 string with millisecond precision.
    #[must_use]
    pub fn timestamp_iso(&self) -> String {
        self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
