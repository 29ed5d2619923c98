//! Long-lived device settings: the device identity and the emergency contact.
//!
//! Both are created outside the pipeline and only read by it.

use std::sync::OnceLock;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::{Storage, KEY_DEVICE_ID, KEY_EMERGENCY_CONTACT};

/// Characters used for the random suffix of generated device ids.
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 5;

/// Identity of this installation. Generated once, then never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// The device id reported with every sample.
    pub device_id: String,
}

impl DeviceIdentity {
    /// Load the persisted identity, generating and storing one on first use.
    ///
    /// Concurrent first runs against the same database agree on one id: the
    /// first stored value wins and every caller returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_or_create(storage: &Storage) -> Result<Self> {
        if let Some(device_id) = storage.get_meta(KEY_DEVICE_ID)? {
            return Ok(Self { device_id });
        }

        let candidate = Self::generate();
        let device_id = storage.insert_meta_if_absent(KEY_DEVICE_ID, &candidate.device_id)?;
        if device_id == candidate.device_id {
            info!(device_id = %device_id, "Generated new device identity");
        }
        Ok(Self { device_id })
    }

    /// Generate a fresh `device_<unix-millis>_<suffix>` identity.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| char::from(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())]))
            .collect();
        Self {
            device_id: format!("device_{}_{suffix}", Utc::now().timestamp_millis()),
        }
    }
}

/// The person to text when location reports stop getting through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    /// Display name.
    pub name: String,
    /// Phone number the alert is sent to.
    pub phone_number: String,
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+?[0-9(][0-9 ()\-]{2,}[0-9]$").expect("Invalid regex pattern"))
}

impl EmergencyContact {
    /// Create a validated contact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContact`] if the name is blank or the phone
    /// number is not a plausible dialable number.
    pub fn new(name: impl Into<String>, phone_number: impl Into<String>) -> Result<Self> {
        let name = name.into().trim().to_string();
        let phone_number = phone_number.into().trim().to_string();

        if name.is_empty() {
            return Err(Error::invalid_contact("name must not be empty"));
        }
        if !phone_pattern().is_match(&phone_number) {
            return Err(Error::invalid_contact(format!(
                "'{phone_number}' is not a valid phone number"
            )));
        }

        Ok(Self { name, phone_number })
    }

    /// Load the configured contact, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored value
    /// is corrupt.
    pub fn load(storage: &Storage) -> Result<Option<Self>> {
        storage.get_meta_json(KEY_EMERGENCY_CONTACT)
    }

    /// Persist this contact, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save(&self, storage: &Storage) -> Result<()> {
        storage.set_meta_json(KEY_EMERGENCY_CONTACT, self)
    }

    /// Remove the configured contact. Returns `true` if one was set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear(storage: &Storage) -> Result<bool> {
        storage.delete_meta(KEY_EMERGENCY_CONTACT)
    }
}
