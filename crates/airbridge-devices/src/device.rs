/*!
 * Device identity, lifecycle states and the device error type.
 *
 * This module defines the types shared by the codec, the transports and the
 * device session.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use airbridge_core::config::DeviceConfig;
use airbridge_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The operation needs an active session and there is none
    #[error("Device not connected: call connect() first")]
    NotConnected,

    /// The device entry is incomplete or invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No capability profile is known for the product type
    #[error("Unsupported product type: {0}")]
    UnsupportedProductType(String),

    /// The broker did not answer before the deadline
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Broker unreachable, authentication rejected, or a request failed on the wire
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The device is in an invalid state for the operation
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

/// Connection lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No session with the device broker
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// The broker acknowledged the session and the status channel is subscribed
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Immutable identity of a physical device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Serial number, also the MQTT username
    pub serial: String,
    /// Product family code selecting the capability profile
    pub product_type: String,
    /// Host name or IP address of the device broker
    pub address: Option<String>,
    /// Local credential, the MQTT password
    pub credential: String,
    /// Display name
    pub name: Option<String>,
}

impl DeviceIdentity {
    /// Create a new identity
    pub fn new(
        serial: impl Into<String>,
        product_type: impl Into<String>,
        address: Option<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            serial: serial.into(),
            product_type: product_type.into(),
            address,
            credential: credential.into(),
            name: None,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build an identity from a configured device entry
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let credential = config.local_credential()?;
        Ok(Self {
            serial: config.serial.clone(),
            product_type: config.product_type.clone(),
            address: config.address.clone(),
            credential,
            name: config.name.clone(),
        })
    }

    /// Display name, falling back to the serial number
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.serial)
    }
}

// The credential never ends up in logs
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("serial", &self.serial)
            .field("product_type", &self.product_type)
            .field("address", &self.address)
            .field("credential", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}
