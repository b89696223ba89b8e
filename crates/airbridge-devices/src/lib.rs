/*!
 * AirBridge Devices
 *
 * This crate provides the protocol translation and state synchronization
 * engine for MQTT-controlled air treatment appliances: the wire codec, the
 * capability catalog, transports, device sessions with observer fan-out, and
 * reconnection supervision.
 */

#![warn(missing_docs)]

// Re-export core types
pub use airbridge_core::prelude;

pub mod catalog;
pub mod codec;
pub mod device;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;
pub mod transports;

pub use catalog::{CapabilityProfile, CatalogEntry, ProductSeries};
pub use device::{DeviceError, DeviceIdentity, Result, SessionState};
pub use reconnect::{ReconnectHandle, ReconnectPolicy, Reconnector};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use session::{DeviceSession, StateObserver, SubscriptionId};
pub use state::{DeviceState, FanSpeed, StateUpdate};
pub use transport::{TopicSet, Transport, TransportEvent, TransportExt, TransportOptions};

/// AirBridge devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), airbridge_core::error::Error> {
    tracing::info!(
        "AirBridge Devices {} initialized ({} transports, {} product families)",
        VERSION,
        available_transports().join(", "),
        catalog::entries().len()
    );
    Ok(())
}

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["loopback"];

    #[cfg(feature = "mqtt")]
    transports.push("mqtt");

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_transports() {
        let transports = available_transports();
        assert!(transports.contains(&"loopback"));
        #[cfg(feature = "mqtt")]
        assert!(transports.contains(&"mqtt"));
    }
}
