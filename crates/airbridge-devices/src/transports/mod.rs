/*!
 * Transport implementations for AirBridge.
 */

pub mod loopback;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use loopback::{LoopbackTransport, PublishedMessage};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
