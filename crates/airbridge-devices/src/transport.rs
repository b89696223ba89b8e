/*!
 * Transport abstraction for AirBridge.
 *
 * A transport owns one authenticated session with a device broker. It offers
 * subscribe/publish primitives and reports everything that happens on the
 * connection as a stream of `TransportEvent`s. It never retries on its own;
 * reconnection belongs to the caller.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

use airbridge_core::config::TransportConfig;

use crate::codec::{self, StateCommand};
use crate::device::{DeviceError, DeviceIdentity, Result};

/// Client id prefix used for every broker session
pub const CLIENT_ID_PREFIX: &str = "airbridge-";

/// Bounds for the keep-alive interval
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const MAX_KEEP_ALIVE: Duration = Duration::from_secs(300);

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
    /// Payload parsed as JSON, `None` when it is not valid JSON
    pub data: Option<Value>,
}

impl InboundMessage {
    /// Wrap a raw payload, parsing it as JSON when possible
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let data = serde_json::from_slice(&payload).ok();
        Self {
            topic: topic.into(),
            payload,
            data,
        }
    }
}

/// Something that happened on a transport connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker acknowledged the session
    Connected,
    /// The session was lost or torn down
    Disconnected,
    /// A message arrived
    Message(InboundMessage),
    /// A transport error after the session was established
    Error(String),
    /// The connection is closed for good; no further events follow until the
    /// next `connect()`
    Closed,
    /// A lower layer is trying to re-establish the session
    ReconnectAttempt,
}

/// Connection parameters for one device broker
#[derive(Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client id
    pub client_id: String,
    /// Username, the device serial
    pub username: String,
    /// Password, the local credential
    pub password: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Deadline for the broker to acknowledge the session
    pub connect_timeout: Duration,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl TransportOptions {
    /// Options for a device using the configured transport settings
    ///
    /// Fails when the device has no known address.
    pub fn for_device(identity: &DeviceIdentity, config: &TransportConfig) -> Result<Self> {
        let host = identity.address.clone().ok_or_else(|| {
            DeviceError::Configuration(format!(
                "No network address known for device {}",
                identity.serial
            ))
        })?;

        Ok(Self {
            host,
            port: config.port,
            client_id: new_client_id(),
            username: identity.serial.clone(),
            password: identity.credential.clone(),
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            event_capacity: config.event_capacity.max(1),
        }
        .normalized())
    }

    /// Set the broker port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keep-alive interval, clamped to the supported range
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.keep_alive = self.keep_alive.clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE);
        self
    }
}

impl Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

/// A fresh, unique client id
pub fn new_client_id() -> String {
    format!("{}{}", CLIENT_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Transport trait for device broker sessions
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Transport name, for logs
    fn name(&self) -> &'static str;

    /// Open the session
    ///
    /// Resolves once the broker acknowledges the session. Idempotent while
    /// connected. A failure leaves the transport clean and reusable.
    async fn connect(&self) -> Result<()>;

    /// Close the session; a no-op when not connected
    async fn disconnect(&self) -> Result<()>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Unsubscribe from a topic
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish a JSON payload, resolving once it has been handed to the broker
    async fn publish(&self, topic: &str, payload: &Value) -> Result<()>;

    /// Whether a session is currently established
    fn is_connected(&self) -> bool;

    /// Topics currently subscribed
    fn subscriptions(&self) -> Vec<String>;

    /// A new receiver for connection events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// The two fixed channels of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSet {
    /// Device to client state broadcasts
    pub status: String,
    /// Client to device commands
    pub command: String,
}

impl TopicSet {
    /// Channels for a device of the given family
    pub fn new(product_type: &str, serial: &str) -> Self {
        Self {
            status: format!("{}/{}/status/current", product_type, serial),
            command: format!("{}/{}/command", product_type, serial),
        }
    }

    /// Channels for a device identity
    pub fn for_device(identity: &DeviceIdentity) -> Self {
        Self::new(&identity.product_type, &identity.serial)
    }
}

/// Device-level operations built on the raw transport primitives
#[async_trait]
pub trait TransportExt: Transport {
    /// Subscribe to the device's status channel
    async fn subscribe_status(&self, topics: &TopicSet) -> Result<()> {
        self.subscribe(&topics.status).await
    }

    /// Publish a state-set command on the device's command channel
    async fn publish_command(&self, topics: &TopicSet, command: &StateCommand) -> Result<()> {
        let envelope = codec::encode_command(command);
        self.publish(&topics.command, &envelope.to_value()).await
    }

    /// Ask the device for a full state snapshot
    async fn request_current_state(&self, topics: &TopicSet) -> Result<()> {
        let request = codec::request_current_state();
        self.publish(&topics.command, &request.to_value()).await
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("NK6-EU-MHA0000A", "438", Some("192.168.1.20".into()), "secret")
    }

    #[test]
    fn test_topics() {
        let topics = TopicSet::for_device(&identity());
        assert_eq!(topics.status, "438/NK6-EU-MHA0000A/status/current");
        assert_eq!(topics.command, "438/NK6-EU-MHA0000A/command");
    }

    #[test]
    fn test_options_for_device() {
        let options = TransportOptions::for_device(&identity(), &TransportConfig::default()).unwrap();
        assert_eq!(options.host, "192.168.1.20");
        assert_eq!(options.port, 1883);
        assert_eq!(options.username, "NK6-EU-MHA0000A");
        assert_eq!(options.password, "secret");
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.client_id.starts_with(CLIENT_ID_PREFIX));
        assert!(!format!("{:?}", options).contains("secret"));
    }

    #[test]
    fn test_options_require_address() {
        let mut identity = identity();
        identity.address = None;
        let result = TransportOptions::for_device(&identity, &TransportConfig::default());
        assert!(matches!(result, Err(DeviceError::Configuration(_))));
    }

    #[test]
    fn test_keep_alive_is_bounded() {
        let options = TransportOptions::for_device(&identity(), &TransportConfig::default())
            .unwrap()
            .with_keep_alive(Duration::from_secs(1));
        assert_eq!(options.keep_alive, MIN_KEEP_ALIVE);
        let options = options.with_keep_alive(Duration::from_secs(3600));
        assert_eq!(options.keep_alive, MAX_KEEP_ALIVE);
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(new_client_id(), new_client_id());
    }

    #[test]
    fn test_inbound_message_parsing() {
        let message = InboundMessage::new("t", br#"{"msg":"STATE-CHANGE"}"#.to_vec());
        assert_eq!(message.data.unwrap()["msg"], "STATE-CHANGE");

        let garbage = InboundMessage::new("t", b"not json".to_vec());
        assert!(garbage.data.is_none());
        assert_eq!(&garbage.payload[..], b"not json");
    }
}
