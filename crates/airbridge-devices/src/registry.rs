/*!
 * Device registry for AirBridge.
 *
 * This module provides a registry of device sessions keyed by serial number.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};

use airbridge_core::config::{Config, TransportConfig};
use airbridge_core::logging::operation_span;

use crate::device::{DeviceError, DeviceIdentity, Result};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Event types for device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded(String),
    /// A device was removed from the registry
    DeviceRemoved(String),
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The registered sessions
    devices: RwLock<HashMap<String, Arc<DeviceSession>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

fn poisoned() -> DeviceError {
    DeviceError::InvalidState("Device registry lock poisoned".to_string())
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Build sessions for every configured device, using `transport_for` to
    /// create each device's transport
    ///
    /// A device whose transport cannot be created, for instance because its
    /// address is not known yet, is skipped with a warning. Invalid device
    /// entries still fail the whole configuration.
    pub fn from_config_with<F>(config: &Config, transport_for: F) -> Result<Self>
    where
        F: Fn(&DeviceIdentity, &TransportConfig) -> Result<Arc<dyn Transport>>,
    {
        let registry = Self::new();
        for device in &config.devices {
            let identity = DeviceIdentity::from_config(device)?;
            let transport = match transport_for(&identity, &config.transport) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Skipping device {}: {}", identity.serial, e);
                    continue;
                }
            };
            registry.register(Arc::new(DeviceSession::new(identity, transport)?))?;
        }
        info!("Loaded {} devices from configuration", registry.count());
        Ok(registry)
    }

    /// Build sessions for every configured device over MQTT
    #[cfg(feature = "mqtt")]
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::transport::TransportOptions;
        use crate::transports::MqttTransport;

        Self::from_config_with(config, |identity, transport| {
            let options = TransportOptions::for_device(identity, transport)?;
            Ok(Arc::new(MqttTransport::new(options)) as Arc<dyn Transport>)
        })
    }

    /// Register a session with the registry
    pub fn register(&self, session: Arc<DeviceSession>) -> Result<()> {
        let serial = session.serial().to_string();
        let mut devices = self.devices.write().map_err(|_| poisoned())?;

        if devices.contains_key(&serial) {
            return Err(DeviceError::Configuration(format!(
                "Device {} already registered",
                serial
            )));
        }

        devices.insert(serial.clone(), session);
        debug!("Registered device {}", serial);
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded(serial));

        Ok(())
    }

    /// Remove a session from the registry, returning it
    pub fn unregister(&self, serial: &str) -> Result<Arc<DeviceSession>> {
        let mut devices = self.devices.write().map_err(|_| poisoned())?;

        let session = devices.remove(serial).ok_or_else(|| {
            DeviceError::Configuration(format!("Device {} not registered", serial))
        })?;

        debug!("Unregistered device {}", serial);
        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceRemoved(serial.to_string()));

        Ok(session)
    }

    /// Get a session by serial number
    pub fn get(&self, serial: &str) -> Option<Arc<DeviceSession>> {
        self.devices.read().ok()?.get(serial).cloned()
    }

    /// All sessions, ordered by serial number
    pub fn list(&self) -> Vec<Arc<DeviceSession>> {
        let mut sessions: Vec<_> = match self.devices.read() {
            Ok(devices) => devices.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        sessions.sort_by(|a, b| a.serial().cmp(b.serial()));
        sessions
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Connect every session concurrently, continuing past failures
    ///
    /// Returns the serial numbers that failed along with their errors.
    pub async fn connect_all(&self) -> Vec<(String, DeviceError)> {
        self.connect_sessions()
            .instrument(operation_span("connect_all", "registry"))
            .await
    }

    async fn connect_sessions(&self) -> Vec<(String, DeviceError)> {
        let sessions = self.list();
        let attempts = sessions.iter().map(|session| async move {
            debug!("Connecting to device {}", session.serial());
            session
                .connect()
                .await
                .map_err(|e| (session.serial().to_string(), e))
        });

        let failures: Vec<(String, DeviceError)> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect();
        for (serial, e) in &failures {
            error!("Failed to connect to device {}: {}", serial, e);
        }

        info!(
            "Connected to {} of {} devices",
            sessions.len() - failures.len(),
            sessions.len()
        );
        failures
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) {
        let sessions = self.list();

        async {
            for session in &sessions {
                debug!("Disconnecting from device {}", session.serial());
                if let Err(e) = session.disconnect().await {
                    warn!("Failed to disconnect from device {}: {}", session.serial(), e);
                    // Continue with other devices even if one fails
                }
            }

            info!("Disconnected from {} devices", sessions.len());
        }
        .instrument(operation_span("disconnect_all", "registry"))
        .await
    }

    /// Count registered devices
    pub fn count(&self) -> usize {
        self.devices.read().map(|devices| devices.len()).unwrap_or(0)
    }

    /// Check if a device is registered
    pub fn contains(&self, serial: &str) -> bool {
        self.devices
            .read()
            .map(|devices| devices.contains_key(serial))
            .unwrap_or(false)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airbridge_core::config::DeviceConfig;

    use crate::transports::LoopbackTransport;

    fn device(serial: &str, address: Option<&str>) -> DeviceConfig {
        DeviceConfig {
            serial: serial.to_string(),
            product_type: "438".to_string(),
            address: address.map(str::to_string),
            credential: Some("cred".to_string()),
            password: None,
            name: None,
        }
    }

    fn loopback(_: &DeviceIdentity, _: &TransportConfig) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(LoopbackTransport::new()))
    }

    fn registry(devices: Vec<DeviceConfig>) -> DeviceRegistry {
        let config = Config {
            devices,
            ..Config::default()
        };
        DeviceRegistry::from_config_with(&config, loopback).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry(vec![device("B", Some("10.0.0.2")), device("A", Some("10.0.0.1"))]);
        assert_eq!(registry.count(), 2);
        assert!(registry.contains("A"));
        assert!(registry.get("missing").is_none());

        let serials: Vec<_> = registry.list().iter().map(|s| s.serial().to_string()).collect();
        assert_eq!(serials, vec!["A", "B"]);

        let duplicate = registry.get("A").unwrap();
        assert!(matches!(registry.register(duplicate), Err(DeviceError::Configuration(_))));
    }

    #[test]
    fn test_unregister_emits_event() {
        let registry = registry(vec![device("A", Some("10.0.0.1"))]);
        let mut events = registry.subscribe();

        let session = registry.unregister("A").unwrap();
        assert_eq!(session.serial(), "A");
        assert_eq!(registry.count(), 0);
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::DeviceRemoved("A".into()));
        assert!(registry.unregister("A").is_err());
    }

    #[test]
    fn test_unsupported_product_in_config() {
        let mut bad = device("A", Some("10.0.0.1"));
        bad.product_type = "999".to_string();
        let config = Config {
            devices: vec![bad],
            ..Config::default()
        };
        let result = DeviceRegistry::from_config_with(&config, loopback);
        assert!(matches!(result, Err(DeviceError::UnsupportedProductType(_))));
    }

    #[tokio::test]
    async fn test_connect_all_continues_past_failures() {
        let registry = registry(vec![device("A", None), device("B", Some("10.0.0.2"))]);

        let failures = registry.connect_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "A");
        assert!(matches!(failures[0].1, DeviceError::Configuration(_)));
        assert!(registry.get("B").unwrap().is_connected());

        registry.disconnect_all().await;
        assert!(!registry.get("B").unwrap().is_connected());
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn test_from_config_builds_mqtt_sessions() {
        let config = Config {
            devices: vec![device("A", Some("10.0.0.1"))],
            ..Config::default()
        };
        let registry = DeviceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.get("A").unwrap().transport().name(), "mqtt");

        let config = Config {
            devices: vec![device("A", None), device("B", Some("10.0.0.2"))],
            ..Config::default()
        };
        let registry = DeviceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.count(), 1);
        assert!(!registry.contains("A"));
        assert!(registry.contains("B"));
    }

    #[test]
    fn test_transport_failure_skips_only_that_device() {
        let config = Config {
            devices: vec![device("A", Some("10.0.0.1")), device("B", Some("10.0.0.2"))],
            ..Config::default()
        };
        let registry = DeviceRegistry::from_config_with(&config, |identity, config| {
            if identity.serial == "A" {
                return Err(DeviceError::Configuration("no route".into()));
            }
            loopback(identity, config)
        })
        .unwrap();

        let serials: Vec<_> = registry.list().iter().map(|s| s.serial().to_string()).collect();
        assert_eq!(serials, vec!["B"]);
    }
}
