/*!
 * Device session.
 *
 * A `DeviceSession` binds one physical device to one transport. It drives the
 * connection lifecycle, turns user intents into wire commands, merges inbound
 * state broadcasts into a `DeviceState` snapshot and fans every change out to
 * its observers.
 *
 * Inbound events are handled by a single pump task per connection, in the
 * order the transport delivered them. State mutation and observer callbacks
 * happen synchronously inside `handle_transport_event`.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument, Span};

use airbridge_core::logging;

use crate::catalog::{self, CapabilityProfile, CatalogEntry, JetFocus};
use crate::codec::{self, FanMode, MessageType, StateCommand};
use crate::device::{DeviceError, DeviceIdentity, Result, SessionState};
use crate::state::{DeviceState, FanSpeed};
use crate::transport::{InboundMessage, TopicSet, Transport, TransportEvent, TransportExt};

/// Default oscillation bounds for products without configurable angles
const DEFAULT_OSCILLATION_ANGLES: (u16, u16) = (5, 355);

/// Callback invoked with the complete state after every change
pub type StateObserver = Arc<dyn Fn(&DeviceState) + Send + Sync>;

/// Handle returned by `DeviceSession::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    state: DeviceState,
    session_state: SessionState,
    /// Speed re-asserted when automatic mode is switched off
    last_speed: u8,
}

/// A live, stateful connection to one device
pub struct DeviceSession {
    identity: DeviceIdentity,
    entry: &'static CatalogEntry,
    topics: TopicSet,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<(SubscriptionId, StateObserver)>>,
    next_subscription: AtomicU64,
    /// Held while merging and notifying so snapshots reach observers in order
    dispatch: Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Set by `disconnect()`, cleared by `connect()`
    closed_by_caller: AtomicBool,
    /// Bumped by every `disconnect()`; a connect started under an older value is void
    teardowns: AtomicU64,
    span: Span,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("model", &self.entry.model)
            .field("transport", &self.transport.name())
            .field("session_state", &self.session_state())
            .finish()
    }
}

impl DeviceSession {
    /// Create a session for a device
    ///
    /// Fails with `UnsupportedProductType` when the family code is not in the
    /// catalog.
    pub fn new(identity: DeviceIdentity, transport: Arc<dyn Transport>) -> Result<Self> {
        let entry = catalog::lookup(&identity.product_type)
            .ok_or_else(|| DeviceError::UnsupportedProductType(identity.product_type.clone()))?;

        let span = logging::device_span(&identity.serial, &identity.product_type);
        Ok(Self {
            topics: TopicSet::for_device(&identity),
            identity,
            entry,
            transport,
            inner: Mutex::new(Inner {
                state: DeviceState::default(),
                session_state: SessionState::Disconnected,
                last_speed: FanSpeed::MIN_LEVEL,
            }),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            dispatch: Mutex::new(()),
            pump: Mutex::new(None),
            closed_by_caller: AtomicBool::new(false),
            teardowns: AtomicU64::new(0),
            span,
        })
    }

    /// Device identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Serial number
    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    /// Catalog entry of the product family
    pub fn catalog_entry(&self) -> &'static CatalogEntry {
        self.entry
    }

    /// Capability profile of the product family
    pub fn profile(&self) -> &'static CapabilityProfile {
        &self.entry.profile
    }

    /// Status and command channels
    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DeviceState {
        lock(&self.inner).state.clone()
    }

    /// Connection lifecycle state
    pub fn session_state(&self) -> SessionState {
        lock(&self.inner).session_state
    }

    /// Whether the session is connected
    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    /// Whether the last teardown was requested through `disconnect()`
    pub fn closed_by_caller(&self) -> bool {
        self.closed_by_caller.load(Ordering::SeqCst)
    }

    /// Register an observer; it is called with the full state after every change
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    /// Connect to the device
    ///
    /// Connects the transport, subscribes to the status channel and asks for
    /// the current state. Transport errors are returned unchanged.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.identity.address.is_none() {
            return Err(DeviceError::Configuration(format!(
                "No network address known for device {}",
                self.identity.serial
            )));
        }

        {
            let mut inner = lock(&self.inner);
            if inner.session_state == SessionState::Connected && self.transport.is_connected() {
                return Ok(());
            }
            inner.session_state = SessionState::Connecting;
        }
        self.closed_by_caller.store(false, Ordering::SeqCst);
        let epoch = self.teardowns.load(Ordering::SeqCst);

        let span = self.span.clone();
        async {
            debug!("Connecting to {}", self.identity.display_name());
            self.start_pump();

            if let Err(e) = self.open().await {
                warn!("Connection to {} failed: {}", self.identity.display_name(), e);
                self.abandon_connect(epoch).await;
                return Err(e);
            }

            if !self.complete_connect(epoch) {
                info!("Disconnect requested while connecting to {}", self.identity.display_name());
                self.abandon_connect(epoch).await;
                return Err(DeviceError::InvalidState(
                    "Disconnected while the connection was being established".to_string(),
                ));
            }
            info!("Connected to {}", self.identity.display_name());
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn open(&self) -> Result<()> {
        self.transport.connect().await?;
        self.transport.subscribe_status(&self.topics).await?;
        self.transport.request_current_state(&self.topics).await
    }

    /// Mark the session connected unless a disconnect happened since `epoch`
    ///
    /// The check and the transition share the dispatch and state locks, so a
    /// concurrent `disconnect()` either voids this attempt or follows it.
    fn complete_connect(&self, epoch: u64) -> bool {
        let _dispatch = lock(&self.dispatch);
        let snapshot = {
            let mut inner = lock(&self.inner);
            if self.teardowns.load(Ordering::SeqCst) != epoch {
                return false;
            }
            inner.session_state = SessionState::Connected;
            if !inner.state.set_connected(true) {
                return true;
            }
            inner.state.clone()
        };
        self.notify(&snapshot);
        true
    }

    /// Undo a connection attempt that failed or was overtaken by a disconnect
    async fn abandon_connect(&self, epoch: u64) {
        let superseded = self.teardowns.load(Ordering::SeqCst) != epoch;
        if !superseded {
            self.stop_pump();
        }
        // A newer connect() owns the transport once the caller flag is cleared
        let owns_transport = !superseded || self.closed_by_caller();
        if owns_transport && self.transport.is_connected() {
            let _ = self.transport.disconnect().await;
        }
        if !superseded {
            lock(&self.inner).session_state = SessionState::Disconnected;
        }
    }

    /// Disconnect from the device
    ///
    /// Observers see exactly one change to `connected = false`, no matter
    /// whether the transport reports the drop as well.
    pub async fn disconnect(&self) -> Result<()> {
        self.closed_by_caller.store(true, Ordering::SeqCst);
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        let result = self.transport.disconnect().instrument(self.span.clone()).await;
        self.stop_pump();
        self.mark_disconnected();
        let _enter = self.span.enter();
        info!("Disconnected from {}", self.identity.display_name());
        result
    }

    /// Handle one transport event
    ///
    /// Called by the pump task for every event in delivery order.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        let _enter = self.span.enter();
        match event {
            TransportEvent::Message(message) => self.handle_message(&message),
            TransportEvent::Disconnected | TransportEvent::Closed => self.mark_disconnected(),
            TransportEvent::Error(e) => warn!("Transport error: {}", e),
            TransportEvent::ReconnectAttempt => debug!("Transport reconnecting"),
            TransportEvent::Connected => trace!("Transport session established"),
        }
    }

    fn handle_message(&self, message: &InboundMessage) {
        if message.topic != self.topics.status {
            trace!(topic = %message.topic, "Ignoring message on foreign topic");
            return;
        }
        let Some(data) = &message.data else {
            trace!("Ignoring malformed payload ({} bytes)", message.payload.len());
            return;
        };
        match MessageType::of(data) {
            Some(kind) if kind.carries_state() => {
                let mut update = codec::decode_state(data);
                self.profile().retain_supported(&mut update);
                self.merge_and_notify(|state| state.merge(&update));
            }
            kind => trace!("Ignoring message of type {:?}", kind),
        }
    }

    fn mark_disconnected(&self) {
        lock(&self.inner).session_state = SessionState::Disconnected;
        self.update_connected(false);
    }

    fn update_connected(&self, connected: bool) {
        let _dispatch = lock(&self.dispatch);
        let snapshot = {
            let mut inner = lock(&self.inner);
            if !inner.state.set_connected(connected) {
                return;
            }
            inner.state.clone()
        };
        self.notify(&snapshot);
    }

    fn merge_and_notify(&self, apply: impl FnOnce(&mut DeviceState)) {
        let _dispatch = lock(&self.dispatch);
        let snapshot = {
            let mut inner = lock(&self.inner);
            apply(&mut inner.state);
            if let Some(level) = inner.state.last_explicit_speed() {
                inner.last_speed = level;
            }
            inner.state.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &DeviceState) {
        // Callbacks may subscribe or unsubscribe, so they run on a copy
        let observers: Vec<StateObserver> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(snapshot);
        }
    }

    fn start_pump(self: &Arc<Self>) {
        let events = self.transport.events();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(Self::pump(session, events).instrument(self.span.clone()));
        if let Some(previous) = lock(&self.pump).replace(task) {
            previous.abort();
        }
    }

    fn stop_pump(&self) {
        if let Some(task) = lock(&self.pump).take() {
            task.abort();
        }
    }

    async fn pump(session: Weak<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event receiver lagged, {} events skipped", skipped);
                    match session.upgrade() {
                        Some(session) if session.resync_connection() => continue,
                        _ => break,
                    }
                }
                Err(RecvError::Closed) => break,
            };
            let closed = event == TransportEvent::Closed;
            match session.upgrade() {
                Some(session) => session.handle_transport_event(event),
                None => break,
            }
            if closed {
                break;
            }
        }
    }

    /// Re-derive `connected` from the transport after events were lost
    ///
    /// Returns whether the transport still holds a session.
    fn resync_connection(&self) -> bool {
        if self.transport.is_connected() {
            return true;
        }
        let _enter = self.span.enter();
        debug!("Transport went down while events were skipped");
        self.mark_disconnected();
        false
    }

    async fn send(&self, command: StateCommand) -> Result<()> {
        if !self.is_connected() || !self.transport.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        trace!(?command, "Sending command");
        self.transport
            .publish_command(&self.topics, &command)
            .instrument(self.span.clone())
            .await
    }

    fn check_capability(&self, supported: bool, feature: &str) {
        if !supported {
            let _enter = self.span.enter();
            debug!("{} has no {}, sending anyway", self.entry.model, feature);
        }
    }

    fn auto_mode_on(&self) -> bool {
        lock(&self.inner).state.auto_mode.unwrap_or(false)
    }

    /// Switch the device on or off
    pub async fn set_power(&self, on: bool) -> Result<()> {
        let command = if self.profile().power_via_fan_mode {
            let mode = match (on, self.auto_mode_on()) {
                (false, _) => FanMode::Off,
                (true, true) => FanMode::Auto,
                (true, false) => FanMode::Fan,
            };
            StateCommand::new().with_fan_mode(mode)
        } else {
            StateCommand::new().with_power(on)
        };
        self.send(command).await
    }

    /// Set an explicit fan speed, clamped to 1-10
    pub async fn set_fan_speed(&self, level: i64) -> Result<()> {
        let speed = FanSpeed::clamped(level);
        self.send(
            StateCommand::new()
                .with_fan_speed(speed)
                .with_fan_mode(FanMode::Fan),
        )
        .await?;
        if let Some(level) = speed.level() {
            lock(&self.inner).last_speed = level;
        }
        Ok(())
    }

    /// Set the fan speed from a 0-100 percentage
    pub async fn set_fan_speed_percent(&self, percent: f64) -> Result<()> {
        self.set_fan_speed(codec::percent_to_speed(percent) as i64).await
    }

    /// Switch automatic mode on or off
    ///
    /// Switching it off restores the last explicit speed the device reported.
    pub async fn set_auto_mode(&self, on: bool) -> Result<()> {
        let profile = self.profile();
        self.check_capability(profile.auto_mode, "automatic mode");

        let mut command = if on {
            StateCommand::new().with_fan_mode(FanMode::Auto)
        } else {
            let level = lock(&self.inner).last_speed;
            StateCommand::new()
                .with_fan_mode(FanMode::Fan)
                .with_fan_speed(FanSpeed::Level(level))
        };
        if !profile.power_via_fan_mode {
            command = command.with_auto_mode(on);
        }
        self.send(command).await
    }

    /// Switch oscillation on or off
    pub async fn set_oscillation(&self, on: bool) -> Result<()> {
        self.check_capability(self.profile().oscillation, "oscillation");
        self.send(StateCommand::new().with_oscillation(on)).await
    }

    /// Oscillate between two angles
    ///
    /// Angles are clamped to the product's range and put in order.
    pub async fn set_oscillation_angles(&self, start: u16, end: u16) -> Result<()> {
        let profile = self.profile();
        self.check_capability(profile.oscillation_angles.is_some(), "oscillation angles");

        let (min, max) = profile
            .oscillation_angles
            .unwrap_or(DEFAULT_OSCILLATION_ANGLES);
        let start = start.clamp(min, max);
        let end = end.clamp(min, max);
        let (start, end) = if start <= end { (start, end) } else { (end, start) };

        self.send(
            StateCommand::new()
                .with_oscillation(true)
                .with_oscillation_angles(start, end),
        )
        .await
    }

    /// Switch night mode on or off
    pub async fn set_night_mode(&self, on: bool) -> Result<()> {
        self.check_capability(self.profile().night_mode, "night mode");
        self.send(StateCommand::new().with_night_mode(on)).await
    }

    /// Keep monitoring air quality while the fan is off
    pub async fn set_continuous_monitoring(&self, on: bool) -> Result<()> {
        self.check_capability(self.profile().continuous_monitoring, "continuous monitoring");
        self.send(StateCommand::new().with_continuous_monitoring(on)).await
    }

    /// Switch front airflow / jet focus on or off
    pub async fn set_jet_focus(&self, on: bool) -> Result<()> {
        let command = match self.profile().jet_focus {
            JetFocus::Focus => StateCommand::new().with_jet_focus(on),
            JetFocus::FrontAirflow => StateCommand::new().with_front_airflow(on),
            JetFocus::None => {
                self.check_capability(false, "jet focus");
                StateCommand::new().with_front_airflow(on)
            }
        };
        self.send(command).await
    }

    /// Switch heating on or off
    pub async fn set_heating(&self, on: bool) -> Result<()> {
        self.check_capability(self.profile().heating, "heating");
        self.send(StateCommand::new().with_heating(on)).await
    }

    /// Set the heating target in degrees Celsius, rounded and clamped to 1-37
    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.check_capability(self.profile().heating, "heating");
        let celsius = codec::clamp_target_celsius(celsius);
        self.send(StateCommand::new().with_target_temperature(celsius as f64))
            .await
    }

    /// Switch the humidifier on or off
    pub async fn set_humidifier(&self, on: bool) -> Result<()> {
        self.check_capability(self.profile().humidifier, "humidifier");
        self.send(StateCommand::new().with_humidifier(on)).await
    }

    /// Set the humidifier target in percent, clamped to 30-70
    pub async fn set_target_humidity(&self, percent: i64) -> Result<()> {
        self.check_capability(self.profile().humidifier, "humidifier");
        let percent = codec::clamp_target_humidity(percent);
        self.send(StateCommand::new().with_target_humidity(percent))
            .await
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::transports::LoopbackTransport;

    const SERIAL: &str = "NK6-EU-MHA0000A";

    fn session_for(product_type: &str) -> (Arc<DeviceSession>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let identity = DeviceIdentity::new(SERIAL, product_type, Some("10.0.0.5".into()), "cred");
        let session = DeviceSession::new(identity, transport.clone()).unwrap();
        (Arc::new(session), transport)
    }

    fn state_message(session: &DeviceSession, data: serde_json::Value) -> TransportEvent {
        TransportEvent::Message(InboundMessage::new(
            session.topics().status.clone(),
            json!({ "msg": "STATE-CHANGE", "product-state": data })
                .to_string()
                .into_bytes(),
        ))
    }

    fn counter(session: &DeviceSession) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        session.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_unknown_product_type() {
        let transport = Arc::new(LoopbackTransport::new());
        let identity = DeviceIdentity::new(SERIAL, "999", Some("10.0.0.5".into()), "cred");
        let result = DeviceSession::new(identity, transport);
        assert!(matches!(result, Err(DeviceError::UnsupportedProductType(code)) if code == "999"));
    }

    #[tokio::test]
    async fn test_connect_requires_address() {
        let transport = Arc::new(LoopbackTransport::new());
        let identity = DeviceIdentity::new(SERIAL, "438", None, "cred");
        let session = Arc::new(DeviceSession::new(identity, transport.clone()).unwrap());

        let result = session.connect().await;
        assert!(matches!(result, Err(DeviceError::Configuration(_))));
        assert_eq!(transport.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_connect_subscribes_and_requests_state() {
        let (session, transport) = session_for("438");
        let count = counter(&session);

        session.connect().await.unwrap();

        assert_eq!(session.session_state(), SessionState::Connected);
        assert!(session.state().connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(transport.subscriptions(), vec![session.topics().status.clone()]);
        let request = transport.last_published().unwrap();
        assert_eq!(request.topic, session.topics().command);
        assert_eq!(request.payload["msg"], "REQUEST-CURRENT-STATE");
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (session, transport) = session_for("438");
        transport.fail_next_connect(DeviceError::Timeout("deadline".into()));
        let count = counter(&session);

        let result = session.connect().await;
        assert!(matches!(result, Err(DeviceError::Timeout(_))));
        assert_eq!(session.session_state(), SessionState::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let (session, transport) = session_for("438");
        assert!(matches!(session.set_power(true).await, Err(DeviceError::NotConnected)));
        assert!(matches!(session.set_fan_speed(3).await, Err(DeviceError::NotConnected)));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_fan_speed_is_clamped() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();

        session.set_fan_speed(15).await.unwrap();
        let published = transport.last_published().unwrap();
        assert_eq!(published.payload["msg"], "STATE-SET");
        assert_eq!(published.payload["mode-reason"], "LAPP");
        assert_eq!(published.payload["data"], json!({"fnsp": "0010", "fmod": "FAN"}));

        session.set_fan_speed_percent(0.0).await.unwrap();
        let published = transport.last_published().unwrap();
        assert_eq!(published.payload["data"]["fnsp"], "0001");
    }

    #[tokio::test]
    async fn test_power_by_generation() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();
        session.set_power(false).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"fpwr": "OFF"}));

        let (session, transport) = session_for("475");
        session.connect().await.unwrap();
        session.set_power(false).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"fmod": "OFF"}));
        session.set_power(true).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"fmod": "FAN"}));
    }

    #[tokio::test]
    async fn test_auto_mode_restores_last_speed() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();

        session.set_auto_mode(false).await.unwrap();
        assert_eq!(
            transport.last_published().unwrap().payload["data"],
            json!({"fmod": "FAN", "fnsp": "0001", "auto": "OFF"})
        );

        session.handle_transport_event(state_message(&session, json!({"fnsp": "0006"})));
        session.handle_transport_event(state_message(&session, json!({"fnsp": "AUTO", "auto": "ON"})));
        assert_eq!(session.state().fan_speed, Some(FanSpeed::Auto));

        session.set_auto_mode(true).await.unwrap();
        assert_eq!(
            transport.last_published().unwrap().payload["data"],
            json!({"fmod": "AUTO", "auto": "ON"})
        );

        session.set_auto_mode(false).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"]["fnsp"], "0006");
    }

    #[tokio::test]
    async fn test_jet_focus_key_follows_profile() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();
        session.set_jet_focus(true).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"fdir": "ON"}));

        let (session, transport) = session_for("455");
        session.connect().await.unwrap();
        session.set_jet_focus(true).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"ffoc": "ON"}));
    }

    #[tokio::test]
    async fn test_targets_are_normalized() {
        let (session, transport) = session_for("527");
        session.connect().await.unwrap();
        session.set_target_temperature(50.0).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"hmax": "3102"}));

        let (session, transport) = session_for("358");
        session.connect().await.unwrap();
        session.set_target_humidity(95).await.unwrap();
        assert_eq!(transport.last_published().unwrap().payload["data"], json!({"humt": "0070"}));

        session.set_oscillation_angles(400, 45).await.unwrap();
        assert_eq!(
            transport.last_published().unwrap().payload["data"],
            json!({"oson": "ON", "osal": "0045", "osau": "0355"})
        );
    }

    #[test]
    fn test_merge_notifies_once_with_full_snapshot() {
        let (session, _transport) = session_for("438");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.subscribe(move |state| sink.lock().unwrap().push(state.clone()));

        session.handle_transport_event(state_message(&session, json!({"fpwr": "ON", "fnsp": "0004"})));
        session.handle_transport_event(state_message(&session, json!({"oson": "ON"})));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].power, Some(true));
        assert_eq!(seen[1].fan_speed, Some(FanSpeed::Level(4)));
        assert_eq!(seen[1].oscillation, Some(true));
    }

    #[test]
    fn test_ignored_messages() {
        let (session, _transport) = session_for("438");
        let count = counter(&session);
        let before = session.state();

        let status = session.topics().status.clone();
        session.handle_transport_event(TransportEvent::Message(InboundMessage::new(
            status.clone(),
            b"{not json".to_vec(),
        )));
        session.handle_transport_event(TransportEvent::Message(InboundMessage::new(
            status,
            json!({"msg": "HELLO", "data": {"fpwr": "ON"}}).to_string().into_bytes(),
        )));
        session.handle_transport_event(TransportEvent::Message(InboundMessage::new(
            "other/topic",
            json!({"msg": "STATE-CHANGE", "data": {"fpwr": "ON"}}).to_string().into_bytes(),
        )));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), before);
    }

    #[test]
    fn test_absent_sensors_are_not_trusted() {
        let (session, _transport) = session_for("475");
        session.handle_transport_event(state_message(
            &session,
            json!({"p25r": "0012", "va10": "0003", "hmod": "HEAT"}),
        ));
        let state = session.state();
        assert_eq!(state.pm25, None);
        assert_eq!(state.voc_index, Some(3));
        assert_eq!(state.heating, None);
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let (session, _transport) = session_for("438");
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            session.subscribe(move |_| order.lock().unwrap().push(label));
        }
        let second = SubscriptionId(2);
        assert!(session.unsubscribe(second));
        assert!(!session.unsubscribe(second));

        session.handle_transport_event(state_message(&session, json!({"nmod": "ON"})));
        assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_observer_may_subscribe_during_notification() {
        let (session, _transport) = session_for("438");
        let weak = Arc::downgrade(&session);
        session.subscribe(move |_| {
            if let Some(session) = weak.upgrade() {
                session.subscribe(|_| {});
            }
        });
        session.handle_transport_event(state_message(&session, json!({"nmod": "ON"})));
        assert_eq!(session.observer_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_once() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();
        let count = counter(&session);

        session.disconnect().await.unwrap();
        session.handle_transport_event(TransportEvent::Disconnected);
        session.handle_transport_event(TransportEvent::Closed);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!session.state().connected);
        assert!(session.closed_by_caller());
        assert!(!transport.is_connected());

        // Safe to repeat
        session.disconnect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_wins() {
        let (session, transport) = session_for("438");
        transport.hold_connects(true);
        let count = counter(&session);

        let connecting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect().await })
        };
        while transport.held_connects() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.session_state(), SessionState::Connecting);

        session.disconnect().await.unwrap();
        transport.release_connects();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(DeviceError::InvalidState(_))));
        assert_eq!(session.session_state(), SessionState::Disconnected);
        assert!(!session.state().connected);
        assert!(!transport.is_connected());
        assert!(session.closed_by_caller());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // The session stays usable
        session.connect().await.unwrap();
        assert!(session.is_connected());
        assert!(!session.closed_by_caller());
    }

    #[tokio::test]
    async fn test_resync_after_lost_events() {
        let (session, transport) = session_for("438");
        session.connect().await.unwrap();
        let count = counter(&session);

        // Nobody hears the drop, as when the receiver lags past it
        session.stop_pump();
        transport.drop_connection("reset");
        assert!(session.is_connected());

        assert!(!session.resync_connection());
        assert_eq!(session.session_state(), SessionState::Disconnected);
        assert!(!session.state().connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!session.closed_by_caller());
    }

    #[test]
    fn test_transport_drop_notifies_once() {
        let (session, _transport) = session_for("438");
        lock(&session.inner).session_state = SessionState::Connected;
        session.update_connected(true);
        let count = counter(&session);

        session.handle_transport_event(TransportEvent::Error("reset".into()));
        session.handle_transport_event(TransportEvent::Disconnected);
        session.handle_transport_event(TransportEvent::Closed);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(session.session_state(), SessionState::Disconnected);
        assert!(!session.closed_by_caller());
    }
}
