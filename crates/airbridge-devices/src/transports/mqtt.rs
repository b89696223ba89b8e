/*!
 * MQTT transport for AirBridge.
 *
 * This module implements the `Transport` trait on top of `rumqttc`. Each
 * transport owns one client session with the broker embedded in a device.
 * Publishes, subscriptions and unsubscriptions complete when the broker
 * acknowledges their packet id, and fail when the session ends first.
 */

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{DeviceError, Result};
use crate::transport::{InboundMessage, Transport, TransportEvent, TransportOptions};

/// Capacity of the client request channel
const REQUEST_CAPACITY: usize = 16;

/// How long an explicit disconnect waits for the event loop to flush
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type Ack = oneshot::Sender<Result<()>>;

/// Requests that the broker acknowledges by packet id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Request {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Requests awaiting their acknowledgement
#[derive(Default)]
struct Pending {
    /// Handed to the client but not yet written, in request order
    queued: VecDeque<(Request, Ack)>,
    /// Written and waiting for PUBACK, SUBACK or UNSUBACK
    in_flight: HashMap<(Request, u16), Ack>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the transport and its event loop task
struct Shared {
    /// Whether a session is established
    connected: AtomicBool,
    /// Requests not yet acknowledged by the broker
    pending: Mutex<Pending>,
    /// Subscribed topics
    subscriptions: Mutex<HashSet<String>>,
    /// Event fan-out
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Queue `ack` and hand the request to the client while holding the queue
    ///
    /// The client writes requests in the order it receives them, so the queue
    /// order matches the order packet ids are assigned in.
    fn enqueue<F>(&self, request: Request, send: F) -> Result<oneshot::Receiver<Result<()>>>
    where
        F: FnOnce() -> std::result::Result<(), rumqttc::ClientError>,
    {
        let (ack, done) = oneshot::channel();
        let mut pending = lock(&self.pending);
        pending.queued.push_back((request, ack));
        if let Err(e) = send() {
            pending.queued.pop_back();
            return Err(DeviceError::Transport(e.to_string()));
        }
        Ok(done)
    }

    /// The next queued request went out with packet id `pkid`
    fn written(&self, request: Request, pkid: u16) {
        let mut pending = lock(&self.pending);
        match pending.queued.pop_front() {
            Some((queued, ack)) if queued == request => {
                pending.in_flight.insert((request, pkid), ack);
            }
            Some((queued, ack)) => {
                warn!("Expected {:?} to be written, saw {:?} {}", queued, request, pkid);
                let _ = ack.send(Err(DeviceError::InvalidState(format!(
                    "{:?} written out of order",
                    queued
                ))));
            }
            None => debug!("Untracked {:?} {} written", request, pkid),
        }
    }

    /// The broker acknowledged `pkid`
    fn acknowledged(&self, request: Request, pkid: u16, result: Result<()>) {
        if let Some(ack) = lock(&self.pending).in_flight.remove(&(request, pkid)) {
            let _ = ack.send(result);
        }
    }

    fn fail_pending(&self, reason: &str) {
        let acks: Vec<Ack> = {
            let mut pending = lock(&self.pending);
            let queued = pending.queued.drain(..).map(|(_, ack)| ack);
            let mut acks: Vec<Ack> = queued.collect();
            acks.extend(pending.in_flight.drain().map(|(_, ack)| ack));
            acks
        };
        for ack in acks {
            let _ = ack.send(Err(DeviceError::Transport(reason.to_string())));
        }
    }

    /// Tear down session state; only the first caller emits the events
    fn shut_down(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.fail_pending(reason);
            lock(&self.subscriptions).clear();
            self.emit(TransportEvent::Disconnected);
            self.emit(TransportEvent::Closed);
        }
    }
}

/// A live client session
struct Connection {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// MQTT transport
pub struct MqttTransport {
    /// Connection parameters
    options: TransportOptions,
    /// State shared with the event loop
    shared: Arc<Shared>,
    /// Current session, if any
    connection: Mutex<Option<Connection>>,
    /// Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
}

impl MqttTransport {
    /// Create a new, unconnected MQTT transport
    pub fn new(options: TransportOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            options,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                pending: Mutex::new(Pending::default()),
                subscriptions: Mutex::new(HashSet::new()),
                events,
            }),
            connection: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Connection parameters
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.options.client_id.clone(),
            self.options.host.clone(),
            self.options.port,
        );
        options.set_keep_alive(self.options.keep_alive);
        options.set_credentials(self.options.username.clone(), self.options.password.clone());
        options.set_clean_session(true);
        options
    }

    fn client(&self) -> Result<AsyncClient> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        lock(&self.connection)
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or(DeviceError::NotConnected)
    }

    /// Poll until the broker acknowledges the session
    async fn handshake(eventloop: &mut EventLoop) -> Result<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(DeviceError::Transport(format!(
                            "Broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(DeviceError::Transport(e.to_string())),
            }
        }
    }

    /// Drive the client after the handshake, forwarding everything as events
    async fn run_event_loop(mut eventloop: EventLoop, shared: Arc<Shared>) {
        let reason = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message received");
                    shared.emit(TransportEvent::Message(InboundMessage::new(
                        publish.topic,
                        publish.payload,
                    )));
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.written(Request::Publish, pkid),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    shared.written(Request::Subscribe, pkid)
                }
                Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                    shared.written(Request::Unsubscribe, pkid)
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    shared.acknowledged(Request::Publish, ack.pkid, Ok(()))
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let result = if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        Err(DeviceError::Transport("Broker rejected the subscription".to_string()))
                    } else {
                        Ok(())
                    };
                    shared.acknowledged(Request::Subscribe, ack.pkid, result)
                }
                Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                    shared.acknowledged(Request::Unsubscribe, ack.pkid, Ok(()))
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break "Connection closed by client",
                Ok(Event::Incoming(Packet::Disconnect)) => break "Connection closed by broker",
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    shared.emit(TransportEvent::Error(e.to_string()));
                    break "Connection lost";
                }
            }
        };
        debug!("MQTT event loop stopped: {}", reason);
        shared.shut_down(reason);
    }
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        debug!(
            "Connecting to MQTT broker at {}:{} with client ID {}",
            self.options.host, self.options.port, self.options.client_id
        );

        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);
        let deadline = self.options.connect_timeout;
        match tokio::time::timeout(deadline, Self::handshake(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(DeviceError::Timeout(format!(
                    "No answer from {}:{} within {:?}",
                    self.options.host, self.options.port, deadline
                )))
            }
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(Self::run_event_loop(eventloop, Arc::clone(&self.shared)));
        *lock(&self.connection) = Some(Connection { client, task });

        info!("Connected to MQTT broker at {}:{}", self.options.host, self.options.port);
        self.shared.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(Connection { client, mut task }) = lock(&self.connection).take() else {
            return Ok(());
        };

        debug!("Disconnecting from MQTT broker at {}:{}", self.options.host, self.options.port);
        if self.is_connected() && client.try_disconnect().is_ok() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        } else {
            task.abort();
        }

        self.shared.shut_down("Disconnected");
        info!("Disconnected from MQTT broker at {}:{}", self.options.host, self.options.port);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let client = self.client()?;
        debug!("Subscribing to MQTT topic: {}", topic);
        let done = self.shared.enqueue(Request::Subscribe, || {
            client.try_subscribe(topic, QoS::AtLeastOnce)
        })?;
        settle(done).await?;
        lock(&self.shared.subscriptions).insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let client = self.client()?;
        debug!("Unsubscribing from MQTT topic: {}", topic);
        let done = self
            .shared
            .enqueue(Request::Unsubscribe, || client.try_unsubscribe(topic))?;
        settle(done).await?;
        lock(&self.shared.subscriptions).remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let client = self.client()?;
        let bytes = serde_json::to_vec(payload)?;
        debug!("Publishing to MQTT topic: {} (payload size: {} bytes)", topic, bytes.len());

        let done = self.shared.enqueue(Request::Publish, || {
            client.try_publish(topic, QoS::AtLeastOnce, false, bytes)
        })?;
        settle(done).await
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.shared.subscriptions).iter().cloned().collect();
        topics.sort();
        topics
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

/// Wait for the broker's acknowledgement of one request
async fn settle(done: oneshot::Receiver<Result<()>>) -> Result<()> {
    done.await.map_err(|_| {
        DeviceError::Transport("Connection closed before the broker acknowledged".to_string())
    })?
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(connection) = lock(&self.connection).take() {
            connection.task.abort();
        }
    }
}
