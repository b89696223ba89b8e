/*!
 * In-memory transport.
 *
 * `LoopbackTransport` behaves like a broker session without any network: it
 * records what is published, lets the caller inject inbound messages and
 * connection drops, and can be told to fail the next connection attempts.
 */
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::device::{DeviceError, Result};
use crate::transport::{InboundMessage, Transport, TransportEvent};

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message published through the loopback transport
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Topic
    pub topic: String,
    /// JSON payload
    pub payload: Value,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    subscriptions: BTreeSet<String>,
    published: Vec<PublishedMessage>,
    connect_attempts: usize,
    /// Errors returned by the next connection attempts, in order
    connect_failures: VecDeque<DeviceError>,
    /// When set, publishes wait until released or the connection drops
    hold_publishes: bool,
    held: Vec<oneshot::Sender<Result<()>>>,
    /// When set, connection attempts wait until released
    hold_connects: bool,
    held_connects: Vec<oneshot::Sender<()>>,
}

/// Transport that loops everything back to the caller
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
    events: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    /// Create a new, unconnected loopback transport
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Make the next connection attempt fail with `error`
    ///
    /// Calls queue up: each attempt consumes one failure.
    pub fn fail_next_connect(&self, error: DeviceError) {
        lock(&self.inner).connect_failures.push_back(error);
    }

    /// Number of connection attempts so far
    pub fn connect_attempts(&self) -> usize {
        lock(&self.inner).connect_attempts
    }

    /// Everything published so far, oldest first
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner).published.clone()
    }

    /// The most recent publish
    pub fn last_published(&self) -> Option<PublishedMessage> {
        lock(&self.inner).published.last().cloned()
    }

    /// Forget recorded publishes
    pub fn clear_published(&self) {
        lock(&self.inner).published.clear();
    }

    /// Hold publishes in flight until `release_publishes` or a connection drop
    pub fn hold_publishes(&self, hold: bool) {
        lock(&self.inner).hold_publishes = hold;
    }

    /// Complete every held publish successfully
    pub fn release_publishes(&self) {
        let held: Vec<_> = lock(&self.inner).held.drain(..).collect();
        for ack in held {
            let _ = ack.send(Ok(()));
        }
    }

    /// Number of publishes currently held in flight
    pub fn held_publishes(&self) -> usize {
        lock(&self.inner).held.len()
    }

    /// Hold connection attempts in flight until `release_connects`
    pub fn hold_connects(&self, hold: bool) {
        lock(&self.inner).hold_connects = hold;
    }

    /// Let every held connection attempt complete
    pub fn release_connects(&self) {
        let held: Vec<_> = lock(&self.inner).held_connects.drain(..).collect();
        for open in held {
            let _ = open.send(());
        }
    }

    /// Number of connection attempts currently held in flight
    pub fn held_connects(&self) -> usize {
        lock(&self.inner).held_connects.len()
    }

    /// Deliver a raw inbound payload as if the broker had sent it
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.emit(TransportEvent::Message(InboundMessage::new(topic, payload)));
    }

    /// Deliver a JSON inbound message
    pub fn inject_json(&self, topic: &str, message: &Value) {
        self.inject(topic, message.to_string().into_bytes());
    }

    /// Emit an arbitrary event
    pub fn inject_event(&self, event: TransportEvent) {
        self.emit(event);
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self, reason: &str) {
        if self.shut_down(reason) {
            debug!("Loopback connection dropped: {}", reason);
            self.emit(TransportEvent::Error(reason.to_string()));
            self.emit(TransportEvent::Disconnected);
            self.emit(TransportEvent::Closed);
        }
    }

    /// Mark the session down, failing held publishes; returns whether it was up
    fn shut_down(&self, reason: &str) -> bool {
        let held = {
            let mut inner = lock(&self.inner);
            if !inner.connected {
                return false;
            }
            inner.connected = false;
            inner.subscriptions.clear();
            inner.held.drain(..).collect::<Vec<_>>()
        };
        for ack in held {
            let _ = ack.send(Err(DeviceError::Transport(reason.to_string())));
        }
        true
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("LoopbackTransport")
            .field("connected", &inner.connected)
            .field("subscriptions", &inner.subscriptions)
            .field("published", &inner.published.len())
            .finish()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self) -> Result<()> {
        let gate = {
            let mut inner = lock(&self.inner);
            if inner.connected {
                return Ok(());
            }
            inner.connect_attempts += 1;
            if let Some(error) = inner.connect_failures.pop_front() {
                return Err(error);
            }
            if inner.hold_connects {
                let (open, opened) = oneshot::channel();
                inner.held_connects.push(open);
                Some(opened)
            } else {
                None
            }
        };
        if let Some(opened) = gate {
            opened.await.map_err(|_| {
                DeviceError::Transport("Connection attempt abandoned".to_string())
            })?;
        }

        lock(&self.inner).connected = true;
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.shut_down("Disconnected") {
            self.emit(TransportEvent::Disconnected);
            self.emit(TransportEvent::Closed);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.connected {
            return Err(DeviceError::NotConnected);
        }
        inner.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.connected {
            return Err(DeviceError::NotConnected);
        }
        inner.subscriptions.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let held = {
            let mut inner = lock(&self.inner);
            if !inner.connected {
                return Err(DeviceError::NotConnected);
            }
            inner.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
            if !inner.hold_publishes {
                return Ok(());
            }
            let (ack, done) = oneshot::channel();
            inner.held.push(ack);
            done
        };

        held.await.map_err(|_| {
            DeviceError::Transport("Connection closed before the publish completed".to_string())
        })?
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner).subscriptions.iter().cloned().collect()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
