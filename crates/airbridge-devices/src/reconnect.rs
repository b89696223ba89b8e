/*!
 * Reconnection supervision.
 *
 * Transports never retry on their own. A `Reconnector` watches one session and
 * re-establishes it with exponential backoff after the transport drops it.
 * Teardown requested through `DeviceSession::disconnect()` is left alone.
 */
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use airbridge_core::config::ReconnectConfig;
use airbridge_core::utils::exponential_backoff;

use crate::device::SessionState;
use crate::session::{DeviceSession, SubscriptionId};

/// Backoff schedule for reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Attempts before giving up, 0 for no limit
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Policy from the `reconnect` configuration section
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_delay, self.max_delay, attempt)
    }

    /// Whether attempt `attempt` (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 10)
    }
}

/// Handle to a running reconnection supervisor
///
/// Dropping the handle cancels the supervisor.
#[derive(Debug)]
pub struct ReconnectHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    session: Weak<DeviceSession>,
    subscription: SubscriptionId,
}

impl ReconnectHandle {
    /// Stop supervising; a pending attempt is abandoned before it starts
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        if let Some(session) = self.session.upgrade() {
            session.unsubscribe(self.subscription);
        }
    }

    /// Whether the supervisor has stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReconnectHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Reconnection supervisor for one session
pub struct Reconnector {
    session: Weak<DeviceSession>,
    policy: ReconnectPolicy,
    token: CancellationToken,
}

impl Reconnector {
    /// Start supervising `session`
    ///
    /// A session that is neither connected nor closed by the caller is
    /// reconnected right away.
    pub fn spawn(session: &Arc<DeviceSession>, policy: ReconnectPolicy) -> ReconnectHandle {
        let (changes, mut rx) = mpsc::unbounded_channel();
        let subscription = session.subscribe(move |state| {
            let _ = changes.send(state.connected);
        });

        let token = CancellationToken::new();
        let supervisor = Reconnector {
            session: Arc::downgrade(session),
            policy,
            token: token.clone(),
        };
        let span = tracing::info_span!("reconnect", serial = %session.serial());
        let task = tokio::spawn(
            async move {
                let mut running = !supervisor.needs_reconnect() || supervisor.reconnect().await;
                while running {
                    let connected = tokio::select! {
                        _ = supervisor.token.cancelled() => break,
                        change = rx.recv() => match change {
                            Some(connected) => connected,
                            None => break,
                        },
                    };
                    if !connected && supervisor.needs_reconnect() {
                        running = supervisor.reconnect().await;
                    }
                }
                if let Some(session) = supervisor.session.upgrade() {
                    session.unsubscribe(subscription);
                }
                debug!("Reconnect supervisor stopped");
            }
            .instrument(span),
        );

        ReconnectHandle {
            token,
            task,
            session: Arc::downgrade(session),
            subscription,
        }
    }

    fn needs_reconnect(&self) -> bool {
        self.session.upgrade().map_or(false, |session| {
            session.session_state() == SessionState::Disconnected && !session.closed_by_caller()
        })
    }

    /// Retry until connected; returns false when supervision should stop
    async fn reconnect(&self) -> bool {
        let mut attempt = 1;
        loop {
            if !self.policy.allows(attempt) {
                error!("Giving up after {} reconnection attempts", attempt - 1);
                return false;
            }

            let delay = self.policy.delay_for(attempt);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(session) = self.session.upgrade() else {
                return false;
            };
            if session.closed_by_caller() || session.is_connected() {
                return true;
            }
            match session.connect().await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    return true;
                }
                Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
            }
            attempt += 1;
        }
    }
}
