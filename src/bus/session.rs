//! Bus session manager.
//!
//! Owns the broker session, its subscriptions and the reconnect policy.
//! A session is never repaired in place: every reconnect closes the old
//! client and opens a new one.

use bytes::Bytes;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::client::{BrokerSettings, BusClient, BusConnector, Credentials, InboundMessage};
use crate::bus::reconnect::{BackoffPolicy, ReconnectDecision, ReconnectState};
use crate::error::{Error, Result};

/// Topics the bridge listens on for commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopics {
    /// OTA trigger topic; OTA results are published here too.
    pub ota: String,
    /// Device reset topic.
    pub reset: String,
    /// Debug topic.
    pub debug: String,
}

impl ControlTopics {
    /// All control topics, in subscription order.
    pub fn all(&self) -> [&str; 3] {
        [&self.ota, &self.reset, &self.debug]
    }
}

/// Everything needed to open and keep a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Broker to connect to.
    pub broker: BrokerSettings,
    /// Broker credentials.
    pub credentials: Credentials,
    /// Topics subscribed after every connect.
    pub control_topics: ControlTopics,
    /// Reconnect policy.
    pub backoff: BackoffPolicy,
    /// How long one inbound poll may wait.
    pub poll_interval: Duration,
}

/// An established session and its subscriptions.
pub struct Session<T> {
    client: T,
    subscriptions: HashSet<String>,
}

impl<T: BusClient> Session<T> {
    /// Connect through `connector` and subscribe to `topics`.
    pub async fn establish<C>(
        connector: &mut C,
        broker: &BrokerSettings,
        credentials: &Credentials,
        topics: &[&str],
    ) -> Result<Self>
    where
        C: BusConnector<Client = T>,
    {
        let client = connector.connect(broker, credentials).await?;
        let mut session = Self {
            client,
            subscriptions: HashSet::new(),
        };

        for topic in topics {
            if let Err(e) = session.subscribe(topic).await {
                session.client.disconnect().await;
                return Err(e);
            }
        }

        Ok(session)
    }

    /// Subscribe to a topic.
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if self.subscriptions.contains(topic) {
            return Ok(());
        }
        self.client.subscribe(topic).await?;
        debug!("Subscribed to {}", topic);
        self.subscriptions.insert(topic.to_string());
        Ok(())
    }

    /// Check if a topic is subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    /// Subscribed topics.
    pub fn subscriptions(&self) -> &HashSet<String> {
        &self.subscriptions
    }
}

/// Owner of the bus session.
pub struct BusSessionManager<C: BusConnector> {
    connector: C,
    settings: SessionSettings,
    session: Option<Session<C::Client>>,
    reconnect: ReconnectState,
    published: u64,
}

impl<C: BusConnector> BusSessionManager<C> {
    /// Create a manager without a session.
    pub fn new(connector: C, settings: SessionSettings) -> Self {
        Self {
            connector,
            settings,
            session: None,
            reconnect: ReconnectState::new(),
            published: 0,
        }
    }

    /// Check if a session is established.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The current session.
    pub fn session(&self) -> Option<&Session<C::Client>> {
        self.session.as_ref()
    }

    /// Reconnect bookkeeping.
    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    /// Session settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Number of successful publishes.
    pub fn published_count(&self) -> u64 {
        self.published
    }

    /// Make one connect attempt, replacing any existing session.
    ///
    /// A failure is counted by the reconnect policy; once the attempt limit
    /// is reached this returns [`Error::ReconnectExhausted`] without trying.
    pub async fn connect(&mut self) -> Result<()> {
        if self.reconnect.is_exhausted() {
            return Err(Error::ReconnectExhausted {
                attempts: self.reconnect.attempts(),
            });
        }

        if let Some(mut old) = self.session.take() {
            debug!("Closing previous session");
            old.client.disconnect().await;
        }

        let broker = &self.settings.broker;
        info!("Connecting to broker {}:{}", broker.host, broker.port);

        let topics = self.settings.control_topics.all();
        let result = Session::establish(
            &mut self.connector,
            broker,
            &self.settings.credentials,
            &topics,
        )
        .await;

        match result {
            Ok(session) => {
                info!("Connected to broker {}", broker.host);
                self.session = Some(session);
                self.reconnect.record_success();
                Ok(())
            }
            Err(e) => {
                let decision = self.reconnect.record_failure(
                    &self.settings.backoff,
                    e.to_string(),
                    Instant::now(),
                );
                match decision {
                    ReconnectDecision::RetryAfter(delay) => {
                        warn!(
                            "Broker connection failed: {} (attempt {}/{}, retrying in {}s)",
                            e,
                            self.reconnect.attempts(),
                            self.settings.backoff.max_attempts,
                            delay.as_secs()
                        );
                        Err(e)
                    }
                    ReconnectDecision::GiveUp { attempts } => {
                        error!(
                            "Broker connection failed: {} (giving up after {} attempts)",
                            e, attempts
                        );
                        Err(Error::ReconnectExhausted { attempts })
                    }
                }
            }
        }
    }

    /// Connect, waiting out the backoff delay between failed attempts.
    ///
    /// The wait is an async sleep, so other tasks keep running. Errors that
    /// another attempt cannot fix, such as an unreadable CA certificate,
    /// are returned right away.
    pub async fn reconnect(&mut self) -> Result<()> {
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(_) => {
                    let delay = self.reconnect.next_delay().unwrap_or_default();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Make a connect attempt if one is scheduled at or before `now`.
    pub async fn reconnect_if_due(&mut self, now: Instant) -> Option<Result<()>> {
        if self.session.is_some() {
            return None;
        }
        if self.reconnect.is_exhausted() {
            return Some(Err(Error::ReconnectExhausted {
                attempts: self.reconnect.attempts(),
            }));
        }
        if !self.reconnect.is_due(now) {
            return None;
        }
        Some(self.connect().await)
    }

    /// Publish a payload. Not buffered or retried.
    pub async fn publish(&mut self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotConnected)?;

        match session.client.publish(topic, payload.into()).await {
            Ok(()) => {
                self.published += 1;
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::ConnectionLost { .. }) {
                    self.mark_lost(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Wait up to the poll interval for one inbound message.
    pub async fn poll_inbound(&mut self) -> Result<Option<InboundMessage>> {
        let wait = self.settings.poll_interval;
        let session = self.session.as_mut().ok_or(Error::NotConnected)?;

        match session.client.poll(wait).await {
            Ok(message) => Ok(message),
            Err(e) => {
                let reason = e.to_string();
                self.mark_lost(reason.clone());
                Err(Error::ConnectionLost { reason })
            }
        }
    }

    /// Drop the session after a transport failure and schedule a reconnect.
    pub fn mark_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.session.take().is_some() {
            warn!("Bus connection lost: {}", reason);
        }
        self.reconnect.record_lost(reason, Instant::now());
    }

    /// Close the session.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.client.disconnect().await;
            info!("Disconnected from broker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{session_settings as settings, ConnectScript, FakeBroker};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_connect_subscribes_control_topics() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), settings());

        bus.connect().await.unwrap();

        assert!(bus.is_connected());
        let session = bus.session().unwrap();
        assert!(session.is_subscribed("bridge/ota"));
        assert!(session.is_subscribed("bridge/reset"));
        assert!(session.is_subscribed("bridge/debug"));
        assert_eq!(session.subscriptions().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_requires_session() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), settings());

        let err = bus.publish("data", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failures_count_and_reset_on_success() {
        let broker = FakeBroker::default();
        broker.script(&[ConnectScript::TransportFailure, ConnectScript::Rejected]);
        let mut bus = BusSessionManager::new(broker.clone(), settings());

        assert!(matches!(bus.connect().await, Err(Error::Transport { .. })));
        assert_eq!(bus.reconnect_state().attempts(), 1);
        assert!(matches!(bus.connect().await, Err(Error::Protocol { .. })));
        assert_eq!(bus.reconnect_state().attempts(), 2);

        bus.connect().await.unwrap();
        assert_eq!(bus.reconnect_state().attempts(), 0);
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_five_failures() {
        let broker = FakeBroker::default();
        broker.script(&[ConnectScript::TransportFailure; 6]);
        let mut bus = BusSessionManager::new(broker.clone(), settings());

        let err = bus.reconnect().await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 5 }));
        assert_eq!(broker.connect_attempts(), 5);

        // No sixth attempt happens on its own.
        assert!(matches!(
            bus.reconnect_if_due(Instant::now()).await,
            Some(Err(Error::ReconnectExhausted { .. }))
        ));
        assert!(matches!(bus.connect().await, Err(Error::ReconnectExhausted { .. })));
        assert_eq!(broker.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_reconnect_stops_on_unrecoverable_error() {
        let broker = FakeBroker::default();
        broker.script(&[ConnectScript::MissingCertificate]);
        let mut bus = BusSessionManager::new(broker.clone(), settings());

        let err = bus.reconnect().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(broker.connect_attempts(), 1);
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn test_lost_connection_replaces_session() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), settings());
        bus.connect().await.unwrap();

        broker.state.lock().drop_connection = true;
        let err = bus.poll_inbound().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert!(!bus.is_connected());
        assert!(bus.reconnect_state().is_due(Instant::now()));

        assert!(matches!(bus.reconnect_if_due(Instant::now()).await, Some(Ok(()))));
        assert!(bus.is_connected());
        assert_eq!(broker.state.lock().sessions_opened, 2);
    }

    #[tokio::test]
    async fn test_poll_delivers_one_message_at_a_time() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), settings());
        bus.connect().await.unwrap();

        broker.deliver("bridge/ota", "now");
        broker.deliver("bridge/debug", "ping");

        let first = bus.poll_inbound().await.unwrap().unwrap();
        assert_eq!(first.topic, "bridge/ota");
        let second = bus.poll_inbound().await.unwrap().unwrap();
        assert_eq!(second.topic, "bridge/debug");
        assert_eq!(bus.poll_inbound().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_explicit_connect_closes_previous_session() {
        let broker = FakeBroker::default();
        let mut bus = BusSessionManager::new(broker.clone(), settings());
        bus.connect().await.unwrap();
        bus.connect().await.unwrap();

        let state = broker.state.lock();
        assert_eq!(state.sessions_opened, 2);
        assert_eq!(state.disconnects, 1);
    }
}
