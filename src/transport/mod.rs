//! Publish-side session management.
//!
//! [`TransportPublisher`] decides when to connect, retry and tear down; the
//! wire protocol lives behind [`BrokerClient`]. The production client is
//! MQTT ([`mqtt::MqttBroker`]); [`sim::SimBroker`] scripts outcomes for tests.

pub mod mqtt;
pub mod sim;

use crate::link::ConnectionState;
use crate::metrics::MetricsSnapshot;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Session establishment attempts per `connect` call.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Backoff after the n-th failed attempt is `n` times this step.
pub const CONNECT_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Keep-alive requested from the broker.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Errors raised by a broker client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("network timeout")]
    Timeout,

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("no session")]
    NotConnected,

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Network-level failures worth another connect attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout | Self::Refused(_))
    }
}

/// Parameters agreed with the broker when a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub keep_alive: Duration,
}

/// Wire-level access to a broker. Holds at most one session.
#[async_trait]
pub trait BrokerClient {
    /// `host:port` for log lines.
    fn endpoint(&self) -> String;

    /// Open a fresh session, dropping any previous one.
    async fn open(&mut self) -> Result<SessionInfo, TransportError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Owns the publish session: bounded connect retries, fail-fast publish.
pub struct TransportPublisher<C: BrokerClient> {
    client: C,
    topic: String,
    session: Option<SessionInfo>,
    connecting: bool,
}

impl<C: BrokerClient> TransportPublisher<C> {
    pub fn new(client: C, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
            session: None,
            connecting: false,
        }
    }

    /// Establish a session, retrying recoverable failures with linear backoff.
    ///
    /// Unclassified errors abort without further attempts.
    pub async fn connect(&mut self) -> bool {
        if self.session.is_some() {
            self.disconnect().await;
        }
        info!("Connecting to MQTT at {}...", self.client.endpoint());
        self.connecting = true;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.client.open().await {
                Ok(session) => {
                    info!(
                        keep_alive_secs = session.keep_alive.as_secs(),
                        attempt, "MQTT connected!"
                    );
                    self.session = Some(session);
                    self.connecting = false;
                    return true;
                }
                Err(err) if err.is_recoverable() => {
                    let backoff = CONNECT_BACKOFF_STEP * attempt;
                    warn!(
                        "MQTT connection attempt {}/{} failed: {}; backing off {}s",
                        attempt,
                        CONNECT_ATTEMPTS,
                        err,
                        backoff.as_secs()
                    );
                    sleep(backoff).await;
                }
                Err(err) => {
                    error!("MQTT connection aborted: {}", err);
                    break;
                }
            }
        }

        self.connecting = false;
        false
    }

    /// Publish one snapshot. Any failure tears the session down.
    pub async fn publish(&mut self, snapshot: &MetricsSnapshot) -> bool {
        if self.session.is_none() {
            return false;
        }
        match self.send(snapshot).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Publish error: {}", err);
                self.disconnect().await;
                false
            }
        }
    }

    async fn send(&mut self, snapshot: &MetricsSnapshot) -> Result<(), TransportError> {
        let payload = snapshot.to_json()?;
        debug!("Published: {}", String::from_utf8_lossy(&payload));
        self.client.publish(&self.topic, payload).await
    }

    /// Close the session if any. Close errors are swallowed.
    pub async fn disconnect(&mut self) {
        if self.session.take().is_some() {
            if let Err(err) = self.client.close().await {
                debug!("Ignoring error while closing MQTT session: {}", err);
            }
        }
    }

    /// Whether a session handle is held. Liveness is only learned by publishing.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Connected
        } else if self.connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimBroker;
    use super::*;
    use std::io;
    use tokio::time::Instant;

    fn snapshot() -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new();
        snapshot.insert("temperature_celsius", 24.5);
        snapshot.insert("uptime_seconds", 12);
        snapshot
    }

    fn refused() -> TransportError {
        TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_linear_backoff() {
        let broker = SimBroker::new().script_opens([Err(refused()), Err(TransportError::Timeout)]);
        let mut publisher = TransportPublisher::new(broker, "pico/metrics");
        let started = Instant::now();

        assert!(publisher.connect().await);
        assert!(publisher.is_connected());
        assert_eq!(publisher.client().open_calls(), 3);
        // 2s after the first failure, 4s after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhaustion_leaves_handle_unset() {
        let broker = SimBroker::new().script_opens([Err(refused()), Err(refused()), Err(refused())]);
        let mut publisher = TransportPublisher::new(broker, "pico/metrics");

        assert!(!publisher.connect().await);
        assert!(!publisher.is_connected());
        assert_eq!(publisher.state(), ConnectionState::Disconnected);
        assert_eq!(publisher.client().open_calls(), CONNECT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_error_aborts_immediately() {
        let broker = SimBroker::new().script_opens([Err(TransportError::Protocol("bad connack".into()))]);
        let mut publisher = TransportPublisher::new(broker, "pico/metrics");
        let started = Instant::now();

        assert!(!publisher.connect().await);
        assert_eq!(publisher.client().open_calls(), 1);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_publish_without_session_is_noop() {
        let mut publisher = TransportPublisher::new(SimBroker::new(), "pico/metrics");
        assert!(!publisher.publish(&snapshot()).await);
        assert!(publisher.client().published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_sends_compact_json_to_topic() {
        let mut publisher = TransportPublisher::new(SimBroker::new(), "pico/metrics");
        assert!(publisher.connect().await);
        assert!(publisher.publish(&snapshot()).await);

        let (topic, payload) = &publisher.client().published()[0];
        assert_eq!(topic, "pico/metrics");
        assert_eq!(payload, br#"{"temperature_celsius":24.5,"uptime_seconds":12}"#);
    }

    #[tokio::test]
    async fn test_publish_failure_tears_down_session() {
        let broker = SimBroker::new().script_publishes([Err(TransportError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "broken pipe",
        )))]);
        let mut publisher = TransportPublisher::new(broker, "pico/metrics");
        assert!(publisher.connect().await);

        assert!(!publisher.publish(&snapshot()).await);
        assert!(!publisher.is_connected());
        assert_eq!(publisher.client().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_swallows_close_errors() {
        let broker = SimBroker::new().failing_close();
        let mut publisher = TransportPublisher::new(broker, "pico/metrics");
        assert!(publisher.connect().await);

        publisher.disconnect().await;
        publisher.disconnect().await;
        assert!(!publisher.is_connected());
        assert_eq!(publisher.client().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_existing_session() {
        let mut publisher = TransportPublisher::new(SimBroker::new(), "pico/metrics");
        assert!(publisher.connect().await);
        assert!(publisher.connect().await);

        assert_eq!(publisher.client().open_calls(), 2);
        assert_eq!(publisher.client().close_calls(), 1);
    }
}
