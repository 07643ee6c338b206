//! The resilience loop.
//!
//! Keeps the network link and the publish session alive, collects a
//! snapshot each cycle and publishes it, and decides when a session must be
//! torn down. Everything runs sequentially on one task; the only suspension
//! points are the sleeps below and the connect/publish awaits.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::link::{ConnectionState, LinkManager};
use crate::metrics::{MetricValue, MetricsCollector, MetricsSnapshot};
use crate::platform::{Board, Heap, Radio};
use crate::transport::{BrokerClient, TransportPublisher};
use futures_util::FutureExt;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Consecutive publish failures that force a session teardown.
pub const PUBLISH_FAILURE_THRESHOLD: u32 = 3;

/// Wait after the first association before opening the session.
pub const INIT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Wait after a failed link reconnect.
pub const LINK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Wait after a successful link reconnect before reopening the session.
pub const LINK_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Wait when the session cannot be reopened after a link reconnect.
pub const RELINK_SESSION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Wait after a failed session reconnect.
pub const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Pause after a forced teardown or a loop error.
pub const FAULT_PAUSE: Duration = Duration::from_secs(5);

/// Delay before restarting after initialization fails.
pub const FATAL_RESTART_DELAY: Duration = Duration::from_secs(30);

/// Delay before restarting after an unhandled fault escapes the loop.
pub const CRASH_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Counters owned by the loop for the life of the process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureCounters {
    /// Network reconnections since boot
    pub reconnect_count: u64,
    /// Publish failures since the last success
    pub consecutive_publish_failures: u32,
    pub publish_success_total: u64,
    pub publish_failed_total: u64,
    /// Unclassified loop errors since boot
    pub error_count: u64,
    /// When the last publish was attempted
    pub last_publish: Option<Instant>,
}

impl FailureCounters {
    pub fn record_publish(&mut self, success: bool) {
        if success {
            self.consecutive_publish_failures = 0;
            self.publish_success_total += 1;
        } else {
            self.consecutive_publish_failures += 1;
            self.publish_failed_total += 1;
        }
        self.last_publish = Some(Instant::now());
    }

    pub fn publish_threshold_reached(&self) -> bool {
        self.consecutive_publish_failures >= PUBLISH_FAILURE_THRESHOLD
    }
}

/// How one loop iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Snapshot delivered
    Published,
    /// Publish failed below the teardown threshold
    PublishFailed,
    /// Publish failures reached the threshold; session torn down
    TransportReset,
    /// Link down and could not be re-associated
    LinkDown,
    /// Session could not be (re)established
    TransportDown,
}

/// Orchestrates link, transport and metrics.
pub struct Supervisor<R: Radio, C: BrokerClient, B: Board, H: Heap> {
    link: LinkManager<R>,
    transport: TransportPublisher<C>,
    metrics: MetricsCollector<B, H>,
    counters: FailureCounters,
    publish_interval: Duration,
}

impl<R: Radio, C: BrokerClient, B: Board, H: Heap> Supervisor<R, C, B, H> {
    pub fn new(config: &AgentConfig, radio: R, client: C, board: B, heap: H) -> Self {
        Self {
            link: LinkManager::from_config(radio, config),
            transport: TransportPublisher::new(client, config.topic.clone()),
            metrics: MetricsCollector::from_config(board, heap, config),
            counters: FailureCounters::default(),
            publish_interval: config.publish_interval(),
        }
    }

    /// Bring up the link, let it settle, then open the session.
    pub async fn init(&mut self) -> Result<()> {
        info!("=== System Initialization ===");
        if !self.link.connect().await {
            return Err(AgentError::init_error("WiFi initialization failed"));
        }

        info!("Waiting for network stability...");
        sleep(INIT_SETTLE_DELAY).await;

        if !self.transport.connect().await {
            return Err(AgentError::init_error("MQTT initialization failed"));
        }
        info!("=== System Ready ===");
        Ok(())
    }

    /// Run cycles forever. Nothing raised inside an iteration escapes.
    pub async fn run(&mut self) -> Infallible {
        info!("Starting main loop...");
        loop {
            self.cycle().await;
        }
    }

    /// One guarded iteration: errors and panics from [`Self::run_once`] are
    /// routed to [`Self::recover`], which yields `None`.
    pub async fn cycle(&mut self) -> Option<Cycle> {
        let outcome = AssertUnwindSafe(self.run_once()).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(cycle)) => return Some(cycle),
            Ok(Err(err)) => err,
            Err(payload) => AgentError::from_panic(payload.as_ref()),
        };
        self.recover(err).await;
        None
    }

    /// One iteration: heal connections, collect, publish, pace.
    pub async fn run_once(&mut self) -> Result<Cycle> {
        if !self.link.is_connected() {
            warn!("WiFi disconnected, reconnecting...");
            self.transport.disconnect().await;
            if !self.link.connect().await {
                warn!("WiFi reconnection failed, waiting {}s...", LINK_RETRY_DELAY.as_secs());
                sleep(LINK_RETRY_DELAY).await;
                return Ok(Cycle::LinkDown);
            }
            self.counters.reconnect_count += 1;

            sleep(LINK_SETTLE_DELAY).await;
            if !self.transport.connect().await {
                warn!("MQTT reconnection after WiFi failed");
                sleep(RELINK_SESSION_RETRY_DELAY).await;
                return Ok(Cycle::TransportDown);
            }
        } else if !self.transport.is_connected() {
            warn!("MQTT disconnected, reconnecting...");
            if !self.transport.connect().await {
                warn!("MQTT reconnection failed, waiting {}s...", TRANSPORT_RETRY_DELAY.as_secs());
                sleep(TRANSPORT_RETRY_DELAY).await;
                return Ok(Cycle::TransportDown);
            }
        }

        let snapshot = self.metrics.snapshot(&self.link, &self.counters)?;
        log_summary(&snapshot);

        let published = self.transport.publish(&snapshot).await;
        self.counters.record_publish(published);
        if !published {
            warn!(
                "Publish failed (consecutive failures: {})",
                self.counters.consecutive_publish_failures
            );
            if self.counters.publish_threshold_reached() {
                warn!("Too many errors, forcing reconnection...");
                self.transport.disconnect().await;
                sleep(FAULT_PAUSE).await;
                return Ok(Cycle::TransportReset);
            }
        }

        sleep(self.publish_interval).await;
        Ok(if published {
            Cycle::Published
        } else {
            Cycle::PublishFailed
        })
    }

    /// Respond to an error that escaped an iteration.
    ///
    /// Memory exhaustion reclaims and keeps the connections; anything else
    /// is counted and drops the session.
    pub async fn recover(&mut self, err: AgentError) {
        if err.is_out_of_memory() {
            warn!("Memory Error: {}", err);
            self.metrics.heap_mut().collect();
            info!("Memory freed, retrying...");
        } else {
            error!("Unexpected Error: {}", err);
            self.counters.error_count += 1;
            self.transport.disconnect().await;
        }
        sleep(FAULT_PAUSE).await;
    }

    /// (network, transport) connection states. A session held over a dead
    /// link reports `Disconnected`.
    pub fn connection_states(&self) -> (ConnectionState, ConnectionState) {
        let link = self.link.state();
        let transport = match link {
            ConnectionState::Connected => self.transport.state(),
            _ => ConnectionState::Disconnected,
        };
        (link, transport)
    }

    pub fn counters(&self) -> &FailureCounters {
        &self.counters
    }

    pub fn link(&self) -> &LinkManager<R> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkManager<R> {
        &mut self.link
    }

    pub fn transport(&self) -> &TransportPublisher<C> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut TransportPublisher<C> {
        &mut self.transport
    }

    pub fn metrics_mut(&mut self) -> &mut MetricsCollector<B, H> {
        &mut self.metrics
    }

    /// Invoke the board's reset primitive.
    pub fn reset_device(&mut self) -> ! {
        self.metrics.board_mut().reset()
    }
}

fn log_summary(snapshot: &MetricsSnapshot) {
    let field = |name: &str| {
        snapshot
            .get(name)
            .and_then(MetricValue::as_f64)
            .map_or_else(|| "n/a".to_string(), |v| v.to_string())
    };
    info!(
        "Temp: {}°C | Memory: {}% | WiFi RSSI: {} dBm | Uptime: {}s",
        field("temperature_celsius"),
        field("memory_usage_percent"),
        field("wifi_rssi_dbm"),
        field("uptime_seconds")
    );
}
