//! Network association management.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::platform::{LinkStatus, Radio};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Status polls after a join request before giving up.
pub const ASSOCIATION_POLL_ATTEMPTS: u32 = 15;

/// Delay between status polls.
pub const ASSOCIATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of a connection (network link or publish session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the radio and its association with the configured network.
pub struct LinkManager<R: Radio> {
    radio: R,
    ssid: String,
    password: String,
    state: ConnectionState,
}

impl<R: Radio> LinkManager<R> {
    pub fn new(radio: R, ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            radio,
            ssid: ssid.into(),
            password: password.into(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn from_config(radio: R, config: &AgentConfig) -> Self {
        Self::new(radio, config.ssid.clone(), config.password.clone())
    }

    /// Join the network and wait for an address, polling once a second.
    ///
    /// Returns `false` on a terminal status, a radio error, or when the
    /// poll budget runs out. Never retries on its own.
    pub async fn connect(&mut self) -> bool {
        info!("Connecting to WiFi '{}'...", self.ssid);
        self.state = ConnectionState::Connecting;

        match self.associate().await {
            Ok(LinkStatus::Up) => {
                self.state = ConnectionState::Connected;
                match self.radio.ifconfig() {
                    Ok(ifconfig) => info!("Connected! IP: {}", ifconfig.ip),
                    Err(_) => info!("Connected!"),
                }
                true
            }
            Ok(status) => {
                self.state = ConnectionState::Disconnected;
                warn!("WiFi connection failed (status {})", status.code());
                false
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                warn!("WiFi connection failed: {}", err);
                false
            }
        }
    }

    async fn associate(&mut self) -> Result<LinkStatus> {
        self.radio.activate()?;
        self.radio.join(&self.ssid, &self.password)?;

        let mut status = self.radio.status()?;
        for _ in 0..ASSOCIATION_POLL_ATTEMPTS {
            if status.is_settled() {
                break;
            }
            debug!("Waiting for connection...");
            sleep(ASSOCIATION_POLL_INTERVAL).await;
            status = self.radio.status()?;
        }
        Ok(status)
    }

    /// Whether the radio currently reports an address-assigned association.
    pub fn is_connected(&self) -> bool {
        matches!(self.radio.status(), Ok(LinkStatus::Up))
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected if !self.is_connected() => ConnectionState::Disconnected,
            state => state,
        }
    }

    /// Raw status code, or `None` when the radio cannot be queried.
    pub fn status_code(&self) -> Option<i32> {
        self.radio.status().ok().map(LinkStatus::code)
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimRadio;
    use tokio::time::Instant;

    fn assert_elapsed(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "expected ~{:?}, got {:?}",
            expected,
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_address() {
        let mut link = LinkManager::new(SimRadio::new().with_join_latency(3), "lab", "secret");
        let started = Instant::now();

        assert!(link.connect().await);
        assert!(link.is_connected());
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_elapsed(started, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_poll_budget() {
        let mut link = LinkManager::new(SimRadio::new().with_join_latency(100), "lab", "secret");
        let started = Instant::now();

        assert!(!link.connect().await);
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_elapsed(started, ASSOCIATION_POLL_INTERVAL * ASSOCIATION_POLL_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_fails_fast() {
        let radio = SimRadio::new().script_joins([LinkStatus::BadAuth]);
        let mut link = LinkManager::new(radio, "lab", "wrong");
        let started = Instant::now();

        assert!(!link.connect().await);
        assert_elapsed(started, Duration::ZERO);
        assert_eq!(link.status_code(), Some(-3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_keeps_polling_while_address_pending() {
        let radio = SimRadio::new().script_polls([
            LinkStatus::Joining,
            LinkStatus::NoIp,
            LinkStatus::NoIp,
        ]);
        let mut link = LinkManager::new(radio, "lab", "secret");
        let started = Instant::now();

        assert!(link.connect().await);
        assert!(link.is_connected());
        assert_elapsed(started, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_never_assigned_fails_after_poll_budget() {
        let polls = std::iter::repeat(LinkStatus::NoIp).take(ASSOCIATION_POLL_ATTEMPTS as usize + 1);
        let mut link = LinkManager::new(SimRadio::new().script_polls(polls), "lab", "secret");
        let started = Instant::now();

        assert!(!link.connect().await);
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_elapsed(started, ASSOCIATION_POLL_INTERVAL * ASSOCIATION_POLL_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_follows_radio_after_loss() {
        let mut link = LinkManager::new(SimRadio::new(), "lab", "secret");
        assert!(link.connect().await);

        link.radio_mut().drop_link();
        assert!(!link.is_connected());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }
}
