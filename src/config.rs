//! Agent configuration.
//!
//! Loaded once at startup and never reloaded. The binary fills it from CLI
//! flags and environment variables.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the telemetry agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Network name to associate with
    pub ssid: String,
    /// Network passphrase
    pub password: String,
    /// Broker host name or address
    pub broker_host: String,
    /// Broker TCP port
    pub broker_port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Topic every snapshot is published under
    pub topic: String,
    /// Seconds between successful publish cycles
    pub publish_interval_secs: u64,
    /// Metric categories included in each snapshot
    pub categories: CategorySet,
    /// Run the heap fragmentation probe (allocates half the free heap)
    pub fragmentation_probe: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            broker_host: "localhost".to_string(),
            broker_port: crate::DEFAULT_BROKER_PORT,
            client_id: "pico-telemetry".to_string(),
            topic: "pico/metrics".to_string(),
            publish_interval_secs: crate::DEFAULT_PUBLISH_INTERVAL_SECS,
            categories: CategorySet::full(),
            fragmentation_probe: false,
        }
    }
}

impl AgentConfig {
    /// Create a configuration for the given network and broker.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>, broker_host: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            broker_host: broker_host.into(),
            ..Default::default()
        }
    }

    /// Set the broker port.
    pub fn with_broker_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set the publish topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the publish interval in seconds.
    pub fn with_publish_interval(mut self, secs: u64) -> Self {
        self.publish_interval_secs = secs;
        self
    }

    /// Set the metric categories.
    pub fn with_categories(mut self, categories: CategorySet) -> Self {
        self.categories = categories;
        self
    }

    /// Enable or disable the fragmentation probe.
    pub fn with_fragmentation_probe(mut self, enabled: bool) -> Self {
        self.fragmentation_probe = enabled;
        self
    }

    /// Interval slept after each publish cycle.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    /// Get the full broker address.
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(AgentError::config_error("SSID must not be empty"));
        }
        if self.broker_host.is_empty() {
            return Err(AgentError::config_error("broker host must not be empty"));
        }
        if self.broker_port == 0 {
            return Err(AgentError::config_error("broker port must be non-zero"));
        }
        if self.topic.is_empty() || self.topic.contains(['+', '#']) {
            return Err(AgentError::config_error(format!("invalid publish topic '{}'", self.topic)));
        }
        Ok(())
    }
}

/// Optional metric categories. Temperature, uptime and the error counter are
/// always collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySet {
    pub memory: bool,
    pub network: bool,
    pub system: bool,
    pub gc: bool,
    pub power: bool,
    pub performance: bool,
    pub publish_stats: bool,
    pub health: bool,
}

impl CategorySet {
    /// Every category.
    pub const fn full() -> Self {
        Self {
            memory: true,
            network: true,
            system: true,
            gc: true,
            power: true,
            performance: true,
            publish_stats: true,
            health: true,
        }
    }

    /// Memory, network, identity and GC cadence only.
    pub const fn minimal() -> Self {
        Self {
            memory: true,
            network: true,
            system: true,
            gc: true,
            power: false,
            performance: false,
            publish_stats: false,
            health: false,
        }
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::full()
    }
}
