//! # Pico Telemetry - Device-Resident Metrics Agent
//!
//! Reads onboard sensors (die temperature, supply voltage, heap state, radio
//! link), keeps a WiFi association and an MQTT session alive, and publishes a
//! flat JSON metrics snapshot on a steady cadence.
//!
//! ## Features
//!
//! - **Resilience loop**: link and session are healed independently; repeated
//!   publish failures force a clean session, fatal bring-up restarts the device
//! - **Degrading metrics**: every sensor reader fails on its own, falling back
//!   to sentinel values instead of dropping the snapshot
//! - **Configurable snapshot**: full or minimal category sets, optional heap
//!   fragmentation probe
//! - **Pluggable hardware**: Linux host backend plus a scripted simulator
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pico_telemetry::{
//!     platform::sim::{SimBoard, SimHeap, SimRadio},
//!     transport::sim::SimBroker,
//!     AgentConfig, Supervisor,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::new("lab", "secret", "localhost");
//!     let mut supervisor = Supervisor::new(
//!         &config,
//!         SimRadio::new(),
//!         SimBroker::new(),
//!         SimBoard::new(),
//!         SimHeap::new(),
//!     );
//!     supervisor.init().await?;
//!     supervisor.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod platform;
pub mod supervisor;
pub mod transport;

// Re-export public API
pub use config::{AgentConfig, CategorySet};
pub use error::{AgentError, Result};
pub use link::{ConnectionState, LinkManager};
pub use metrics::{MetricValue, MetricsCollector, MetricsSnapshot};
pub use supervisor::{Cycle, FailureCounters, Supervisor};
pub use transport::{BrokerClient, TransportError, TransportPublisher};

/// The default publish interval in seconds
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 10;

/// The default MQTT broker port
pub const DEFAULT_BROKER_PORT: u16 = 1883;
