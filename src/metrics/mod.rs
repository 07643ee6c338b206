//! Metrics collection and data structures.
//!
//! This module samples die temperature, heap state, the radio link, supply
//! voltage and clock speed into a flat, ordered snapshot ready to publish.

pub mod collector;
pub mod data;

// Re-export commonly used items
pub use collector::MetricsCollector;
pub use data::{MetricValue, MetricsSnapshot};
