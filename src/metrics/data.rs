//! Data structures for metrics snapshots and the fixed transfer functions
//! applied to raw readings.

use crate::error::{AgentError, Result};
use serde::ser::{Serialize, Serializer};
use serde::Deserialize;

/// Reported when a reading is unavailable.
pub const SENTINEL: i64 = -1;

/// Reported as RSSI when the radio is not associated.
pub const DISCONNECTED_RSSI: i32 = -100;

/// A single metric value. Booleans are carried as `Int` 0/1.
#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One complete metrics record, keyed by metric name in insertion order.
///
/// Serializes as a single flat JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    entries: Vec<(String, MetricValue)>,
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty snapshot with room for `capacity` metrics.
    ///
    /// Fails with [`AgentError::OutOfMemory`] when the buffer cannot be reserved.
    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|e| AgentError::out_of_memory(format!("snapshot buffer: {}", e)))?;
        Ok(Self { entries })
    }

    /// Insert a metric, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Merge another category map into this one; later values win.
    pub fn merge(&mut self, other: MetricsSnapshot) {
        for (name, value) in other.entries {
            self.insert(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compact UTF-8 JSON wire payload.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(key, value)| (key, value)))
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Convert a raw die-temperature ADC reading to degrees Celsius.
pub fn temperature_from_raw(raw: u16) -> f64 {
    let volts = raw as f64 * 3.3 / 65535.0;
    round2(27.0 - (volts - 0.706) / 0.001721)
}

/// Convert a raw supply-rail ADC reading to volts (1:3 divider).
pub fn vsys_from_raw(raw: u16) -> f64 {
    round2(raw as f64 * (3.3 / 65535.0) * 3.0)
}

/// Map RSSI in [-100, -30] dBm linearly onto [0, 100], clamped.
pub fn signal_quality(rssi: i32) -> i64 {
    (2 * (i64::from(rssi) + 100)).clamp(0, 100)
}

/// Categorical link quality for a signal-quality percentage.
pub fn link_quality(quality: i64) -> &'static str {
    match quality {
        q if q >= 80 => "excellent",
        q if q >= 60 => "good",
        q if q >= 40 => "fair",
        _ => "poor",
    }
}

/// Power source and battery estimate for a supply voltage.
pub fn classify_power(vsys: f64) -> (&'static str, f64) {
    if vsys > 4.5 {
        ("usb", 100.0)
    } else if vsys >= 3.3 {
        ("battery", round2((vsys - 3.3) / 0.9 * 100.0).clamp(0.0, 100.0))
    } else {
        ("critical", 0.0)
    }
}

/// Clock-speed bucket for a CPU frequency.
pub fn cpu_mode(frequency_hz: u64) -> &'static str {
    match frequency_hz {
        f if f >= 250_000_000 => "performance",
        f if f >= 125_000_000 => "normal",
        _ => "power_save",
    }
}

/// Composite health verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Health {
    pub status: &'static str,
    pub issues: Vec<&'static str>,
    pub score: i64,
}

/// Classify overall health. `None` readings raise no issue of their own;
/// `rssi` of `None` means the radio is not associated.
pub fn assess_health(temperature: Option<f64>, memory_usage: Option<f64>, rssi: Option<i32>) -> Health {
    let mut issues = Vec::new();
    let temperature = temperature.unwrap_or(f64::MIN);
    let memory_usage = memory_usage.unwrap_or(f64::MIN);

    if temperature > 70.0 {
        issues.push("high_temperature");
    }
    if memory_usage > 90.0 {
        issues.push("high_memory_usage");
    }
    match rssi {
        Some(rssi) if rssi < -80 => issues.push("weak_wifi_signal"),
        Some(_) => {}
        None => issues.push("wifi_disconnected"),
    }

    let status = if temperature > 75.0 || memory_usage > 95.0 {
        "critical"
    } else if issues.is_empty() {
        "healthy"
    } else {
        "warning"
    };
    let score = (100 - 25 * issues.len() as i64).max(0);

    Health { status, issues, score }
}
