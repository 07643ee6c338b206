//! Snapshot assembly from independent, individually fallible sub-readers.

use crate::config::{AgentConfig, CategorySet};
use crate::error::Result;
use crate::link::LinkManager;
use crate::metrics::data::*;
use crate::platform::{format_mac, AllocFailure, Board, Heap, IpConfig, Radio};
use crate::supervisor::FailureCounters;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound on the number of metrics in a full snapshot.
const SNAPSHOT_CAPACITY: usize = 64;

/// One heap reading.
#[derive(Debug, Clone, Copy)]
struct MemoryReading {
    free: u64,
    allocated: u64,
    usage_percent: f64,
}

/// Radio readings taken while associated.
#[derive(Debug, Clone)]
struct LinkReading {
    rssi: i32,
    mac: Option<String>,
    ifconfig: Option<IpConfig>,
    channel: i32,
}

/// Samples the board, heap and radio into flat metric snapshots.
///
/// Holds the running aggregates (peak temperature, weakest signal, GC
/// cadence) for the lifetime of the process.
pub struct MetricsCollector<B: Board, H: Heap> {
    board: B,
    heap: H,
    categories: CategorySet,
    fragmentation_probe: bool,
    start_time: Instant,
    max_temp_seen: f64,
    min_rssi_seen: Option<i32>,
    last_gc_sample: Instant,
    gc_samples: u64,
}

impl<B: Board, H: Heap> MetricsCollector<B, H> {
    pub fn new(board: B, heap: H) -> Self {
        let now = Instant::now();
        Self {
            board,
            heap,
            categories: CategorySet::full(),
            fragmentation_probe: false,
            start_time: now,
            max_temp_seen: 0.0,
            min_rssi_seen: None,
            last_gc_sample: now,
            gc_samples: 0,
        }
    }

    pub fn from_config(board: B, heap: H, config: &AgentConfig) -> Self {
        Self::new(board, heap)
            .with_categories(config.categories)
            .with_fragmentation_probe(config.fragmentation_probe)
    }

    pub fn with_categories(mut self, categories: CategorySet) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_fragmentation_probe(mut self, enabled: bool) -> Self {
        self.fragmentation_probe = enabled;
        self
    }

    /// Collect one snapshot.
    ///
    /// A failing reader only degrades its own fields; the sole error is
    /// running out of memory for the record itself.
    pub fn snapshot<R: Radio>(
        &mut self,
        link: &LinkManager<R>,
        counters: &FailureCounters,
    ) -> Result<MetricsSnapshot> {
        let mut snapshot = MetricsSnapshot::try_with_capacity(SNAPSHOT_CAPACITY)?;
        let categories = self.categories;

        let temperature = self.read_temperature();
        snapshot.insert("temperature_celsius", temperature.unwrap_or(SENTINEL as f64));
        snapshot.insert("uptime_seconds", self.uptime_seconds());
        snapshot.insert("error_count", counters.error_count);

        let memory = if categories.memory || categories.health {
            self.read_memory()
        } else {
            None
        };
        if categories.memory {
            snapshot.merge(self.memory_metrics(memory));
        }

        let wifi = self.read_link(link);
        if categories.network {
            snapshot.merge(self.network_metrics(link, wifi.as_ref(), counters.reconnect_count));
        }
        if categories.system {
            snapshot.merge(self.system_metrics());
        }

        let gc = self.gc_metrics();
        if categories.gc {
            snapshot.merge(gc);
        }
        if categories.power {
            snapshot.merge(self.power_metrics());
        }
        if categories.performance {
            snapshot.merge(self.performance_metrics());
        }
        if categories.publish_stats {
            snapshot.merge(self.publish_metrics(counters));
        }
        if categories.health {
            let health = assess_health(
                temperature,
                memory.map(|m| m.usage_percent),
                wifi.as_ref().map(|w| w.rssi),
            );
            snapshot.merge(health_metrics(&health));
        }

        debug!(metrics = snapshot.len(), "Snapshot collected");
        Ok(snapshot)
    }

    fn read_temperature(&mut self) -> Option<f64> {
        match self.board.read_temperature_raw() {
            Ok(raw) => {
                let celsius = temperature_from_raw(raw);
                self.max_temp_seen = self.max_temp_seen.max(celsius);
                Some(celsius)
            }
            Err(err) => {
                warn!("Temperature read failed: {}", err);
                None
            }
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn read_memory(&mut self) -> Option<MemoryReading> {
        self.heap.collect();
        let reading = self
            .heap
            .free_bytes()
            .and_then(|free| self.heap.allocated_bytes().map(|allocated| (free, allocated)));
        match reading {
            Ok((free, allocated)) => {
                let total = free + allocated;
                let usage_percent = if total > 0 {
                    round2(allocated as f64 / total as f64 * 100.0)
                } else {
                    0.0
                };
                Some(MemoryReading {
                    free,
                    allocated,
                    usage_percent,
                })
            }
            Err(err) => {
                warn!("Heap read failed: {}", err);
                None
            }
        }
    }

    fn memory_metrics(&mut self, memory: Option<MemoryReading>) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        match memory {
            Some(memory) => {
                metrics.insert("memory_free_bytes", memory.free);
                metrics.insert("memory_allocated_bytes", memory.allocated);
                metrics.insert("memory_total_bytes", memory.free + memory.allocated);
                metrics.insert("memory_usage_percent", memory.usage_percent);
                metrics.insert("memory_fragmentation", self.fragmentation(memory.free));
            }
            None => {
                metrics.insert("memory_free_bytes", 0);
                metrics.insert("memory_allocated_bytes", 0);
                metrics.insert("memory_total_bytes", 0);
                metrics.insert("memory_usage_percent", SENTINEL as f64);
                metrics.insert("memory_fragmentation", SENTINEL as f64);
            }
        }
        metrics
    }

    /// Estimate fragmentation by trying to allocate half of the free heap.
    ///
    /// Expensive: performs a real allocation, so it only runs when enabled.
    fn fragmentation(&mut self, free: u64) -> f64 {
        if !self.fragmentation_probe {
            return SENTINEL as f64;
        }
        let size = free / 2;
        match self.heap.probe_alloc(size) {
            Ok(()) => 0.0,
            Err(AllocFailure::OutOfMemory) => match self.heap.free_bytes() {
                Ok(free_after) if free_after > 0 => {
                    round2((1.0 - size as f64 / free_after as f64) * 100.0)
                }
                _ => SENTINEL as f64,
            },
            Err(AllocFailure::Other) => SENTINEL as f64,
        }
    }

    fn read_link<R: Radio>(&mut self, link: &LinkManager<R>) -> Option<LinkReading> {
        if !link.is_connected() {
            return None;
        }
        let radio = link.radio();
        let rssi = match radio.rssi() {
            Ok(rssi) => rssi,
            Err(err) => {
                warn!("RSSI read failed: {}", err);
                return None;
            }
        };
        self.min_rssi_seen = Some(self.min_rssi_seen.map_or(rssi, |min| min.min(rssi)));

        Some(LinkReading {
            rssi,
            mac: radio.mac().ok().map(|mac| format_mac(&mac)),
            ifconfig: radio.ifconfig().ok(),
            channel: radio.channel().unwrap_or(SENTINEL as i32),
        })
    }

    fn network_metrics<R: Radio>(
        &self,
        link: &LinkManager<R>,
        wifi: Option<&LinkReading>,
        reconnect_count: u64,
    ) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        metrics.insert("wifi_connected", wifi.is_some());
        metrics.insert("wifi_status", link.status_code().unwrap_or(SENTINEL as i32));
        metrics.insert("wifi_reconnect_count", reconnect_count);

        let Some(wifi) = wifi else {
            metrics.insert("wifi_rssi_dbm", DISCONNECTED_RSSI);
            metrics.insert("wifi_signal_quality_percent", 0);
            metrics.insert("wifi_link_quality", "disconnected");
            metrics.insert("wifi_mac", "disconnected");
            metrics.insert("wifi_ip", "0.0.0.0");
            metrics.insert("wifi_channel", SENTINEL);
            return metrics;
        };

        let quality = signal_quality(wifi.rssi);
        metrics.insert("wifi_rssi_dbm", wifi.rssi);
        metrics.insert("wifi_rssi_min_dbm", self.min_rssi_seen.unwrap_or(wifi.rssi));
        metrics.insert("wifi_signal_quality_percent", quality);
        metrics.insert("wifi_link_quality", link_quality(quality));
        metrics.insert("wifi_mac", wifi.mac.clone().unwrap_or_else(|| "unknown".to_string()));
        match &wifi.ifconfig {
            Some(ifconfig) => {
                metrics.insert("wifi_ip", ifconfig.ip.to_string());
                metrics.insert("wifi_netmask", ifconfig.netmask.to_string());
                metrics.insert("wifi_gateway", ifconfig.gateway.to_string());
                metrics.insert("wifi_dns", ifconfig.dns.to_string());
            }
            None => metrics.insert("wifi_ip", "0.0.0.0"),
        }
        metrics.insert("wifi_channel", wifi.channel);
        metrics
    }

    fn system_metrics(&self) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        match self.board.identity() {
            Ok(identity) => {
                metrics.insert("sys_unique_id", identity.unique_id);
                metrics.insert("sys_version", identity.version);
                metrics.insert("sys_platform", identity.platform);
                metrics.insert("sys_machine", identity.machine);
                metrics.insert("sys_release", identity.release);
            }
            Err(err) => {
                warn!("Identity read failed: {}", err);
                for key in ["sys_unique_id", "sys_version", "sys_platform", "sys_machine", "sys_release"] {
                    metrics.insert(key, "unknown");
                }
            }
        }
        metrics
    }

    /// Counts samples of this metric, not actual collection passes.
    fn gc_metrics(&mut self) -> MetricsSnapshot {
        let now = Instant::now();
        let since_last = now.duration_since(self.last_gc_sample).as_secs_f64();
        self.gc_samples += 1;
        self.last_gc_sample = now;

        let mut metrics = MetricsSnapshot::new();
        metrics.insert("gc_collections_total", self.gc_samples);
        metrics.insert("gc_time_since_last", round2(since_last));
        metrics
    }

    fn power_metrics(&mut self) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        match self.board.read_vsys_raw() {
            Ok(raw) => {
                let vsys = vsys_from_raw(raw);
                let (source, battery) = classify_power(vsys);
                metrics.insert("vsys_voltage", vsys);
                metrics.insert("power_source", source);
                metrics.insert("battery_percent", battery);
            }
            Err(err) => {
                debug!("Supply voltage unavailable: {}", err);
                metrics.insert("vsys_voltage", SENTINEL as f64);
                metrics.insert("power_source", "unknown");
                metrics.insert("battery_percent", SENTINEL as f64);
            }
        }
        metrics
    }

    fn performance_metrics(&mut self) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        let (frequency, mode) = match self.board.cpu_frequency_hz() {
            Ok(hz) => (hz, cpu_mode(hz)),
            Err(err) => {
                debug!("CPU frequency unavailable: {}", err);
                (0, "unknown")
            }
        };
        metrics.insert("cpu_frequency_hz", frequency);
        metrics.insert("cpu_frequency_mhz", round2(frequency as f64 / 1_000_000.0));
        metrics.insert("cpu_mode", mode);
        metrics.insert("cpu_temp_max_celsius", self.max_temp_seen);
        metrics
    }

    fn publish_metrics(&self, counters: &FailureCounters) -> MetricsSnapshot {
        let total = counters.publish_success_total + counters.publish_failed_total;
        let success_rate = if total > 0 {
            round2(counters.publish_success_total as f64 / total as f64 * 100.0)
        } else {
            0.0
        };
        let since_last = counters.last_publish.unwrap_or(self.start_time).elapsed();

        let mut metrics = MetricsSnapshot::new();
        metrics.insert("mqtt_publish_success_total", counters.publish_success_total);
        metrics.insert("mqtt_publish_failed_total", counters.publish_failed_total);
        metrics.insert("mqtt_publish_total", total);
        metrics.insert("mqtt_publish_success_rate", success_rate);
        metrics.insert("mqtt_publish_interval_seconds", round2(since_last.as_secs_f64()));
        metrics
    }

    /// Highest temperature seen since start.
    pub fn max_temp_seen(&self) -> f64 {
        self.max_temp_seen
    }

    /// Weakest signal seen since start, once the radio has reported one.
    pub fn min_rssi_seen(&self) -> Option<i32> {
        self.min_rssi_seen
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }
}

fn health_metrics(health: &Health) -> MetricsSnapshot {
    let mut metrics = MetricsSnapshot::new();
    metrics.insert("health_status", health.status);
    metrics.insert("health_issues_count", health.issues.len() as u64);
    metrics.insert("health_issues", health.issues.join(","));
    metrics.insert("health_score", health.score);
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::{SimBoard, SimHeap, SimRadio};

    fn collector() -> MetricsCollector<SimBoard, SimHeap> {
        MetricsCollector::new(SimBoard::new(), SimHeap::new())
    }

    #[tokio::test]
    async fn test_disconnected_link_uses_sentinels() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let snapshot = collector().snapshot(&link, &FailureCounters::default()).unwrap();

        assert_eq!(snapshot.get("wifi_rssi_dbm"), Some(&MetricValue::Int(-100)));
        assert_eq!(snapshot.get("wifi_ip").and_then(|v| v.as_str()), Some("0.0.0.0"));
        assert_eq!(snapshot.get("wifi_link_quality").and_then(|v| v.as_str()), Some("disconnected"));
        assert_eq!(snapshot.get("wifi_channel"), Some(&MetricValue::Int(-1)));
        assert_eq!(snapshot.get("wifi_connected"), Some(&MetricValue::Int(0)));
        assert_eq!(snapshot.get("health_issues").and_then(|v| v.as_str()), Some("wifi_disconnected"));
    }

    #[tokio::test]
    async fn test_associated_link_reports_radio_details() {
        let link = LinkManager::new(SimRadio::associated(), "lab", "secret");
        let snapshot = collector().snapshot(&link, &FailureCounters::default()).unwrap();

        assert_eq!(snapshot.get("wifi_rssi_dbm"), Some(&MetricValue::Int(-55)));
        assert_eq!(snapshot.get("wifi_signal_quality_percent"), Some(&MetricValue::Int(90)));
        assert_eq!(snapshot.get("wifi_link_quality").and_then(|v| v.as_str()), Some("excellent"));
        assert_eq!(snapshot.get("wifi_mac").and_then(|v| v.as_str()), Some("28:cd:c1:00:00:01"));
        assert_eq!(snapshot.get("wifi_gateway").and_then(|v| v.as_str()), Some("192.168.1.1"));
        assert_eq!(snapshot.get("wifi_channel"), Some(&MetricValue::Int(6)));
        assert_eq!(snapshot.get("health_status").and_then(|v| v.as_str()), Some("healthy"));
    }

    #[tokio::test]
    async fn test_channel_failure_degrades_only_channel() {
        let mut radio = SimRadio::associated();
        radio.channel = None;
        let link = LinkManager::new(radio, "lab", "secret");
        let snapshot = collector().snapshot(&link, &FailureCounters::default()).unwrap();

        assert_eq!(snapshot.get("wifi_channel"), Some(&MetricValue::Int(-1)));
        assert_eq!(snapshot.get("wifi_rssi_dbm"), Some(&MetricValue::Int(-55)));
    }

    #[tokio::test]
    async fn test_min_rssi_first_reading_wins_then_tightens() {
        let mut link = LinkManager::new(SimRadio::associated(), "lab", "secret");
        let mut collector = collector();
        let counters = FailureCounters::default();

        link.radio_mut().rssi = Some(-60);
        collector.snapshot(&link, &counters).unwrap();
        assert_eq!(collector.min_rssi_seen(), Some(-60));

        link.radio_mut().rssi = Some(-48);
        collector.snapshot(&link, &counters).unwrap();
        assert_eq!(collector.min_rssi_seen(), Some(-60));

        link.radio_mut().rssi = Some(-72);
        let snapshot = collector.snapshot(&link, &counters).unwrap();
        assert_eq!(snapshot.get("wifi_rssi_min_dbm"), Some(&MetricValue::Int(-72)));
    }

    #[tokio::test]
    async fn test_failed_sensors_degrade_to_sentinels() {
        let mut board = SimBoard::new();
        board.temperature_raw = None;
        board.vsys_raw = None;
        board.cpu_frequency_hz = None;
        let mut heap = SimHeap::new();
        heap.unreadable = true;
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");

        let snapshot = MetricsCollector::new(board, heap)
            .snapshot(&link, &FailureCounters::default())
            .unwrap();

        assert_eq!(snapshot.get("temperature_celsius"), Some(&MetricValue::Float(-1.0)));
        assert_eq!(snapshot.get("memory_usage_percent"), Some(&MetricValue::Float(-1.0)));
        assert_eq!(snapshot.get("power_source").and_then(|v| v.as_str()), Some("unknown"));
        assert_eq!(snapshot.get("cpu_mode").and_then(|v| v.as_str()), Some("unknown"));
        assert!(snapshot.contains("uptime_seconds"));
        assert!(snapshot.contains("error_count"));
    }

    #[tokio::test]
    async fn test_memory_usage_and_fragmentation_probe() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let counters = FailureCounters::default();

        let mut collector = collector();
        let snapshot = collector.snapshot(&link, &counters).unwrap();
        assert_eq!(snapshot.get("memory_usage_percent"), Some(&MetricValue::Float(25.0)));
        assert_eq!(snapshot.get("memory_fragmentation"), Some(&MetricValue::Float(-1.0)));

        let mut collector = collector.with_fragmentation_probe(true);
        let snapshot = collector.snapshot(&link, &counters).unwrap();
        assert_eq!(snapshot.get("memory_fragmentation"), Some(&MetricValue::Float(0.0)));

        collector.heap_mut().probe_failure = Some(AllocFailure::OutOfMemory);
        let snapshot = collector.snapshot(&link, &counters).unwrap();
        assert_eq!(snapshot.get("memory_fragmentation"), Some(&MetricValue::Float(50.0)));

        collector.heap_mut().probe_failure = Some(AllocFailure::Other);
        let snapshot = collector.snapshot(&link, &counters).unwrap();
        assert_eq!(snapshot.get("memory_fragmentation"), Some(&MetricValue::Float(-1.0)));
    }

    #[tokio::test]
    async fn test_gc_counter_increments_per_snapshot() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let counters = FailureCounters::default();
        let mut collector = collector().with_categories(CategorySet::minimal());

        for expected in 1..=3_i64 {
            let snapshot = collector.snapshot(&link, &counters).unwrap();
            assert_eq!(snapshot.get("gc_collections_total"), Some(&MetricValue::Int(expected)));
        }
        assert_eq!(collector.heap_mut().collections(), 3);
    }

    #[tokio::test]
    async fn test_minimal_categories_omit_extended_fields() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let snapshot = collector()
            .with_categories(CategorySet::minimal())
            .snapshot(&link, &FailureCounters::default())
            .unwrap();

        assert!(snapshot.contains("memory_usage_percent"));
        assert!(snapshot.contains("sys_unique_id"));
        assert!(!snapshot.contains("vsys_voltage"));
        assert!(!snapshot.contains("health_status"));
        assert!(!snapshot.contains("mqtt_publish_total"));
    }

    #[tokio::test]
    async fn test_publish_stats_from_counters() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let counters = FailureCounters {
            publish_success_total: 3,
            publish_failed_total: 1,
            ..FailureCounters::default()
        };
        let snapshot = collector().snapshot(&link, &counters).unwrap();

        assert_eq!(snapshot.get("mqtt_publish_total"), Some(&MetricValue::Int(4)));
        assert_eq!(snapshot.get("mqtt_publish_success_rate"), Some(&MetricValue::Float(75.0)));
    }

    #[tokio::test]
    async fn test_power_and_performance_readings() {
        let link = LinkManager::new(SimRadio::new(), "lab", "secret");
        let mut collector = collector();
        let snapshot = collector.snapshot(&link, &FailureCounters::default()).unwrap();

        assert_eq!(snapshot.get("power_source").and_then(|v| v.as_str()), Some("usb"));
        assert_eq!(snapshot.get("cpu_mode").and_then(|v| v.as_str()), Some("normal"));
        assert_eq!(snapshot.get("cpu_frequency_mhz"), Some(&MetricValue::Float(125.0)));
        let max = snapshot.get("cpu_temp_max_celsius").and_then(|v| v.as_f64()).unwrap();
        assert_eq!(max, collector.max_temp_seen());
        assert!(max > 20.0 && max < 30.0);
    }
}
