use pico_telemetry::{
    error::AgentError,
    metrics::data::{DISCONNECTED_RSSI, SENTINEL},
    platform::sim::{SimBoard, SimHeap, SimRadio},
    transport::sim::SimBroker,
    AgentConfig, CategorySet, ConnectionState, Cycle, FailureCounters, LinkManager,
    MetricsCollector, Supervisor, TransportError,
};
use serde_json::Value;
use std::time::Duration;

fn decode(payload: &[u8]) -> serde_json::Map<String, Value> {
    match serde_json::from_slice::<Value>(payload).expect("Payload should be valid JSON") {
        Value::Object(map) => map,
        other => panic!("Expected a JSON object, got {}", other),
    }
}

/// Test configuration builder and defaults
#[test]
fn test_config_builder() {
    let config = AgentConfig::new("lab", "secret", "10.0.0.2")
        .with_broker_port(8883)
        .with_client_id("pico-7")
        .with_topic("lab/pico-7")
        .with_publish_interval(30)
        .with_categories(CategorySet::minimal())
        .with_fragmentation_probe(true);

    assert_eq!(config.ssid, "lab");
    assert_eq!(config.broker_address(), "10.0.0.2:8883");
    assert_eq!(config.client_id, "pico-7");
    assert_eq!(config.topic, "lab/pico-7");
    assert_eq!(config.publish_interval(), Duration::from_secs(30));
    assert_eq!(config.categories, CategorySet::minimal());
    assert!(config.fragmentation_probe);
}

#[test]
fn test_config_serialization() {
    let config = AgentConfig::new("lab", "secret", "broker.local");
    let json = serde_json::to_string(&config).expect("Should serialize config");
    let restored: AgentConfig = serde_json::from_str(&json).expect("Should deserialize config");

    assert_eq!(restored.broker_host, "broker.local");
    assert_eq!(restored.categories, CategorySet::full());
}

/// Test error types and conversions
#[test]
fn test_error_types() {
    let oom = AgentError::out_of_memory("snapshot buffer");
    assert!(oom.is_out_of_memory());
    assert!(oom.to_string().contains("Out of memory"));

    let init = AgentError::init_error("WiFi initialization failed");
    assert!(!init.is_out_of_memory());
    assert!(init.to_string().contains("WiFi initialization failed"));

    let transport: AgentError = TransportError::Timeout.into();
    assert!(matches!(transport, AgentError::Transport(TransportError::Timeout)));

    let io: AgentError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
    assert!(matches!(io, AgentError::Io(_)));
}

#[test]
fn test_transport_error_classification() {
    assert!(TransportError::Timeout.is_recoverable());
    assert!(TransportError::Refused("bad credentials".to_string()).is_recoverable());
    assert!(!TransportError::NotConnected.is_recoverable());
    assert!(!TransportError::Protocol("malformed".to_string()).is_recoverable());
}

/// Test that an encoded snapshot decodes to the same values
#[test]
fn test_snapshot_json_round_trip() {
    let link = LinkManager::new(SimRadio::associated(), "lab", "secret");
    let mut collector = MetricsCollector::new(SimBoard::new(), SimHeap::new());
    let snapshot = collector
        .snapshot(&link, &FailureCounters::default())
        .expect("Should collect snapshot");

    let decoded = decode(&snapshot.to_json().expect("Should encode"));
    assert_eq!(decoded.len(), snapshot.len());

    for (name, value) in snapshot.iter() {
        let restored = decoded.get(name).unwrap_or_else(|| panic!("{} missing", name));
        match (value.as_f64(), value.as_str()) {
            (Some(expected), _) => {
                let actual = restored.as_f64().expect("Numeric field");
                assert!((actual - expected).abs() < 0.01, "{}: {} != {}", name, actual, expected);
            }
            (None, Some(expected)) => assert_eq!(restored.as_str(), Some(expected)),
            (None, None) => unreachable!(),
        }
    }
}

#[test]
fn test_snapshot_preserves_insertion_order() {
    let link = LinkManager::new(SimRadio::associated(), "lab", "secret");
    let mut collector = MetricsCollector::new(SimBoard::new(), SimHeap::new());
    let snapshot = collector
        .snapshot(&link, &FailureCounters::default())
        .expect("Should collect snapshot");

    let json = String::from_utf8(snapshot.to_json().expect("Should encode")).expect("UTF-8");
    let temperature = json.find("\"temperature_celsius\"").expect("temperature present");
    let uptime = json.find("\"uptime_seconds\"").expect("uptime present");
    assert!(temperature < uptime);
}

/// A disconnected link reports sentinels instead of dropping the snapshot
#[test]
fn test_disconnected_link_sentinels() {
    let link = LinkManager::new(SimRadio::new(), "lab", "secret");
    let mut collector = MetricsCollector::new(SimBoard::new(), SimHeap::new());
    let snapshot = collector
        .snapshot(&link, &FailureCounters::default())
        .expect("Should collect snapshot");

    let decoded = decode(&snapshot.to_json().expect("Should encode"));
    assert_eq!(decoded["wifi_connected"], Value::from(0));
    assert_eq!(decoded["wifi_rssi_dbm"], Value::from(DISCONNECTED_RSSI));
    assert_eq!(decoded["wifi_ip"], Value::from("0.0.0.0"));
    assert_eq!(decoded["wifi_channel"], Value::from(SENTINEL));
    assert!(decoded.contains_key("temperature_celsius"));
}

#[test]
fn test_minimal_categories_omit_optional_groups() {
    let link = LinkManager::new(SimRadio::associated(), "lab", "secret");
    let mut collector =
        MetricsCollector::new(SimBoard::new(), SimHeap::new()).with_categories(CategorySet::minimal());
    let snapshot = collector
        .snapshot(&link, &FailureCounters::default())
        .expect("Should collect snapshot");

    assert!(snapshot.contains("memory_free_bytes"));
    assert!(snapshot.contains("wifi_rssi_dbm"));
    assert!(!snapshot.contains("vsys_voltage"));
    assert!(!snapshot.contains("health_status"));
}

/// End to end: bring-up, a failing broker, forced session reset, recovery
#[tokio::test(start_paused = true)]
async fn test_supervisor_recovers_from_broker_outage() {
    let config = AgentConfig::new("lab", "secret", "localhost").with_topic("lab/pico");
    let broker = SimBroker::new().script_publishes([
        Ok(()),
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
    ]);
    let mut supervisor = Supervisor::new(&config, SimRadio::new(), broker, SimBoard::new(), SimHeap::new());

    supervisor.init().await.expect("Bring-up should succeed");
    assert_eq!(
        supervisor.connection_states(),
        (ConnectionState::Connected, ConnectionState::Connected)
    );

    assert_eq!(supervisor.run_once().await.expect("cycle"), Cycle::Published);
    assert_eq!(supervisor.run_once().await.expect("cycle"), Cycle::PublishFailed);
    assert_eq!(supervisor.run_once().await.expect("cycle"), Cycle::PublishFailed);
    assert_eq!(supervisor.run_once().await.expect("cycle"), Cycle::TransportReset);
    assert_eq!(
        supervisor.connection_states(),
        (ConnectionState::Connected, ConnectionState::Disconnected)
    );

    assert_eq!(supervisor.run_once().await.expect("cycle"), Cycle::Published);
    assert_eq!(supervisor.counters().consecutive_publish_failures, 0);
    assert_eq!(supervisor.counters().publish_failed_total, 3);

    let published = supervisor.transport().client().published();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|(topic, _)| topic == "lab/pico"));
    let last = decode(&published[1].1);
    assert_eq!(last["mqtt_publish_failed_total"], Value::from(3));
}
