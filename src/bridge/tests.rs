//! Bridge module tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use super::runtime::{Bridge, Outbound};
use super::{BridgeError, BridgeManager};
use crate::bus::LocalBus;
use crate::config::{BridgeSpec, BrokerConfig, Config, ConfigError, TransferConfig};
use crate::protocol::QoS;
use crate::schema::{SchemaRegistry, Value};

fn make_bridge(spec: BridgeSpec) -> Bridge {
    let registry = SchemaRegistry::with_defaults();
    let codec = registry.resolve(&spec.schema).unwrap();
    Bridge::new(spec, codec, &BrokerConfig::default(), &TransferConfig::default())
}

// =============================================================================
// Outbound pipeline
// =============================================================================

#[test]
fn outbound_builds_envelope() {
    let bridge = make_bridge(BridgeSpec {
        field_path: "latitude,longitude".to_string(),
        ..Default::default()
    });

    let raw = br#"{"latitude":22.5,"longitude":114.0,"status":1}"#;
    let out = bridge
        .process_outbound(raw, Instant::now(), 1_700_000_000_000)
        .unwrap();
    let Outbound::Envelope(payload) = out else {
        panic!("expected envelope");
    };

    let envelope = crate::envelope::decode(&payload).unwrap();
    assert_eq!(envelope.fields.get("latitude"), Some(&Value::Float(22.5)));
    assert_eq!(envelope.fields.get("longitude"), Some(&Value::Float(114.0)));
    assert!(!envelope.fields.contains_key("status"));
    assert_eq!(envelope.sequence, 0);
    assert_eq!(envelope.timestamp_ms, 1_700_000_000_000);
}

#[test]
fn outbound_sequence_increments_per_forward() {
    let bridge = make_bridge(BridgeSpec::default());
    let raw = br#"{"data":1}"#;
    for expected in 0..3u64 {
        let out = bridge.process_outbound(raw, Instant::now(), 0).unwrap();
        let Outbound::Envelope(payload) = out else {
            panic!("expected envelope");
        };
        assert_eq!(crate::envelope::decode(&payload).unwrap().sequence, expected);
    }
}

#[test]
fn outbound_respects_rate_gate() {
    let bridge = make_bridge(BridgeSpec {
        min_interval: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let base = Instant::now();
    let raw = br#"{"data":1}"#;

    assert!(matches!(
        bridge.process_outbound(raw, base, 0).unwrap(),
        Outbound::Envelope(_)
    ));
    assert!(matches!(
        bridge
            .process_outbound(raw, base + Duration::from_secs(1), 0)
            .unwrap(),
        Outbound::Gated
    ));
    assert!(matches!(
        bridge
            .process_outbound(raw, base + Duration::from_secs(5), 0)
            .unwrap(),
        Outbound::Envelope(_)
    ));
}

#[test]
fn outbound_lifts_header_stamp_when_configured() {
    let bridge = make_bridge(BridgeSpec {
        extract_header_stamp: true,
        ..Default::default()
    });
    let raw = br#"{"data":5,"header":{"stamp":{"sec":12,"nanosec":500000000}}}"#;
    let out = bridge.process_outbound(raw, Instant::now(), 0).unwrap();
    let Outbound::Envelope(payload) = out else {
        panic!("expected envelope");
    };

    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(json["value"], 5);
    assert_eq!(json["header_timestamp"]["secs"], 12);
    assert_eq!(json["header_timestamp"]["nsecs"], 500_000_000);
}

#[test]
fn outbound_missing_field_is_error() {
    let bridge = make_bridge(BridgeSpec {
        field_path: "pose.position.x".to_string(),
        ..Default::default()
    });
    let err = bridge
        .process_outbound(br#"{"pose":{}}"#, Instant::now(), 0)
        .unwrap_err();
    assert!(matches!(err, BridgeError::FieldNotFound(_)));
}

#[test]
fn outbound_undecodable_payload_is_error() {
    let bridge = make_bridge(BridgeSpec::default());
    let err = bridge
        .process_outbound(b"\x00\x01 not json", Instant::now(), 0)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Schema(_)));
}

#[test]
fn oversized_binary_payload_routes_to_transfer() {
    let spec = BridgeSpec {
        schema: "raw".to_string(),
        field_path: "data".to_string(),
        ..Default::default()
    };
    let registry = SchemaRegistry::with_defaults();
    let codec = registry.resolve("raw").unwrap();
    let transfer = TransferConfig {
        threshold: 100,
        ..Default::default()
    };
    let bridge = Bridge::new(spec, codec, &BrokerConfig::default(), &transfer);

    let big = vec![0xABu8; 200];
    let out = bridge.process_outbound(&big, Instant::now(), 0).unwrap();
    let Outbound::Transfer(bytes) = out else {
        panic!("expected transfer routing");
    };
    assert_eq!(&bytes[..], &big[..]);

    // Under the ceiling the same bridge produces a plain envelope.
    let small = vec![0xABu8; 50];
    assert!(matches!(
        bridge.process_outbound(&small, Instant::now(), 0).unwrap(),
        Outbound::Envelope(_)
    ));
}

// =============================================================================
// Inbound pipeline
// =============================================================================

#[test]
fn inbound_envelope_republishes_value() {
    let bridge = make_bridge(BridgeSpec::default());
    let wire = br#"{"value":true,"timestamp":1,"source_node":"teleop","sequence":4}"#;
    let raw = bridge.process_inbound(wire).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value, serde_json::json!(true));
}

#[test]
fn inbound_multi_field_envelope_republishes_mapping() {
    let bridge = make_bridge(BridgeSpec::default());
    let wire = br#"{"linear":0.2,"angular":-0.4,"timestamp":1,"source_node":"joy","sequence":9}"#;
    let raw = bridge.process_inbound(wire).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(value, serde_json::json!({"linear": 0.2, "angular": -0.4}));
}

#[test]
fn inbound_garbage_is_error() {
    let bridge = make_bridge(BridgeSpec::default());
    assert!(matches!(
        bridge.process_inbound(b"\xffgarbage").unwrap_err(),
        BridgeError::Envelope(_)
    ));
}

// =============================================================================
// Statistics
// =============================================================================

#[test]
fn statistics_track_forwards_and_errors() {
    let bridge = make_bridge(BridgeSpec::default());
    bridge.record_forward(100);
    bridge.record_forward(50);
    bridge.record_error(&BridgeError::Session(
        crate::session::SessionError::NotConnected,
    ));

    let snapshot = bridge.snapshot();
    assert_eq!(snapshot.messages, 2);
    assert_eq!(snapshot.bytes, 150);
    assert_eq!(snapshot.errors, 1);
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("not connected to broker")
    );
}

#[test]
fn bridge_resolves_broker_topic_and_qos() {
    let bridge = make_bridge(BridgeSpec {
        qos: Some(0),
        ..Default::default()
    });
    assert_eq!(bridge.broker_topic(), "ros2/default/data");
    assert_eq!(bridge.qos(), QoS::AtMostOnce);
    assert!(!bridge.retain());
}

// =============================================================================
// Manager construction
// =============================================================================

#[tokio::test]
async fn manager_rejects_unknown_schema() {
    let config = Config {
        bridge: vec![BridgeSpec {
            schema: "sensor_msgs/Imu".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let result = BridgeManager::new(
        config,
        Arc::new(LocalBus::new()),
        &SchemaRegistry::with_defaults(),
    );
    match result {
        Err(ConfigError::Validation(msg)) => assert!(msg.contains("unknown schema")),
        _ => panic!("expected validation error"),
    }
}

#[tokio::test]
async fn manager_skips_disabled_bridges() {
    let config = Config {
        bridge: vec![
            BridgeSpec {
                name: "on".to_string(),
                ..Default::default()
            },
            BridgeSpec {
                name: "off".to_string(),
                enabled: false,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let manager = BridgeManager::new(
        config,
        Arc::new(LocalBus::new()),
        &SchemaRegistry::with_defaults(),
    )
    .unwrap();
    assert_eq!(manager.bridge_count(), 1);
}

#[tokio::test]
async fn manager_rejects_duplicate_names() {
    let config = Config {
        bridge: vec![
            BridgeSpec::default(),
            BridgeSpec {
                bus_topic: "/other".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let result = BridgeManager::new(
        config,
        Arc::new(LocalBus::new()),
        &SchemaRegistry::with_defaults(),
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn stats_snapshot_serializes_for_the_wire() {
    let bridge = make_bridge(BridgeSpec::default());
    bridge.record_forward(10);
    let json = serde_json::to_value(bridge.snapshot()).unwrap();
    assert_eq!(json["bridge_name"], "default");
    assert_eq!(json["direction"], "bus->broker");
    assert_eq!(json["messages"], 1);
    assert_eq!(json["bytes"], 10);
}
