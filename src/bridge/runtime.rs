//! Bridge runtime state
//!
//! Couples an immutable [`BridgeSpec`] with the per-channel mutable state:
//! rate gate, sequence counter and live statistics. The statistics counters
//! are atomics because the statistics timer reads them on its own schedule
//! while the bridge's delivery context writes them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use super::BridgeError;
use crate::config::{BridgeSpec, BrokerConfig, TransferConfig};
use crate::envelope::{self, EnvelopeMeta};
use crate::extract;
use crate::gate::RateGate;
use crate::protocol::QoS;
use crate::schema::{PayloadCodec, Value};

/// Outcome of the bus->broker pipeline for one message.
#[derive(Debug)]
pub enum Outbound {
    /// Publish this envelope on the bridge's broker topic
    Envelope(Bytes),
    /// Payload exceeds the single-message ceiling; send as a chunked
    /// transfer instead
    Transfer(Bytes),
    /// Dropped by the rate gate
    Gated,
}

/// Live per-bridge counters.
#[derive(Debug, Default)]
struct BridgeStats {
    messages: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time statistics for one bridge, as published on the
/// statistics topic.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatsSnapshot {
    pub bridge_name: String,
    pub direction: String,
    pub bus_topic: String,
    pub broker_topic: String,
    pub messages: u64,
    pub bytes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub uptime_seconds: f64,
    pub message_rate: f64,
    pub byte_rate: f64,
}

/// One configured, directional channel between a bus topic and a broker
/// topic.
pub struct Bridge {
    spec: BridgeSpec,
    codec: Arc<dyn PayloadCodec>,
    gate: RateGate,
    sequence: AtomicU64,
    stats: BridgeStats,
    started_at: Instant,
    broker_topic: String,
    envelope_meta: EnvelopeMeta,
    transfer_threshold: usize,
    qos: QoS,
    retain: bool,
}

impl Bridge {
    pub fn new(
        spec: BridgeSpec,
        codec: Arc<dyn PayloadCodec>,
        broker: &BrokerConfig,
        transfer: &TransferConfig,
    ) -> Self {
        let broker_topic = spec.topic.resolve(&broker.topic_prefix);
        let qos = QoS::from_u8(spec.qos.unwrap_or(broker.default_qos)).unwrap_or_default();
        let retain = spec.retain.unwrap_or(broker.default_retain);
        let envelope_meta = EnvelopeMeta {
            source_node: spec.metadata.source_node.clone(),
            frame_id: spec.metadata.frame_id.clone(),
            image_format: spec.metadata.image_format.clone(),
        };

        Self {
            gate: RateGate::new(spec.min_interval),
            codec,
            sequence: AtomicU64::new(0),
            stats: BridgeStats::default(),
            started_at: Instant::now(),
            broker_topic,
            envelope_meta,
            transfer_threshold: transfer.threshold,
            qos,
            retain,
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BridgeSpec {
        &self.spec
    }

    pub fn broker_topic(&self) -> &str {
        &self.broker_topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Run the bus->broker pipeline for one inbound bus message:
    /// decode -> extract -> gate -> envelope.
    pub fn process_outbound(
        &self,
        raw: &[u8],
        now: Instant,
        timestamp_ms: u64,
    ) -> Result<Outbound, BridgeError> {
        let message = self.codec.decode(raw)?;
        let extracted = extract::extract(&message, &self.spec.field_path)?;

        if !self.gate.should_forward(now) {
            return Ok(Outbound::Gated);
        }

        // Oversized binary payloads bypass the envelope entirely and go
        // through the chunk transfer protocol.
        if let Value::Bytes(bytes) = &extracted {
            if bytes.len() > self.transfer_threshold {
                return Ok(Outbound::Transfer(bytes.clone()));
            }
        }

        let header = if self.spec.extract_header_stamp {
            envelope::header_stamp(&message)
        } else {
            None
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let payload = envelope::encode(
            &extracted,
            &self.envelope_meta,
            sequence,
            timestamp_ms,
            header,
        )?;
        Ok(Outbound::Envelope(payload))
    }

    /// Run the broker->bus pipeline for one inbound broker message:
    /// decode envelope -> re-encode via the payload codec.
    pub fn process_inbound(&self, raw: &[u8]) -> Result<Bytes, BridgeError> {
        let envelope = envelope::decode(raw)?;
        let value = envelope.data_value()?;
        Ok(self.codec.encode(&value)?)
    }

    /// Record one successfully forwarded message of `len` bytes.
    pub fn record_forward(&self, len: usize) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a dropped message.
    pub fn record_error(&self, error: &BridgeError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_error.lock() = Some(error.to_string());
    }

    pub fn error_count(&self) -> u64 {
        self.stats.errors.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.stats.messages.load(Ordering::Relaxed)
    }

    /// Snapshot the live statistics for the statistics publisher.
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let messages = self.stats.messages.load(Ordering::Relaxed);
        let bytes = self.stats.bytes.load(Ordering::Relaxed);
        let rate = |count: u64| if uptime > 0.0 { count as f64 / uptime } else { 0.0 };
        BridgeStatsSnapshot {
            bridge_name: self.spec.name.clone(),
            direction: self.spec.direction.to_string(),
            bus_topic: self.spec.bus_topic.clone(),
            broker_topic: self.broker_topic.clone(),
            messages,
            bytes,
            errors: self.stats.errors.load(Ordering::Relaxed),
            last_error: self.stats.last_error.lock().clone(),
            uptime_seconds: uptime,
            message_rate: rate(messages),
            byte_rate: rate(bytes),
        }
    }
}
