//! Envelope wire codec
//!
//! Wraps extracted data plus bridge metadata into the canonical JSON wire
//! object published to the broker, and decodes inbound wire payloads back
//! into a field/value mapping.
//!
//! Wire format:
//! `{"<fields or value>": ..., "timestamp": millis, "source_node": "...",
//!   "frame_id": "...", "sequence": n}`
//! Binary leaves are carried as base64 text.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::schema::Value;

/// Keys owned by the envelope itself. Extracted fields never shadow these;
/// metadata is written after the fields and wins on collision.
const RESERVED_KEYS: [&str; 5] = [
    "timestamp",
    "source_node",
    "frame_id",
    "sequence",
    "header_timestamp",
];

/// Envelope codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Payload is not a JSON document
    Malformed(String),
    /// Envelope carries no data fields
    MissingField(&'static str),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
            EnvelopeError::MissingField(name) => write!(f, "envelope missing field: {}", name),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Timestamp lifted from a bus message header, carried alongside the
/// bridge's own wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeaderStamp {
    pub secs: i64,
    pub nsecs: u32,
    /// secs + nsecs as fractional seconds
    pub timestamp: f64,
}

impl HeaderStamp {
    pub fn new(secs: i64, nsecs: u32) -> Self {
        Self {
            secs,
            nsecs,
            timestamp: secs as f64 + nsecs as f64 * 1e-9,
        }
    }
}

/// Lift `header.stamp.{sec,nanosec}` out of a decoded message, if present.
pub fn header_stamp(message: &Value) -> Option<HeaderStamp> {
    let stamp = message.get("header")?.get("stamp")?;
    let secs = stamp.get("sec")?.as_i64()?;
    let nsecs = stamp.get("nanosec").and_then(Value::as_i64).unwrap_or(0);
    Some(HeaderStamp::new(secs, nsecs as u32))
}

/// Static per-bridge metadata stamped onto every envelope.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeMeta {
    pub source_node: String,
    pub frame_id: Option<String>,
    /// When set, a single binary value is encoded with a
    /// `data:image/{format};base64,` prefix instead of bare base64.
    pub image_format: Option<String>,
}

/// Encode extracted data into the JSON wire object.
///
/// A mapping flattens into the top level; any other value lands under
/// `"value"`.
pub fn encode(
    extracted: &Value,
    meta: &EnvelopeMeta,
    sequence: u64,
    timestamp_ms: u64,
    header: Option<HeaderStamp>,
) -> Result<Bytes, EnvelopeError> {
    let mut object = serde_json::Map::new();

    match extracted {
        Value::Map(fields) => {
            for (key, value) in fields {
                object.insert(key.clone(), encode_leaf(value, meta));
            }
        }
        other => {
            object.insert("value".to_string(), encode_leaf(other, meta));
        }
    }

    object.insert("timestamp".to_string(), serde_json::json!(timestamp_ms));
    object.insert(
        "source_node".to_string(),
        serde_json::json!(meta.source_node),
    );
    if let Some(ref frame_id) = meta.frame_id {
        object.insert("frame_id".to_string(), serde_json::json!(frame_id));
    }
    object.insert("sequence".to_string(), serde_json::json!(sequence));
    if let Some(stamp) = header {
        object.insert(
            "header_timestamp".to_string(),
            serde_json::to_value(stamp)
                .map_err(|e| EnvelopeError::Malformed(e.to_string()))?,
        );
    }

    let raw = serde_json::to_vec(&serde_json::Value::Object(object))
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    Ok(Bytes::from(raw))
}

fn encode_leaf(value: &Value, meta: &EnvelopeMeta) -> serde_json::Value {
    match (value, meta.image_format.as_deref()) {
        (Value::Bytes(bytes), Some(format)) => {
            serde_json::json!(format!("data:image/{};base64,{}", format, BASE64.encode(bytes)))
        }
        _ => value.to_json(),
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Data fields (everything that is not envelope metadata)
    pub fields: BTreeMap<String, Value>,
    pub source_node: String,
    pub frame_id: Option<String>,
    pub sequence: u64,
    pub timestamp_ms: u64,
}

impl Envelope {
    /// The data payload to republish: the single `"value"` when that is the
    /// only field, otherwise the whole field mapping.
    pub fn data_value(&self) -> Result<Value, EnvelopeError> {
        if self.fields.is_empty() {
            return Err(EnvelopeError::MissingField("value"));
        }
        if self.fields.len() == 1 {
            if let Some(value) = self.fields.get("value") {
                return Ok(value.clone());
            }
        }
        Ok(Value::Map(self.fields.clone()))
    }
}

/// Decode an inbound wire payload.
///
/// Non-object JSON (a bare scalar published by some other client) is
/// tolerated and mapped to a single `"value"` field with empty metadata.
pub fn decode(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
    let json: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let object = match json {
        serde_json::Value::Object(object) => object,
        scalar => {
            let mut fields = BTreeMap::new();
            fields.insert("value".to_string(), Value::from_json(scalar));
            return Ok(Envelope {
                fields,
                source_node: String::new(),
                frame_id: None,
                sequence: 0,
                timestamp_ms: 0,
            });
        }
    };

    let source_node = object
        .get("source_node")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let frame_id = object
        .get("frame_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let sequence = object
        .get("sequence")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let timestamp_ms = object
        .get("timestamp")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let fields = object
        .into_iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key, Value::from_json(value)))
        .collect();

    Ok(Envelope {
        fields,
        source_node,
        frame_id,
        sequence,
        timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta() -> EnvelopeMeta {
        EnvelopeMeta {
            source_node: "gps_node".to_string(),
            frame_id: Some("gps_link".to_string()),
            image_format: None,
        }
    }

    #[test]
    fn single_value_envelope() {
        let raw = encode(&Value::Float(22.5), &meta(), 7, 1_700_000_000_000, None).unwrap();
        let envelope = decode(&raw).unwrap();
        assert_eq!(envelope.fields.get("value"), Some(&Value::Float(22.5)));
        assert_eq!(envelope.source_node, "gps_node");
        assert_eq!(envelope.frame_id.as_deref(), Some("gps_link"));
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn multi_field_envelope_flattens() {
        let mut fields = BTreeMap::new();
        fields.insert("latitude".to_string(), Value::Float(22.5));
        fields.insert("longitude".to_string(), Value::Float(114.0));
        let raw = encode(&Value::Map(fields.clone()), &meta(), 1, 0, None).unwrap();

        let envelope = decode(&raw).unwrap();
        assert_eq!(envelope.fields, fields);
        assert_eq!(envelope.data_value().unwrap(), Value::Map(fields));
    }

    #[test]
    fn extract_encode_decode_round_trip() {
        let message = Value::from_json(serde_json::json!({
            "latitude": 22.5,
            "longitude": 114.0,
            "x": 1
        }));
        let extracted = crate::extract::extract(&message, "latitude,longitude").unwrap();
        let raw = encode(&extracted, &meta(), 0, 0, None).unwrap();
        assert_eq!(decode(&raw).unwrap().data_value().unwrap(), extracted);
    }

    #[test]
    fn reserved_keys_win_over_extracted_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("timestamp".to_string(), Value::String("bogus".into()));
        fields.insert("speed".to_string(), Value::Float(1.0));
        let raw = encode(&Value::Map(fields), &meta(), 3, 42, None).unwrap();

        let envelope = decode(&raw).unwrap();
        assert_eq!(envelope.timestamp_ms, 42);
        assert_eq!(envelope.fields.get("speed"), Some(&Value::Float(1.0)));
        assert!(!envelope.fields.contains_key("timestamp"));
    }

    #[test]
    fn image_bytes_get_data_url_prefix() {
        let image_meta = EnvelopeMeta {
            image_format: Some("jpeg".to_string()),
            ..meta()
        };
        let raw = encode(
            &Value::Bytes(Bytes::from_static(&[0xff, 0xd8])),
            &image_meta,
            0,
            0,
            None,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let value = json["value"].as_str().unwrap();
        assert!(value.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn header_stamp_is_lifted_and_carried() {
        let message = Value::from_json(serde_json::json!({
            "header": {"stamp": {"sec": 12, "nanosec": 500_000_000}},
            "data": 1
        }));
        let stamp = header_stamp(&message).unwrap();
        assert_eq!(stamp.secs, 12);
        assert_eq!(stamp.nsecs, 500_000_000);
        assert!((stamp.timestamp - 12.5).abs() < 1e-9);

        let raw = encode(&Value::Int(1), &meta(), 0, 0, Some(stamp)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["header_timestamp"]["secs"], 12);
    }

    #[test]
    fn bare_scalar_payload_is_tolerated() {
        let envelope = decode(b"true").unwrap();
        assert_eq!(envelope.data_value().unwrap(), Value::Bool(true));
        assert_eq!(envelope.sequence, 0);
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(
            decode(b"\xff\xfe not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
