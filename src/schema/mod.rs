//! Payload schema codecs
//!
//! Every bridge names a schema in its configuration. At load time the name
//! is resolved against a [`SchemaRegistry`] into a concrete codec object,
//! so the per-message hot path never does a string-driven type lookup.

mod value;

pub use value::Value;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Errors from payload decoding/encoding or schema resolution.
#[derive(Debug)]
pub enum SchemaError {
    /// Payload could not be decoded into a value tree
    Decode(String),
    /// Value tree could not be encoded as a payload
    Encode(String),
    /// Schema id is not registered
    UnknownSchema(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Decode(msg) => write!(f, "decode error: {}", msg),
            SchemaError::Encode(msg) => write!(f, "encode error: {}", msg),
            SchemaError::UnknownSchema(id) => write!(f, "unknown schema: {}", id),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Decodes raw bus payloads into [`Value`] trees and back.
///
/// Implementations must be pure per call; one codec instance is shared by
/// every bridge configured with its schema id.
pub trait PayloadCodec: Send + Sync {
    /// Schema id this codec was registered under.
    fn name(&self) -> &str;

    /// Decode a raw bus payload into a value tree.
    fn decode(&self, raw: &[u8]) -> Result<Value, SchemaError>;

    /// Encode a value tree back into a raw bus payload.
    fn encode(&self, value: &Value) -> Result<Bytes, SchemaError>;
}

/// JSON payload codec, the default for buses that carry JSON-serialized
/// messages (and the loopback bus).
pub struct JsonCodec {
    name: String,
}

impl JsonCodec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, SchemaError> {
        let json: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| SchemaError::Decode(e.to_string()))?;
        Ok(Value::from_json(json))
    }

    fn encode(&self, value: &Value) -> Result<Bytes, SchemaError> {
        let json = value.to_json();
        let raw = serde_json::to_vec(&json).map_err(|e| SchemaError::Encode(e.to_string()))?;
        Ok(Bytes::from(raw))
    }
}

/// Raw-bytes codec: the whole payload is a single binary blob under `data`.
/// Used for compressed images and archives that arrive pre-serialized.
pub struct RawBytesCodec {
    name: String,
}

impl RawBytesCodec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PayloadCodec for RawBytesCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, SchemaError> {
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "data".to_string(),
            Value::Bytes(Bytes::copy_from_slice(raw)),
        );
        Ok(Value::Map(map))
    }

    fn encode(&self, value: &Value) -> Result<Bytes, SchemaError> {
        match value.get("data") {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            Some(Value::String(s)) => Ok(Bytes::from(s.clone().into_bytes())),
            _ => Err(SchemaError::Encode(
                "raw codec requires a bytes `data` field".to_string(),
            )),
        }
    }
}

/// Registry mapping schema ids to codecs.
///
/// Built once at startup; bridges hold `Arc<dyn PayloadCodec>` clones after
/// resolution, never the registry itself.
pub struct SchemaRegistry {
    codecs: HashMap<String, Arc<dyn PayloadCodec>>,
}

impl SchemaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in codecs: `json` and `raw`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec::new("json")));
        registry.register(Arc::new(RawBytesCodec::new("raw")));
        registry
    }

    /// Register a codec under its own name. Replaces any previous codec
    /// registered under the same id.
    pub fn register(&mut self, codec: Arc<dyn PayloadCodec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Resolve a schema id to its codec.
    pub fn resolve(&self, schema: &str) -> Result<Arc<dyn PayloadCodec>, SchemaError> {
        self.codecs
            .get(schema)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownSchema(schema.to_string()))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonCodec::new("json");
        let value = codec
            .decode(br#"{"latitude":22.5,"longitude":114.0}"#)
            .unwrap();
        assert_eq!(value.get("latitude"), Some(&Value::Float(22.5)));

        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn raw_codec_wraps_bytes() {
        let codec = RawBytesCodec::new("raw");
        let value = codec.decode(&[1, 2, 3]).unwrap();
        assert_eq!(
            value.get("data"),
            Some(&Value::Bytes(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(codec.encode(&value).unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn registry_resolves_defaults() {
        let registry = SchemaRegistry::with_defaults();
        assert!(registry.resolve("json").is_ok());
        assert!(registry.resolve("raw").is_ok());
        match registry.resolve("sensor_msgs/Imu") {
            Err(SchemaError::UnknownSchema(id)) => assert_eq!(id, "sensor_msgs/Imu"),
            other => panic!("expected UnknownSchema, got {:?}", other.map(|c| c.name().to_string())),
        }
    }
}
