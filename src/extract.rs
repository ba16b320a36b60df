//! Field extraction
//!
//! Pulls configured fields out of a decoded message tree. A field path is
//! either a single (possibly dotted) path, or a comma-separated list of
//! paths that yields a mapping keyed by each path's leaf name.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::schema::Value;

/// Extraction failure: some path segment did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNotFound {
    /// The segment that failed to resolve
    pub segment: String,
    /// The full configured path it belongs to
    pub path: String,
}

impl fmt::Display for FieldNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field not found: segment `{}` of path `{}`",
            self.segment, self.path
        )
    }
}

impl std::error::Error for FieldNotFound {}

/// Resolve a single dotted path against a message tree.
fn resolve_path<'a>(message: &'a Value, path: &str) -> Result<&'a Value, FieldNotFound> {
    let mut current = message;
    for segment in path.split('.') {
        current = current.get(segment).ok_or_else(|| FieldNotFound {
            segment: segment.to_string(),
            path: path.to_string(),
        })?;
    }
    Ok(current)
}

/// The key a path contributes to a multi-field mapping: its leaf name.
fn leaf_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Extract the configured field(s) from a decoded message.
///
/// A path without commas yields the resolved value itself. A comma list
/// yields a mapping from each path's leaf name to its value; when two paths
/// share a leaf name the last one wins.
pub fn extract(message: &Value, field_path: &str) -> Result<Value, FieldNotFound> {
    if !field_path.contains(',') {
        return resolve_path(message, field_path.trim()).cloned();
    }

    let mut fields = BTreeMap::new();
    for path in field_path.split(',') {
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        let value = resolve_path(message, path)?.clone();
        let key = leaf_name(path);
        if fields.insert(key.to_string(), value).is_some() {
            debug!(key, field_path, "duplicate leaf name in field path, last wins");
        }
    }
    Ok(Value::Map(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(json: serde_json::Value) -> Value {
        Value::from_json(json)
    }

    #[test]
    fn single_flat_field() {
        let msg = message(serde_json::json!({"data": "hello"}));
        assert_eq!(extract(&msg, "data").unwrap(), Value::String("hello".into()));
    }

    #[test]
    fn single_nested_field() {
        let msg = message(serde_json::json!({
            "pose": {"position": {"x": 1.5, "y": 2.0}}
        }));
        assert_eq!(
            extract(&msg, "pose.position.x").unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn multi_field_mapping() {
        let msg = message(serde_json::json!({
            "latitude": 22.5,
            "longitude": 114.0,
            "x": 1
        }));
        let extracted = extract(&msg, "latitude,longitude").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("latitude".to_string(), Value::Float(22.5));
        expected.insert("longitude".to_string(), Value::Float(114.0));
        assert_eq!(extracted, Value::Map(expected));
    }

    #[test]
    fn multi_field_nested_uses_leaf_names() {
        let msg = message(serde_json::json!({
            "linear": {"x": 0.5},
            "angular": {"z": -0.1}
        }));
        let extracted = extract(&msg, "linear.x,angular.z").unwrap();
        assert_eq!(extracted.get("x"), Some(&Value::Float(0.5)));
        assert_eq!(extracted.get("z"), Some(&Value::Float(-0.1)));
    }

    #[test]
    fn missing_segment_is_reported() {
        let msg = message(serde_json::json!({"pose": {"position": {"x": 1.0}}}));
        let err = extract(&msg, "pose.orientation.w").unwrap_err();
        assert_eq!(err.segment, "orientation");
        assert_eq!(err.path, "pose.orientation.w");
    }

    #[test]
    fn missing_field_in_multi_path_fails_whole_extraction() {
        let msg = message(serde_json::json!({"latitude": 22.5}));
        let err = extract(&msg, "latitude,longitude").unwrap_err();
        assert_eq!(err.segment, "longitude");
    }

    #[test]
    fn descending_into_scalar_fails() {
        let msg = message(serde_json::json!({"data": 42}));
        let err = extract(&msg, "data.nested").unwrap_err();
        assert_eq!(err.segment, "nested");
    }

    #[test]
    fn whitespace_around_paths_is_tolerated() {
        let msg = message(serde_json::json!({"latitude": 22.5, "longitude": 114.0}));
        let extracted = extract(&msg, "latitude, longitude").unwrap();
        assert_eq!(extracted.get("longitude"), Some(&Value::Float(114.0)));
    }
}
