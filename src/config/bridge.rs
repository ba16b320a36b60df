//! Bridge channel configuration
//!
//! One `[[bridge]]` table per configured channel. Specs are immutable after
//! load; the manager owns them for the life of the process.

use std::time::Duration;

use serde::Deserialize;

/// Direction of a bridge channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeDirection {
    /// Bus subscription forwarded to the broker
    #[default]
    BusToBroker,
    /// Broker subscription republished on the bus
    BrokerToBus,
}

impl std::fmt::Display for BridgeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeDirection::BusToBroker => write!(f, "bus->broker"),
            BridgeDirection::BrokerToBus => write!(f, "broker->bus"),
        }
    }
}

/// Broker-side topic naming: `{prefix}/{name}/{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicSpec {
    /// Override of the global `[broker] topic_prefix` for this bridge
    #[serde(default)]
    pub prefix: Option<String>,

    /// Middle topic segment, typically the logical channel name
    pub name: String,

    /// Trailing topic segment
    #[serde(default = "default_topic_suffix")]
    pub suffix: String,
}

fn default_topic_suffix() -> String {
    "data".to_string()
}

impl TopicSpec {
    /// Full broker topic, using the global prefix unless overridden.
    pub fn resolve(&self, global_prefix: &str) -> String {
        let prefix = self.prefix.as_deref().unwrap_or(global_prefix);
        format!("{}/{}/{}", prefix, self.name, self.suffix)
    }
}

/// Free-form channel tags stamped onto every envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BridgeMetadata {
    /// Logical source node reported in the envelope
    #[serde(default = "default_source_node")]
    pub source_node: String,

    /// Coordinate frame tag, when the channel has one
    #[serde(default)]
    pub frame_id: Option<String>,

    /// Image format hint (`jpeg`/`png`) for binary payloads that should be
    /// published as data URLs
    #[serde(default)]
    pub image_format: Option<String>,
}

fn default_source_node() -> String {
    "unknown_node".to_string()
}

/// Configuration for a single bridge channel.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSpec {
    /// Unique name for this bridge
    pub name: String,

    /// Direction of forwarding
    #[serde(default)]
    pub direction: BridgeDirection,

    /// Bus topic to subscribe to (bus->broker) or publish on (broker->bus)
    pub bus_topic: String,

    /// Payload schema id, resolved against the schema registry at load time
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Field path: dotted for nesting, comma-separated for multi-field
    #[serde(default = "default_field_path")]
    pub field_path: String,

    /// Minimum interval between forwarded messages; unset forwards every one
    #[serde(default, with = "humantime_serde")]
    pub min_interval: Option<Duration>,

    /// Broker topic naming
    pub topic: TopicSpec,

    /// QoS for published messages; falls back to the broker default
    #[serde(default)]
    pub qos: Option<u8>,

    /// Retain flag for published messages; falls back to the broker default
    #[serde(default)]
    pub retain: Option<bool>,

    /// Lift `header.stamp` from the bus message into the envelope
    #[serde(default)]
    pub extract_header_stamp: bool,

    /// Whether this bridge starts at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Channel tags
    #[serde(default)]
    pub metadata: BridgeMetadata,
}

fn default_schema() -> String {
    "json".to_string()
}

fn default_field_path() -> String {
    "data".to_string()
}

fn default_true() -> bool {
    true
}

impl BridgeSpec {
    pub fn is_bus_to_broker(&self) -> bool {
        self.direction == BridgeDirection::BusToBroker
    }

    pub fn is_broker_to_bus(&self) -> bool {
        self.direction == BridgeDirection::BrokerToBus
    }
}

impl Default for BridgeSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            direction: BridgeDirection::default(),
            bus_topic: "/default".to_string(),
            schema: default_schema(),
            field_path: default_field_path(),
            min_interval: None,
            topic: TopicSpec {
                prefix: None,
                name: "default".to_string(),
                suffix: default_topic_suffix(),
            },
            qos: None,
            retain: None,
            extract_header_stamp: false,
            enabled: true,
            metadata: BridgeMetadata {
                source_node: default_source_node(),
                frame_id: None,
                image_format: None,
            },
        }
    }
}
