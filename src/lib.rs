//! robridge - ROS 2 <-> MQTT topic bridging engine
//!
//! Bridges messages between a robotics publish/subscribe bus and an MQTT
//! broker in both directions, under per-channel rules: field extraction,
//! rate limiting, QoS and topic naming. Oversized binary payloads travel
//! through a chunked transfer protocol instead of a single message.

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod extract;
pub mod gate;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transfer;

pub use bridge::{Bridge, BridgeError, BridgeManager, CompletedTransfer};
pub use bus::{BusEndpoint, LocalBus};
pub use config::{BridgeSpec, Config};
pub use gate::RateGate;
pub use protocol::{ConnectionState, QoS};
pub use schema::{PayloadCodec, SchemaRegistry, Value};
pub use session::{BrokerSession, SessionError};
pub use transfer::{ChunkReceiver, ChunkSender};
