//! Cross-bus bridging
//!
//! A [`Bridge`] is one configured, directional channel binding a bus topic
//! to a broker topic. The [`BridgeManager`] owns the fleet: it routes
//! inbound bus and broker events to the right bridge, aggregates
//! statistics and emits the fleet heartbeat.

mod manager;
mod runtime;

#[cfg(test)]
mod tests;

pub use manager::{BridgeManager, CompletedTransfer};
pub use runtime::{Bridge, BridgeStatsSnapshot, Outbound};

use std::fmt;

use crate::bus::BusError;
use crate::envelope::EnvelopeError;
use crate::extract::FieldNotFound;
use crate::schema::SchemaError;
use crate::session::SessionError;
use crate::transfer::TransferError;

/// Per-message bridge pipeline errors. None of these stop the manager or
/// any other bridge; the message is dropped and the bridge's error counter
/// incremented.
#[derive(Debug)]
pub enum BridgeError {
    /// Configured field path did not resolve in the message
    FieldNotFound(FieldNotFound),
    /// Payload codec failed
    Schema(SchemaError),
    /// Envelope encode/decode failed
    Envelope(EnvelopeError),
    /// Broker publish failed (usually `NotConnected`)
    Session(SessionError),
    /// Bus republish failed
    Bus(BusError),
    /// Chunked transfer send failed
    Transfer(TransferError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::FieldNotFound(e) => write!(f, "{}", e),
            BridgeError::Schema(e) => write!(f, "{}", e),
            BridgeError::Envelope(e) => write!(f, "{}", e),
            BridgeError::Session(e) => write!(f, "{}", e),
            BridgeError::Bus(e) => write!(f, "{}", e),
            BridgeError::Transfer(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<FieldNotFound> for BridgeError {
    fn from(e: FieldNotFound) -> Self {
        BridgeError::FieldNotFound(e)
    }
}

impl From<SchemaError> for BridgeError {
    fn from(e: SchemaError) -> Self {
        BridgeError::Schema(e)
    }
}

impl From<EnvelopeError> for BridgeError {
    fn from(e: EnvelopeError) -> Self {
        BridgeError::Envelope(e)
    }
}

impl From<SessionError> for BridgeError {
    fn from(e: SessionError) -> Self {
        BridgeError::Session(e)
    }
}

impl From<BusError> for BridgeError {
    fn from(e: BusError) -> Self {
        BridgeError::Bus(e)
    }
}

impl From<TransferError> for BridgeError {
    fn from(e: TransferError) -> Self {
        BridgeError::Transfer(e)
    }
}
