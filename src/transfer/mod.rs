//! Chunked large-payload transfer
//!
//! Payloads too large for a single broker message are split into ordered,
//! CRC-checksummed chunks and sent through the ordinary transport. A "meta"
//! message announcing the transfer goes first, then one message per chunk:
//!
//! - `{prefix}/transfer/{transfer_id}/meta`
//! - `{prefix}/transfer/{transfer_id}/chunk`
//!
//! The receiver buffers chunks by index (arrival order does not matter),
//! verifies each chunk's CRC-32 and the whole payload's SHA-256, and emits
//! the reassembled payload exactly once. There is no retransmission: a
//! transfer that loses a chunk stalls until its session idles out, without
//! ever blocking other transfers.


use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::protocol::QoS;
use crate::session::{BrokerSession, SessionError};

/// Transfer protocol errors.
#[derive(Debug)]
pub enum TransferError {
    /// Reassembled payload does not match the declared checksum
    ChecksumMismatch {
        transfer_id: String,
        expected: String,
        actual: String,
    },
    /// A single chunk failed its CRC; only that chunk is discarded
    ChunkIntegrity { transfer_id: String, index: u32 },
    /// Chunk for a transfer with no open session (meta not seen, or the
    /// session already completed/failed/idled out)
    UnknownTransfer(String),
    /// Structurally invalid meta or chunk message
    Malformed(String),
    /// Publishing a meta or chunk message failed
    Publish(SessionError),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::ChecksumMismatch {
                transfer_id,
                expected,
                actual,
            } => write!(
                f,
                "transfer {}: checksum mismatch (expected {}, got {})",
                transfer_id, expected, actual
            ),
            TransferError::ChunkIntegrity { transfer_id, index } => {
                write!(f, "transfer {}: chunk {} failed CRC", transfer_id, index)
            }
            TransferError::UnknownTransfer(id) => {
                write!(f, "no open session for transfer {}", id)
            }
            TransferError::Malformed(msg) => write!(f, "malformed transfer message: {}", msg),
            TransferError::Publish(e) => write!(f, "transfer publish failed: {}", e),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Publish(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for TransferError {
    fn from(e: SessionError) -> Self {
        TransferError::Publish(e)
    }
}

/// Meta message: announces a transfer before its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMeta {
    pub transfer_id: String,
    pub total_chunks: u32,
    pub chunk_size: usize,
    /// Hex SHA-256 of the whole payload
    pub checksum: String,
    pub size_bytes: u64,
}

/// One chunk message. `data` is base64 on the wire; `crc` is CRC-32 of the
/// raw chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub transfer_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub data: String,
    pub crc: u32,
}

impl ChunkMessage {
    /// Decode and CRC-check the chunk body.
    pub fn verified_bytes(&self) -> Result<Bytes, TransferError> {
        let raw = BASE64
            .decode(&self.data)
            .map_err(|e| TransferError::Malformed(format!("chunk base64: {}", e)))?;
        if crc32fast::hash(&raw) != self.crc {
            return Err(TransferError::ChunkIntegrity {
                transfer_id: self.transfer_id.clone(),
                index: self.index,
            });
        }
        Ok(Bytes::from(raw))
    }
}

/// Hex SHA-256 of a payload.
pub fn payload_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Split a payload into its meta message and ordered chunk messages.
pub fn chunk_payload(
    transfer_id: &str,
    payload: &[u8],
    chunk_size: usize,
) -> (TransferMeta, Vec<ChunkMessage>) {
    let total_chunks = payload.len().div_ceil(chunk_size) as u32;
    let meta = TransferMeta {
        transfer_id: transfer_id.to_string(),
        total_chunks,
        chunk_size,
        checksum: payload_checksum(payload),
        size_bytes: payload.len() as u64,
    };

    let chunks = payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, raw)| ChunkMessage {
            transfer_id: transfer_id.to_string(),
            index: index as u32,
            total_chunks,
            data: BASE64.encode(raw),
            crc: crc32fast::hash(raw),
        })
        .collect();

    (meta, chunks)
}

/// Topic helpers

pub fn meta_topic(prefix: &str, transfer_id: &str) -> String {
    format!("{}/transfer/{}/meta", prefix, transfer_id)
}

pub fn chunk_topic(prefix: &str, transfer_id: &str) -> String {
    format!("{}/transfer/{}/chunk", prefix, transfer_id)
}

/// Subscription filter matching every transfer topic under a prefix.
pub fn transfer_filter(prefix: &str) -> String {
    format!("{}/transfer/#", prefix)
}

/// Classification of an inbound transfer topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTopic {
    Meta(String),
    Chunk(String),
}

/// Parse `{prefix}/transfer/{id}/{meta|chunk}`. Returns `None` for topics
/// outside the transfer namespace.
pub fn parse_transfer_topic(prefix: &str, topic: &str) -> Option<TransferTopic> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/transfer/")?;
    let (transfer_id, kind) = rest.rsplit_once('/')?;
    if transfer_id.is_empty() {
        return None;
    }
    match kind {
        "meta" => Some(TransferTopic::Meta(transfer_id.to_string())),
        "chunk" => Some(TransferTopic::Chunk(transfer_id.to_string())),
        _ => None,
    }
}

/// Sender side: splits payloads and publishes them through the shared
/// broker session.
pub struct ChunkSender {
    session: Arc<BrokerSession>,
    config: TransferConfig,
    topic_prefix: String,
    node: String,
    counter: AtomicU64,
}

impl ChunkSender {
    pub fn new(
        session: Arc<BrokerSession>,
        config: TransferConfig,
        topic_prefix: String,
        node: String,
    ) -> Self {
        Self {
            session,
            config,
            topic_prefix,
            node,
            counter: AtomicU64::new(0),
        }
    }

    fn next_transfer_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.node,
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Send a payload as a chunked transfer. Publishes the meta message
    /// first, then every chunk in index order. Returns the transfer id.
    pub async fn send(&self, payload: &[u8]) -> Result<String, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::Malformed("empty payload".to_string()));
        }
        let transfer_id = self.next_transfer_id();
        let (meta, chunks) = chunk_payload(&transfer_id, payload, self.config.chunk_size);
        let qos = QoS::from_u8(self.config.qos).unwrap_or(QoS::AtLeastOnce);

        info!(
            "transfer {}: sending {} bytes in {} chunks",
            transfer_id,
            payload.len(),
            meta.total_chunks
        );

        let meta_raw = serde_json::to_vec(&meta)
            .map_err(|e| TransferError::Malformed(e.to_string()))?;
        self.session
            .publish(
                &meta_topic(&self.topic_prefix, &transfer_id),
                Bytes::from(meta_raw),
                qos,
                false,
            )
            .await?;

        let topic = chunk_topic(&self.topic_prefix, &transfer_id);
        for chunk in &chunks {
            let raw = serde_json::to_vec(chunk)
                .map_err(|e| TransferError::Malformed(e.to_string()))?;
            self.session
                .publish(&topic, Bytes::from(raw), qos, false)
                .await?;
        }

        Ok(transfer_id)
    }
}

/// One in-flight receiving session.
struct TransferSession {
    total_chunks: u32,
    checksum: String,
    size_bytes: u64,
    received: BTreeMap<u32, Bytes>,
    last_activity: Instant,
}

impl TransferSession {
    fn new(meta: &TransferMeta) -> Self {
        Self {
            total_chunks: meta.total_chunks,
            checksum: meta.checksum.clone(),
            size_bytes: meta.size_bytes,
            received: BTreeMap::new(),
            last_activity: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
    }

    /// Concatenate buffered chunks in index order.
    fn assemble(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size_bytes as usize);
        for chunk in self.received.values() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

/// Receiver side: reassembles transfers from inbound meta/chunk messages.
///
/// Sessions are independent map entries; a stalled transfer never blocks
/// progress on any other.
pub struct ChunkReceiver {
    sessions: DashMap<String, TransferSession>,
    idle_timeout: Duration,
}

impl ChunkReceiver {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Number of open sessions (test/introspection helper).
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Dispatch a raw inbound transfer message by its parsed topic.
    pub fn handle_message(
        &self,
        topic: &TransferTopic,
        payload: &[u8],
    ) -> Result<Option<Bytes>, TransferError> {
        match topic {
            TransferTopic::Meta(_) => {
                let meta: TransferMeta = serde_json::from_slice(payload)
                    .map_err(|e| TransferError::Malformed(format!("meta: {}", e)))?;
                self.handle_meta(meta);
                Ok(None)
            }
            TransferTopic::Chunk(_) => {
                let chunk: ChunkMessage = serde_json::from_slice(payload)
                    .map_err(|e| TransferError::Malformed(format!("chunk: {}", e)))?;
                self.handle_chunk(chunk)
            }
        }
    }

    /// Open a session for a transfer. An existing session for the same id
    /// is replaced: a fresh meta means the sender restarted the send.
    pub fn handle_meta(&self, meta: TransferMeta) {
        debug!(
            "transfer {}: meta ({} chunks, {} bytes)",
            meta.transfer_id, meta.total_chunks, meta.size_bytes
        );
        let session = TransferSession::new(&meta);
        if self.sessions.insert(meta.transfer_id.clone(), session).is_some() {
            warn!("transfer {}: restarted by new meta", meta.transfer_id);
        }
    }

    /// Buffer one chunk. Returns the reassembled payload when this chunk
    /// completes the transfer.
    ///
    /// Duplicate chunks are a no-op; a chunk failing its CRC is discarded
    /// without failing the session; a whole-payload checksum mismatch fails
    /// the session and frees its buffers.
    pub fn handle_chunk(&self, chunk: ChunkMessage) -> Result<Option<Bytes>, TransferError> {
        let bytes = chunk.verified_bytes()?;

        let (completed, declared) = {
            let mut session = self
                .sessions
                .get_mut(&chunk.transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(chunk.transfer_id.clone()))?;

            session.last_activity = Instant::now();

            if chunk.index >= session.total_chunks {
                return Err(TransferError::Malformed(format!(
                    "chunk index {} out of range ({} total)",
                    chunk.index, session.total_chunks
                )));
            }

            // Idempotent: a redelivered chunk changes nothing.
            session.received.entry(chunk.index).or_insert(bytes);

            if !session.is_complete() {
                return Ok(None);
            }
            (session.assemble(), session.checksum.clone())
        };

        // Completion or failure both close the session; no chunks are
        // accepted for this id afterwards.
        self.sessions.remove(&chunk.transfer_id);

        let actual = payload_checksum(&completed);
        if actual != declared {
            warn!("transfer {}: checksum mismatch, discarding", chunk.transfer_id);
            return Err(TransferError::ChecksumMismatch {
                transfer_id: chunk.transfer_id,
                expected: declared,
                actual,
            });
        }

        info!(
            "transfer {}: complete ({} bytes)",
            chunk.transfer_id,
            completed.len()
        );
        Ok(Some(completed))
    }

    /// Free sessions with no activity for longer than the idle timeout.
    /// Returns how many were abandoned.
    pub fn sweep_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|transfer_id, session| {
                let keep = session.last_activity.elapsed() <= self.idle_timeout;
                if !keep {
                    debug!("transfer {}: abandoned after idle timeout", transfer_id);
                }
                keep
            });
        before - self.sessions.len()
    }

    /// Drop every open session (manager shutdown).
    pub fn clear(&self) {
        self.sessions.clear();
    }
}
