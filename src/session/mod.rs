//! Broker session
//!
//! Owns the single connection to the external MQTT broker: the
//! connect/reconnect state machine, keepalive, subscription
//! (re-)registration and the publish/subscribe primitives every bridge
//! shares. Bridges never touch the transport; all writes funnel through
//! one command channel into the connection task, which serializes them
//! onto the socket.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{Decoder, Encoder};
use crate::config::BrokerConfig;
use crate::protocol::{
    ConnAck, Connect, ConnectionState, Packet, Publish, QoS, Subscribe, Subscription, Unsubscribe,
};

/// Error type for broker session operations
#[derive(Debug)]
pub enum SessionError {
    /// Publish/subscribe attempted while the session is not connected
    NotConnected,
    /// Transport-level failure (connect, read or write)
    Transport(String),
    /// Connect or handshake timed out
    Timeout,
    /// Broker rejected the connection
    Rejected(String),
    /// The session task has shut down
    ChannelClosed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "not connected to broker"),
            SessionError::Transport(msg) => write!(f, "transport error: {}", msg),
            SessionError::Timeout => write!(f, "operation timed out"),
            SessionError::Rejected(msg) => write!(f, "broker rejected connection: {}", msg),
            SessionError::ChannelClosed => write!(f, "session task has shut down"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A message received from the broker on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Commands sent from callers into the connection task.
#[derive(Debug)]
enum SessionCommand {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Shutdown,
}

const COMMAND_QUEUE: usize = 1024;
const INBOUND_QUEUE: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;

/// The shared broker connection.
pub struct BrokerSession {
    config: BrokerConfig,
    state: Arc<RwLock<ConnectionState>>,
    command_tx: mpsc::Sender<SessionCommand>,
    /// Topics of interest, replayed on every reconnect
    subscriptions: Arc<DashMap<String, QoS>>,
}

impl BrokerSession {
    /// Spawn the connection task. Returns the session handle and the channel
    /// of inbound messages for all subscribed topics.
    pub fn spawn(config: BrokerConfig) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let subscriptions: Arc<DashMap<String, QoS>> = Arc::new(DashMap::new());

        let session = Arc::new(Self {
            config: config.clone(),
            state: state.clone(),
            command_tx,
            subscriptions: subscriptions.clone(),
        });

        tokio::spawn(Self::connection_loop(
            config,
            state,
            subscriptions,
            command_rx,
            inbound_tx,
        ));

        (session, inbound_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// The broker configuration this session was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Publish a message. Fails with `NotConnected` while the session is
    /// down; the message is dropped, never queued.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.command_tx
            .send(SessionCommand::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Register interest in a broker topic. The registration survives
    /// reconnects: it is replayed every time the session reaches
    /// `Connected`. Safe to call while disconnected.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SessionError> {
        self.subscriptions.insert(filter.to_string(), qos);
        if self.is_connected() {
            self.command_tx
                .send(SessionCommand::Subscribe {
                    filter: filter.to_string(),
                    qos,
                })
                .await
                .map_err(|_| SessionError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Drop interest in a broker topic.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SessionError> {
        self.subscriptions.remove(filter);
        if self.is_connected() {
            self.command_tx
                .send(SessionCommand::Unsubscribe {
                    filter: filter.to_string(),
                })
                .await
                .map_err(|_| SessionError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Shut the session down: send DISCONNECT if connected, stop the
    /// connection task and release the transport.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown).await;
    }

    /// Connection loop: connect, run, back off, retry. Runs until shutdown.
    async fn connection_loop(
        config: BrokerConfig,
        state: Arc<RwLock<ConnectionState>>,
        subscriptions: Arc<DashMap<String, QoS>>,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) {
        let base_interval = config.reconnect_interval_duration();
        let max_interval = config.max_reconnect_interval_duration();
        let stable_threshold = config.stable_connection_duration();
        let mut retry_interval = base_interval;

        loop {
            // Outgoing messages queued while down are stale by now; drop
            // them rather than replaying them after reconnect.
            if Self::drain_stale_commands(&mut command_rx) {
                info!("broker session: shutdown requested");
                *state.write() = ConnectionState::Disconnected;
                return;
            }

            *state.write() = ConnectionState::Connecting;
            debug!("broker session: connecting to {}", config.address());

            let mut connected_since: Option<Instant> = None;
            match Self::connect_and_run(
                &config,
                &state,
                &subscriptions,
                &mut command_rx,
                &inbound_tx,
                &mut connected_since,
            )
            .await
            {
                Ok(()) => {
                    info!("broker session: disconnected gracefully");
                    *state.write() = ConnectionState::Disconnected;
                    return;
                }
                Err(e) => {
                    error!("broker session: connection failed: {}", e);

                    // A connection that stayed up long enough proves the
                    // broker is healthy again; restart the backoff ladder.
                    let was_stable = connected_since
                        .map(|at| at.elapsed() >= stable_threshold)
                        .unwrap_or(false);
                    if was_stable {
                        retry_interval = base_interval;
                    }

                    *state.write() = ConnectionState::Reconnecting;
                    debug!("broker session: reconnecting in {:?}", retry_interval);
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, max_interval);
                }
            }
        }
    }

    /// Drop queued Publish/Subscribe commands. Returns true when a shutdown
    /// command was found.
    fn drain_stale_commands(command_rx: &mut mpsc::Receiver<SessionCommand>) -> bool {
        loop {
            match command_rx.try_recv() {
                Ok(SessionCommand::Shutdown) => return true,
                Ok(_) => continue,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Connect to the broker, complete the handshake, replay subscriptions
    /// and run the message loop until an error or shutdown.
    async fn connect_and_run(
        config: &BrokerConfig,
        state: &Arc<RwLock<ConnectionState>>,
        subscriptions: &Arc<DashMap<String, QoS>>,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
        inbound_tx: &mpsc::Sender<InboundMessage>,
        connected_since: &mut Option<Instant>,
    ) -> Result<(), SessionError> {
        let stream = timeout(
            config.connect_timeout_duration(),
            TcpStream::connect(config.address()),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

        debug!("broker session: TCP connected");

        let encoder = Encoder::new();
        let decoder = Decoder::new();
        let (mut read_half, mut write_half) = stream.into_split();

        // CONNECT
        let connect = Packet::Connect(Connect {
            client_id: config.client_id.clone(),
            clean_session: config.clean_session,
            keep_alive: config.keepalive,
            username: config.username.clone(),
            password: config
                .password
                .as_ref()
                .map(|p| Bytes::from(p.clone().into_bytes())),
        });

        let mut buf = BytesMut::new();
        encoder
            .encode(&connect, &mut buf)
            .map_err(|e| SessionError::Transport(format!("encode error: {}", e)))?;
        write_half
            .write_all(&buf)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        // CONNACK
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
        let connack = timeout(
            config.connect_timeout_duration(),
            Self::read_packet(&decoder, &mut read_half, &mut read_buf),
        )
        .await
        .map_err(|_| SessionError::Timeout)??;

        match connack {
            Packet::ConnAck(ConnAck { return_code: 0, session_present }) => {
                info!(
                    "broker session: connected to {} (session_present={})",
                    config.address(),
                    session_present
                );
            }
            Packet::ConnAck(ack) => {
                return Err(SessionError::Rejected(format!(
                    "CONNACK return code {}",
                    ack.return_code
                )));
            }
            other => {
                return Err(SessionError::Transport(format!(
                    "expected CONNACK, got packet type {}",
                    other.packet_type()
                )));
            }
        }

        *state.write() = ConnectionState::Connected;
        *connected_since = Some(Instant::now());

        // Replay every registered subscription before any traffic flows, so
        // broker->bus bridges are live as soon as we are Connected.
        let filters: Vec<(String, QoS)> = subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if !filters.is_empty() {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: filters
                    .iter()
                    .map(|(filter, qos)| Subscription {
                        filter: filter.clone(),
                        qos: *qos,
                    })
                    .collect(),
            });
            buf.clear();
            encoder
                .encode(&subscribe, &mut buf)
                .map_err(|e| SessionError::Transport(format!("encode error: {}", e)))?;
            write_half
                .write_all(&buf)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            debug!("broker session: resubscribed {} topics", filters.len());
        }

        // Message loop
        let keepalive = config.keepalive_duration();
        let mut keepalive_timer = tokio::time::interval(keepalive);
        keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive_timer.reset();
        let mut last_inbound = Instant::now();
        // Packet id 0 is not a valid MQTT identifier
        let mut packet_id: u16 = 1;
        let mut next_id = || {
            packet_id = packet_id.wrapping_add(1).max(1);
            packet_id
        };

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        SessionCommand::Publish { topic, payload, qos, retain } => {
                            let publish = Packet::Publish(Publish {
                                dup: false,
                                qos,
                                retain,
                                packet_id: (qos != QoS::AtMostOnce).then(|| next_id()),
                                topic,
                                payload,
                            });
                            buf.clear();
                            match encoder.encode(&publish, &mut buf) {
                                Ok(()) => {
                                    write_half
                                        .write_all(&buf)
                                        .await
                                        .map_err(|e| SessionError::Transport(e.to_string()))?;
                                }
                                Err(e) => warn!("broker session: dropping unencodable publish: {}", e),
                            }
                        }
                        SessionCommand::Subscribe { filter, qos } => {
                            let subscribe = Packet::Subscribe(Subscribe {
                                packet_id: next_id(),
                                subscriptions: vec![Subscription { filter, qos }],
                            });
                            buf.clear();
                            if encoder.encode(&subscribe, &mut buf).is_ok() {
                                write_half
                                    .write_all(&buf)
                                    .await
                                    .map_err(|e| SessionError::Transport(e.to_string()))?;
                            }
                        }
                        SessionCommand::Unsubscribe { filter } => {
                            let unsubscribe = Packet::Unsubscribe(Unsubscribe {
                                packet_id: next_id(),
                                filters: vec![filter],
                            });
                            buf.clear();
                            if encoder.encode(&unsubscribe, &mut buf).is_ok() {
                                write_half
                                    .write_all(&buf)
                                    .await
                                    .map_err(|e| SessionError::Transport(e.to_string()))?;
                            }
                        }
                        SessionCommand::Shutdown => {
                            buf.clear();
                            if encoder.encode(&Packet::Disconnect, &mut buf).is_ok() {
                                let _ = write_half.write_all(&buf).await;
                            }
                            return Ok(());
                        }
                    }
                }

                result = read_half.read_buf(&mut read_buf) => {
                    let n = result.map_err(|e| SessionError::Transport(e.to_string()))?;
                    if n == 0 {
                        return Err(SessionError::Transport("connection closed by broker".to_string()));
                    }
                    last_inbound = Instant::now();

                    // Drain every complete packet in the buffer
                    loop {
                        let consumed = match decoder.decode(&read_buf) {
                            Ok(Some((packet, consumed))) => {
                                Self::handle_inbound(
                                    packet,
                                    &encoder,
                                    &mut buf,
                                    &mut write_half,
                                    inbound_tx,
                                )
                                .await?;
                                consumed
                            }
                            Ok(None) => break,
                            Err(e) => {
                                return Err(SessionError::Transport(format!("decode error: {}", e)));
                            }
                        };
                        let _ = read_buf.split_to(consumed);
                    }
                }

                _ = keepalive_timer.tick() => {
                    // A broker that went quiet for two keepalive periods is
                    // treated as dead even if the socket has not errored.
                    if last_inbound.elapsed() > keepalive * 2 {
                        return Err(SessionError::Transport("keepalive timeout".to_string()));
                    }
                    buf.clear();
                    if encoder.encode(&Packet::PingReq, &mut buf).is_ok() {
                        write_half
                            .write_all(&buf)
                            .await
                            .map_err(|e| SessionError::Transport(e.to_string()))?;
                    }
                }
            }
        }
    }

    /// React to one inbound packet inside the message loop.
    async fn handle_inbound(
        packet: Packet,
        encoder: &Encoder,
        buf: &mut BytesMut,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        inbound_tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<(), SessionError> {
        match packet {
            Packet::Publish(publish) => {
                // Acknowledge QoS 1 before dispatch; the bridge pipeline is
                // responsible for what happens to the message afterwards.
                if publish.qos == QoS::AtLeastOnce {
                    if let Some(packet_id) = publish.packet_id {
                        buf.clear();
                        let puback = Packet::PubAck(crate::protocol::PubAck { packet_id });
                        if encoder.encode(&puback, buf).is_ok() {
                            let _ = write_half.write_all(buf).await;
                        }
                    }
                }
                if inbound_tx
                    .send(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                    .await
                    .is_err()
                {
                    return Err(SessionError::ChannelClosed);
                }
            }
            Packet::PingResp => debug!("broker session: PINGRESP"),
            Packet::SubAck(ack) => {
                if ack.return_codes.iter().any(|code| *code == 0x80) {
                    warn!("broker session: broker refused a subscription (SUBACK 0x80)");
                }
            }
            Packet::PubAck(_) | Packet::UnsubAck(_) => {}
            Packet::Disconnect => {
                return Err(SessionError::Transport("broker sent DISCONNECT".to_string()));
            }
            other => {
                debug!(
                    "broker session: ignoring unexpected packet type {}",
                    other.packet_type()
                );
            }
        }
        Ok(())
    }

    /// Read from the socket until one complete packet is available.
    async fn read_packet(
        decoder: &Decoder,
        read_half: &mut tokio::net::tcp::OwnedReadHalf,
        read_buf: &mut BytesMut,
    ) -> Result<Packet, SessionError> {
        loop {
            if let Some((packet, consumed)) = decoder
                .decode(read_buf)
                .map_err(|e| SessionError::Transport(format!("decode error: {}", e)))?
            {
                let _ = read_buf.split_to(consumed);
                return Ok(packet);
            }
            let n = read_half
                .read_buf(read_buf)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(SessionError::Transport(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
    }
}
