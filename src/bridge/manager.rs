//! Bridge manager
//!
//! Owns the bridge fleet and the shared broker session. Routes inbound bus
//! events through the forward pipeline and inbound broker messages to the
//! owning bridge or the chunk receiver, and periodically publishes fleet
//! statistics and a liveness heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::runtime::{Bridge, BridgeStatsSnapshot, Outbound};
use super::BridgeError;
use crate::bus::BusEndpoint;
use crate::config::{Config, ConfigError};
use crate::protocol::QoS;
use crate::schema::SchemaRegistry;
use crate::session::{BrokerSession, InboundMessage};
use crate::transfer::{
    parse_transfer_topic, transfer_filter, ChunkReceiver, ChunkSender, TransferError, TransferTopic,
};

/// A large payload reassembled by the chunk receiver.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub transfer_id: String,
    pub payload: Bytes,
}

const COMPLETED_QUEUE: usize = 16;

/// Milliseconds since the Unix epoch.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Manages all bridges sharing one broker session.
pub struct BridgeManager {
    config: Config,
    bridges: Vec<Arc<Bridge>>,
    /// broker topic -> bridge, for broker->bus routing
    inbound_index: HashMap<String, Arc<Bridge>>,
    session: Arc<BrokerSession>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    bus: Arc<dyn BusEndpoint>,
    chunk_sender: ChunkSender,
    chunk_receiver: Arc<ChunkReceiver>,
    completed_tx: mpsc::Sender<CompletedTransfer>,
    completed_rx: Mutex<Option<mpsc::Receiver<CompletedTransfer>>>,
    shutdown_tx: watch::Sender<bool>,
    node: String,
    started_at: Instant,
}

impl BridgeManager {
    /// Build the bridge fleet from validated configuration and spawn the
    /// broker session. Unknown schemas and duplicate names are fatal here,
    /// before any bridge runs.
    pub fn new(
        config: Config,
        bus: Arc<dyn BusEndpoint>,
        registry: &SchemaRegistry,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let mut bridges = Vec::new();
        let mut inbound_index = HashMap::new();
        for spec in &config.bridge {
            if !spec.enabled {
                info!("bridge '{}': disabled, skipping", spec.name);
                continue;
            }
            let codec = registry
                .resolve(&spec.schema)
                .map_err(|e| ConfigError::Validation(format!("bridge '{}': {}", spec.name, e)))?;
            let bridge = Arc::new(Bridge::new(
                spec.clone(),
                codec,
                &config.broker,
                &config.transfer,
            ));
            if spec.is_broker_to_bus() {
                inbound_index.insert(bridge.broker_topic().to_string(), bridge.clone());
            }
            bridges.push(bridge);
        }

        let node = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let (session, inbound_rx) = BrokerSession::spawn(config.broker.clone());
        let chunk_sender = ChunkSender::new(
            session.clone(),
            config.transfer.clone(),
            config.broker.topic_prefix.clone(),
            node.clone(),
        );
        let chunk_receiver = Arc::new(ChunkReceiver::new(
            config.transfer.idle_timeout_duration(),
        ));
        let (completed_tx, completed_rx) = mpsc::channel(COMPLETED_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            bridges,
            inbound_index,
            session,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            bus,
            chunk_sender,
            chunk_receiver,
            completed_tx,
            completed_rx: Mutex::new(Some(completed_rx)),
            shutdown_tx,
            node,
            started_at: Instant::now(),
        }))
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    /// Statistics snapshot for every bridge.
    pub fn statistics(&self) -> Vec<BridgeStatsSnapshot> {
        self.bridges.iter().map(|b| b.snapshot()).collect()
    }

    /// Take the channel of completed inbound transfers. Yields each
    /// reassembled payload exactly once; callable once.
    pub fn take_completed_transfers(&self) -> Option<mpsc::Receiver<CompletedTransfer>> {
        self.completed_rx.lock().take()
    }

    /// Send an arbitrary payload as a chunked transfer, outside any bridge.
    pub async fn send_payload(&self, payload: &[u8]) -> Result<String, TransferError> {
        self.chunk_sender.send(payload).await
    }

    /// Register broker subscriptions and spawn every long-running task:
    /// one forward loop per bus->broker bridge, the inbound dispatcher,
    /// statistics, heartbeat and the transfer idle sweep.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        // Broker-side interest first; the session replays these on every
        // reconnect, so registering before the first connect is fine.
        for bridge in self.inbound_index.values() {
            self.session
                .subscribe(bridge.broker_topic(), bridge.qos())
                .await?;
        }
        self.session
            .subscribe(
                &transfer_filter(&self.config.broker.topic_prefix),
                QoS::from_u8(self.config.transfer.qos).unwrap_or_default(),
            )
            .await?;

        for bridge in &self.bridges {
            if !bridge.spec().is_bus_to_broker() {
                continue;
            }
            let rx = self.bus.subscribe(&bridge.spec().bus_topic).await?;
            info!(
                "bridge '{}': {} {} -> {}",
                bridge.name(),
                bridge.spec().direction,
                bridge.spec().bus_topic,
                bridge.broker_topic()
            );
            tokio::spawn(Self::bus_forward_loop(
                self.clone(),
                bridge.clone(),
                rx,
                self.shutdown_tx.subscribe(),
            ));
        }

        let inbound_rx = match self.inbound_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("bridge manager: start called twice, ignoring");
                return Ok(());
            }
        };
        tokio::spawn(Self::inbound_loop(
            self.clone(),
            inbound_rx,
            self.shutdown_tx.subscribe(),
        ));

        if self.config.statistics.enabled {
            tokio::spawn(Self::statistics_loop(
                self.clone(),
                self.shutdown_tx.subscribe(),
            ));
            tokio::spawn(Self::heartbeat_loop(
                self.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }
        tokio::spawn(Self::sweep_loop(self.clone(), self.shutdown_tx.subscribe()));

        info!(
            "bridge manager: started {} bridges (node {})",
            self.bridges.len(),
            self.node
        );
        Ok(())
    }

    /// Stop every task, abandon in-flight transfers and close the broker
    /// session.
    pub async fn shutdown(&self) {
        info!("bridge manager: shutting down");
        let _ = self.shutdown_tx.send(true);
        self.chunk_receiver.clear();
        self.session.shutdown().await;
    }

    /// Per-bridge forward loop: one iteration per bus message, in bus
    /// delivery order.
    async fn bus_forward_loop(
        manager: Arc<Self>,
        bridge: Arc<Bridge>,
        mut rx: mpsc::Receiver<Bytes>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                message = rx.recv() => {
                    let Some(raw) = message else {
                        warn!("bridge '{}': bus subscription ended", bridge.name());
                        break;
                    };
                    manager.forward_bus_message(&bridge, &raw).await;
                }
            }
        }
    }

    /// Forward one bus message through the bridge pipeline. All failures
    /// drop only this message.
    async fn forward_bus_message(&self, bridge: &Arc<Bridge>, raw: &[u8]) {
        match bridge.process_outbound(raw, Instant::now(), unix_millis()) {
            Ok(Outbound::Gated) => {}
            Ok(Outbound::Envelope(payload)) => {
                let len = payload.len();
                match self
                    .session
                    .publish(bridge.broker_topic(), payload, bridge.qos(), bridge.retain())
                    .await
                {
                    Ok(()) => bridge.record_forward(len),
                    Err(e) => {
                        let e = BridgeError::Session(e);
                        debug!("bridge '{}': publish dropped: {}", bridge.name(), e);
                        bridge.record_error(&e);
                    }
                }
            }
            Ok(Outbound::Transfer(bytes)) => {
                let len = bytes.len();
                match self.chunk_sender.send(&bytes).await {
                    Ok(transfer_id) => {
                        debug!(
                            "bridge '{}': {} bytes sent as transfer {}",
                            bridge.name(),
                            len,
                            transfer_id
                        );
                        bridge.record_forward(len);
                    }
                    Err(e) => {
                        let e = BridgeError::Transfer(e);
                        warn!("bridge '{}': transfer failed: {}", bridge.name(), e);
                        bridge.record_error(&e);
                    }
                }
            }
            Err(e) => {
                warn!("bridge '{}': dropping message: {}", bridge.name(), e);
                bridge.record_error(&e);
            }
        }
    }

    /// Dispatch loop for everything the broker session receives.
    async fn inbound_loop(
        manager: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                message = inbound_rx.recv() => {
                    let Some(message) = message else { break };
                    manager.dispatch_inbound(message).await;
                }
            }
        }
    }

    /// Route one inbound broker message to the chunk receiver or the
    /// owning broker->bus bridge.
    async fn dispatch_inbound(&self, message: InboundMessage) {
        let prefix = &self.config.broker.topic_prefix;
        if let Some(transfer_topic) = parse_transfer_topic(prefix, &message.topic) {
            match self
                .chunk_receiver
                .handle_message(&transfer_topic, &message.payload)
            {
                Ok(Some(payload)) => {
                    let transfer_id = match transfer_topic {
                        TransferTopic::Meta(id) | TransferTopic::Chunk(id) => id,
                    };
                    info!(
                        "transfer {}: reassembled {} bytes",
                        transfer_id,
                        payload.len()
                    );
                    // A slow consumer loses the oldest completion rather
                    // than stalling the dispatch loop.
                    let _ = self.completed_tx.try_send(CompletedTransfer {
                        transfer_id,
                        payload,
                    });
                }
                Ok(None) => {}
                Err(TransferError::UnknownTransfer(id)) => {
                    debug!("transfer {}: chunk without session, dropped", id);
                }
                Err(e) => warn!("transfer message rejected: {}", e),
            }
            return;
        }

        let Some(bridge) = self.inbound_index.get(&message.topic) else {
            debug!("no bridge for inbound topic {}", message.topic);
            return;
        };

        match bridge.process_inbound(&message.payload) {
            Ok(raw) => {
                let len = raw.len();
                match self.bus.publish(&bridge.spec().bus_topic, raw).await {
                    Ok(()) => bridge.record_forward(len),
                    Err(e) => {
                        let e = BridgeError::Bus(e);
                        error!("bridge '{}': bus publish failed: {}", bridge.name(), e);
                        bridge.record_error(&e);
                    }
                }
            }
            Err(e) => {
                warn!("bridge '{}': dropping inbound message: {}", bridge.name(), e);
                bridge.record_error(&e);
            }
        }
    }

    /// Periodic fleet statistics on `{prefix}/bridge/statistics`.
    async fn statistics_loop(manager: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(manager.config.statistics.interval_duration());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = timer.tick() => manager.publish_statistics().await,
            }
        }
    }

    async fn publish_statistics(&self) {
        // Same state check as every publish: skipped silently while down,
        // counters keep accumulating.
        if !self.session.is_connected() {
            return;
        }
        let report = serde_json::json!({
            "node": self.node,
            "timestamp": unix_millis(),
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
            "bridges": self.statistics(),
        });
        let topic = format!("{}/bridge/statistics", self.config.broker.topic_prefix);
        match serde_json::to_vec(&report) {
            Ok(raw) => {
                if let Err(e) = self
                    .session
                    .publish(&topic, Bytes::from(raw), QoS::AtMostOnce, false)
                    .await
                {
                    debug!("statistics publish skipped: {}", e);
                }
            }
            Err(e) => error!("statistics serialization failed: {}", e),
        }
    }

    /// Periodic liveness heartbeat on `{prefix}/bridge/heartbeat`.
    async fn heartbeat_loop(manager: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(manager.config.statistics.heartbeat_duration());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = timer.tick() => manager.publish_heartbeat().await,
            }
        }
    }

    async fn publish_heartbeat(&self) {
        if !self.session.is_connected() {
            return;
        }
        let heartbeat = serde_json::json!({
            "node": self.node,
            "timestamp": unix_millis(),
            "bridge_count": self.bridges.len(),
            "connection": self.session.state().to_string(),
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
        });
        let topic = format!("{}/bridge/heartbeat", self.config.broker.topic_prefix);
        match serde_json::to_vec(&heartbeat) {
            Ok(raw) => {
                if let Err(e) = self
                    .session
                    .publish(&topic, Bytes::from(raw), QoS::AtMostOnce, false)
                    .await
                {
                    debug!("heartbeat publish skipped: {}", e);
                }
            }
            Err(e) => error!("heartbeat serialization failed: {}", e),
        }
    }

    /// Periodically free idle transfer sessions.
    async fn sweep_loop(manager: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = manager
            .config
            .transfer
            .idle_timeout_duration()
            .checked_div(2)
            .unwrap_or_default()
            .max(std::time::Duration::from_secs(1));
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = timer.tick() => {
                    let freed = manager.chunk_receiver.sweep_idle();
                    if freed > 0 {
                        debug!("abandoned {} idle transfer sessions", freed);
                    }
                }
            }
        }
    }
}
