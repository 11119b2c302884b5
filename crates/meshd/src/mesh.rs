//! The mesh engine context
//!
//! [`Mesh`] owns every peer record, connection, tunnel and channel of the
//! local peer. It never blocks and never does I/O: the driver feeds it
//! neighbor messages, local client calls and the current time, and the
//! engine answers through its collaborators ([`NeighborSink`],
//! [`PathDiscovery`], [`LocalClient`]).
//!
//! The layers live in separate `impl Mesh` blocks:
//! - [`crate::peer`]: peer records, paths and per-neighbor queues
//! - [`crate::connection`]: hop-by-hop signaling and flow control
//! - [`crate::tunnel`]: connection selection, key exchange, encryption
//! - [`crate::channel`]: channel handshake, reliability and local delivery

use crate::config::MeshConfig;
use crate::connection::Connection;
use crate::discovery::PathDiscovery;
use crate::error::Result;
use crate::local::{ClientId, ClientRegistry, LocalClient};
use crate::peer::{NeighborSink, PeerRecord};
use crate::stats::MeshStats;
use crate::timers::{TimerEvent, TimerId, Timers};
use crate::tunnel::{Tunnel, TunnelMessage, TunnelState};
use mesh_core::{ChannelNumber, ConnectionId, ConnectionMessage, PeerId, Port};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Engine state of one local peer
pub struct Mesh {
    pub(crate) my_id: PeerId,
    pub(crate) config: MeshConfig,
    pub(crate) now: Instant,
    pub(crate) peers: HashMap<PeerId, PeerRecord>,
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) tunnels: HashMap<PeerId, Tunnel>,
    pub(crate) clients: ClientRegistry,
    pub(crate) timers: Timers,
    pub(crate) stats: MeshStats,
    pub(crate) sink: Box<dyn NeighborSink>,
    pub(crate) discovery: Box<dyn PathDiscovery>,
    pub(crate) client: Box<dyn LocalClient>,
    pub(crate) loopback_queue: VecDeque<TunnelMessage>,
    pub(crate) loopback_draining: bool,
}

impl Mesh {
    pub fn new(
        my_id: PeerId,
        config: MeshConfig,
        sink: Box<dyn NeighborSink>,
        discovery: Box<dyn PathDiscovery>,
        client: Box<dyn LocalClient>,
        now: Instant,
    ) -> Self {
        info!("Mesh engine for {} (window {})", my_id, config.queue_max());
        Self {
            my_id,
            config,
            now,
            peers: HashMap::new(),
            connections: HashMap::new(),
            tunnels: HashMap::new(),
            clients: ClientRegistry::new(),
            timers: Timers::new(),
            stats: MeshStats::default(),
            sink,
            discovery,
            client,
            loopback_queue: VecDeque::new(),
            loopback_draining: false,
        }
    }

    pub fn my_id(&self) -> PeerId {
        self.my_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Register a local client
    pub fn connect_client(&mut self) -> ClientId {
        let client = self.clients.connect();
        debug!("Client {} connected", client);
        client
    }

    /// Drop a local client together with its ports and channels
    pub fn disconnect_client(&mut self, client: ClientId, now: Instant) -> Result<()> {
        self.now = now;
        let channels = self.clients.disconnect(client)?;
        info!("Client {} disconnected, closing {} channels", client, channels.len());
        for (_, channel) in channels {
            self.channel_teardown(channel.peer, channel.gid, channel.direction);
        }
        Ok(())
    }

    /// Listen for incoming channels on `port`
    pub fn open_port(&mut self, client: ClientId, port: Port) -> Result<()> {
        self.clients.open_port(client, port)?;
        debug!("Client {} listening on port {}", client, port);
        Ok(())
    }

    pub fn close_port(&mut self, client: ClientId, port: Port) -> Result<()> {
        self.clients.close_port(client, port)
    }

    /// Dispatch one message received from neighbor `from`
    pub fn handle_message(&mut self, from: PeerId, message: ConnectionMessage, now: Instant) {
        self.now = now;
        self.stats.messages_received += 1;
        if let Err(e) = message.validate() {
            self.protocol_violation(from, message.kind(), &e.to_string());
            return;
        }
        debug!("<- {} from {} on {}", message.kind(), from, message.cid());

        match message {
            ConnectionMessage::Create { cid, path } => self.handle_connection_create(from, cid, path),
            ConnectionMessage::Ack { cid } => self.handle_connection_ack(from, cid),
            ConnectionMessage::Broken { cid, peer1, peer2 } => {
                self.handle_connection_broken(from, cid, peer1, peer2)
            }
            ConnectionMessage::Destroy { cid } => self.handle_connection_destroy(from, cid),
            ConnectionMessage::Fwd(frame) => {
                self.handle_encrypted(from, mesh_core::Direction::Fwd, frame)
            }
            ConnectionMessage::Bck(frame) => {
                self.handle_encrypted(from, mesh_core::Direction::Bck, frame)
            }
            ConnectionMessage::FlowAck { cid, ack } => self.handle_flow_ack(from, cid, ack),
            ConnectionMessage::Poll { cid, pid } => self.handle_poll(from, cid, pid),
            ConnectionMessage::Keepalive { cid, direction } => {
                self.handle_keepalive(from, cid, direction)
            }
            ConnectionMessage::Kx {
                cid,
                direction,
                ephemeral,
                force_reply,
            } => self.handle_kx(from, cid, direction, ephemeral, force_reply),
        }
    }

    /// Run every timer due at `now`
    pub fn handle_timeouts(&mut self, now: Instant) {
        self.now = now;
        while let Some((id, event)) = self.timers.pop_due(now) {
            self.fire_timer(id, event);
        }
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn fire_timer(&mut self, id: TimerId, event: TimerEvent) {
        match event {
            TimerEvent::ConnectionMaintenance { cid, direction } => {
                self.connection_maintenance(id, cid, direction)
            }
            TimerEvent::Poll { cid, direction } => self.connection_poll(id, cid, direction),
            TimerEvent::ChannelRetransmit {
                peer,
                gid,
                direction,
            } => self.channel_retransmit(id, peer, gid, direction),
            TimerEvent::ChannelControlRetry {
                peer,
                gid,
                direction,
            } => self.channel_control_retry(id, peer, gid, direction),
            TimerEvent::TunnelKxRetry { peer } => self.tunnel_kx_retry(id, peer),
        }
    }

    /// Count and log a message a neighbor should not have sent
    pub(crate) fn protocol_violation(&mut self, from: PeerId, kind: &str, reason: &str) {
        self.stats.protocol_violations += 1;
        warn!("Protocol violation by {} ({}): {}", from, kind, reason);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// State of the tunnel towards `peer`
    pub fn tunnel_state(&self, peer: &PeerId) -> Option<TunnelState> {
        self.tunnels.get(peer).map(|t| t.state)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Known paths to `peer`, best first
    pub fn paths_to(&self, peer: &PeerId) -> Vec<Vec<PeerId>> {
        self.peers
            .get(peer)
            .map(|r| r.paths.iter().map(|p| p.path.peers().to_vec()).collect())
            .unwrap_or_default()
    }

    /// Unacknowledged reliable messages sent on a local channel
    pub fn unacked(&self, client: ClientId, lid: ChannelNumber) -> Result<usize> {
        let channel = self.clients.channel(client, lid)?;
        Ok(self
            .tunnels
            .get(&channel.peer)
            .and_then(|t| t.channels.get(&channel.gid))
            .and_then(|c| c.end(channel.direction))
            .map(|end| end.rel.sent.len())
            .unwrap_or(0))
    }
}
