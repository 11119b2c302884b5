//! Connections: one path bound into a hop-by-hop pipe
//!
//! Every peer on the path keeps a [`Connection`] for it. Endpoints hand
//! decrypted traffic to their tunnel; relays only check sequence ids,
//! decrement the hop limit and re-queue.
//!
//! Each peer runs one maintenance timer per direction. The origin of a
//! direction uses it to retry CREATE/ACK and later to send keepalives; every
//! other peer uses it as a watchdog that traffic in that direction resets.

use crate::flow::{FlowControl, PidCheck};
use crate::mesh::Mesh;
use crate::path::Path;
use crate::timers::{std_backoff, TimerEvent, TimerId};
use mesh_core::seq::is_pid_bigger;
use mesh_core::{Bytes32, ConnectionId, ConnectionMessage, Direction, EncryptedFrame, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Watchdog period as a multiple of the keepalive period
pub const TIMEOUT_FACTOR: u32 = 4;

/// Cap on the CREATE/ACK retry multiplier
pub const MAX_CREATE_FACTOR: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, CREATE not transmitted yet
    New,
    /// CREATE transmitted (or received, at relays and the destination)
    Sent,
    /// SYN-ACK seen travelling back
    Ack,
    /// Confirmed end to end
    Ready,
}

/// Two-phase teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Refuses new work, frees itself once queued messages are gone
    Draining,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub path: Arc<Path>,
    pub own_pos: usize,
    pub state: ConnectionState,
    /// Tunnel this connection serves (endpoints only)
    pub tunnel: Option<PeerId>,
    pub fwd_fc: FlowControl,
    pub bck_fc: FlowControl,
    /// Messages of this connection still sitting in neighbor queues
    pub pending: u32,
    pub lifecycle: Lifecycle,
    maintenance: [Option<TimerId>; 2],
    create_factor: u32,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Fwd => 0,
        Direction::Bck => 1,
    }
}

impl Connection {
    pub fn new(id: ConnectionId, path: Arc<Path>, own_pos: usize, queue_max: u32) -> Self {
        Self {
            id,
            path,
            own_pos,
            state: ConnectionState::New,
            tunnel: None,
            fwd_fc: FlowControl::new(queue_max),
            bck_fc: FlowControl::new(queue_max),
            pending: 0,
            lifecycle: Lifecycle::Active,
            maintenance: [None, None],
            create_factor: 1,
        }
    }

    /// Flow control of the link traffic travelling `direction` leaves on
    pub fn fc(&self, direction: Direction) -> &FlowControl {
        match direction {
            Direction::Fwd => &self.fwd_fc,
            Direction::Bck => &self.bck_fc,
        }
    }

    pub fn fc_mut(&mut self, direction: Direction) -> &mut FlowControl {
        match direction {
            Direction::Fwd => &mut self.fwd_fc,
            Direction::Bck => &mut self.bck_fc,
        }
    }

    pub fn prev_hop(&self) -> PeerId {
        self.path.peers()[self.own_pos.saturating_sub(1)]
    }

    pub fn next_hop(&self) -> PeerId {
        let peers = self.path.peers();
        peers[(self.own_pos + 1).min(peers.len() - 1)]
    }

    /// Neighbor that traffic travelling `direction` is handed to
    pub fn hop(&self, direction: Direction) -> PeerId {
        match direction {
            Direction::Fwd => self.next_hop(),
            Direction::Bck => self.prev_hop(),
        }
    }

    /// Do we originate traffic travelling `direction`?
    pub fn is_origin(&self, direction: Direction) -> bool {
        match direction {
            Direction::Fwd => self.own_pos == 0,
            Direction::Bck => self.own_pos == self.path.len() - 1,
        }
    }

    /// Does traffic travelling `direction` end here?
    pub fn is_terminal(&self, direction: Direction) -> bool {
        self.is_origin(direction.reverse())
    }

    /// Direction we send tunnel traffic in (endpoints only)
    pub fn send_direction(&self) -> Direction {
        if self.own_pos == 0 {
            Direction::Fwd
        } else {
            Direction::Bck
        }
    }

    /// Direction of a message received from neighbor `from`
    pub fn direction_from(&self, from: &PeerId) -> Option<Direction> {
        if self.own_pos > 0 && self.prev_hop() == *from {
            Some(Direction::Fwd)
        } else if self.own_pos + 1 < self.path.len() && self.next_hop() == *from {
            Some(Direction::Bck)
        } else {
            None
        }
    }

    pub fn has_neighbor(&self, peer: &PeerId) -> bool {
        self.direction_from(peer).is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_draining(&self) -> bool {
        self.lifecycle == Lifecycle::Draining
    }

    /// Usable for new tunnel traffic
    pub fn is_usable(&self) -> bool {
        self.is_ready() && !self.is_draining()
    }

    pub(crate) fn mark_create_sent(&mut self) {
        if self.state == ConnectionState::New {
            self.state = ConnectionState::Sent;
        }
    }
}

impl Mesh {
    fn timeout_period(&self) -> Duration {
        self.config.refresh_connection_time() * TIMEOUT_FACTOR
    }

    fn schedule_maintenance(&mut self, cid: ConnectionId, direction: Direction, delay: Duration) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        if let Some(old) = conn.maintenance[slot(direction)].take() {
            self.timers.cancel(old);
        }
        let id = self
            .timers
            .schedule(self.now + delay, TimerEvent::ConnectionMaintenance { cid, direction });
        conn.maintenance[slot(direction)] = Some(id);
    }

    fn cancel_connection_timers(&mut self, cid: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let ids = [
            conn.maintenance[0].take(),
            conn.maintenance[1].take(),
            conn.fwd_fc.poll_timer.take(),
            conn.bck_fc.poll_timer.take(),
        ];
        for id in ids.into_iter().flatten() {
            self.timers.cancel(id);
        }
    }

    /// Traffic travelling `direction` arrived: push back the watchdog
    fn connection_reset_timeout(&mut self, cid: ConnectionId, direction: Direction) {
        let watchdog = self
            .connections
            .get(&cid)
            .map_or(false, |c| !c.is_origin(direction) && !c.is_draining());
        if watchdog {
            let period = self.timeout_period();
            self.schedule_maintenance(cid, direction, period);
        }
    }

    /// Direction of a message on `cid` from `from`, or log a violation
    fn inbound_direction(&mut self, from: PeerId, cid: ConnectionId, kind: &str) -> Option<Direction> {
        let Some(conn) = self.connections.get(&cid) else {
            debug!("{} on unknown connection {} from {}", kind, cid, from);
            return None;
        };
        match conn.direction_from(&from) {
            Some(direction) => Some(direction),
            None => {
                self.protocol_violation(from, kind, "sender is not a neighbor on the path");
                None
            }
        }
    }

    /// Open a new connection from us to `peer` along `path`
    pub(crate) fn connection_new_outgoing(&mut self, peer: PeerId, path: Arc<Path>) -> ConnectionId {
        let cid = ConnectionId::random();
        let mut conn = Connection::new(cid, path.clone(), 0, self.config.queue_max());
        conn.tunnel = Some(peer);
        self.connections.insert(cid, conn);
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.connections.push(cid);
        }
        self.stats.connections_created += 1;
        info!("Connection {} to {} over {} hops", cid, peer, path.len() - 1);

        let create = ConnectionMessage::Create {
            cid,
            path: path.peers().to_vec(),
        };
        self.queue_message(cid, Direction::Fwd, create, None);
        let retry = self.config.create_connection_time();
        let timeout = self.timeout_period();
        self.schedule_maintenance(cid, Direction::Fwd, retry);
        self.schedule_maintenance(cid, Direction::Bck, timeout);
        cid
    }

    pub(crate) fn handle_connection_create(&mut self, from: PeerId, cid: ConnectionId, peers: Vec<PeerId>) {
        let path = match Path::new(peers) {
            Ok(path) => path,
            Err(e) => {
                self.protocol_violation(from, "CONNECTION_CREATE", &e.to_string());
                return;
            }
        };
        let own_pos = match path.position(&self.my_id) {
            Some(pos) if pos > 0 && path.peers()[pos - 1] == from => pos,
            _ => {
                self.protocol_violation(from, "CONNECTION_CREATE", "not the next hop after sender");
                return;
            }
        };
        let terminal = own_pos == path.len() - 1;

        if let Some(conn) = self.connections.get(&cid) {
            if conn.is_draining() {
                return;
            }
            debug!("Duplicate CONNECTION_CREATE for {}", cid);
            if terminal {
                self.queue_message(cid, Direction::Bck, ConnectionMessage::Ack { cid }, None);
            } else {
                let create = ConnectionMessage::Create {
                    cid,
                    path: path.peers().to_vec(),
                };
                self.queue_message(cid, Direction::Fwd, create, None);
            }
            self.connection_reset_timeout(cid, Direction::Fwd);
            return;
        }

        let origin = path.origin();
        if let Some(back) = path.reversed_prefix(own_pos) {
            self.add_path(origin, back);
        }
        if !terminal {
            if let Some(ahead) = path.suffix(own_pos) {
                self.add_path(path.destination(), ahead);
            }
        }

        let mut conn = Connection::new(cid, path.clone(), own_pos, self.config.queue_max());
        conn.state = ConnectionState::Sent;
        self.connections.insert(cid, conn);
        self.stats.connections_created += 1;
        let timeout = self.timeout_period();

        if terminal {
            info!("Connection {} from {} terminates here", cid, origin);
            self.tunnel_get_or_create(origin);
            if let Some(tunnel) = self.tunnels.get_mut(&origin) {
                tunnel.connections.push(cid);
            }
            if let Some(conn) = self.connections.get_mut(&cid) {
                conn.tunnel = Some(origin);
            }
            self.queue_message(cid, Direction::Bck, ConnectionMessage::Ack { cid }, None);
            let retry = self.config.create_connection_time();
            self.schedule_maintenance(cid, Direction::Bck, retry);
            self.schedule_maintenance(cid, Direction::Fwd, timeout);
        } else {
            let next = path.peers()[own_pos + 1];
            debug!("Relaying connection {} {} -> {}", cid, from, next);
            self.schedule_maintenance(cid, Direction::Fwd, timeout);
            self.schedule_maintenance(cid, Direction::Bck, timeout);
            if self.is_neighbor(&next) {
                let create = ConnectionMessage::Create {
                    cid,
                    path: path.peers().to_vec(),
                };
                self.queue_message(cid, Direction::Fwd, create, None);
            } else {
                self.connection_notify_broken(cid, next);
            }
        }
    }

    pub(crate) fn handle_connection_ack(&mut self, from: PeerId, cid: ConnectionId) {
        let Some(direction) = self.inbound_direction(from, cid, "CONNECTION_ACK") else {
            return;
        };
        self.connection_reset_timeout(cid, direction);
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let terminal = conn.is_terminal(direction);
        let ready = conn.is_ready();

        match (direction, terminal) {
            (Direction::Bck, true) => {
                self.queue_message(cid, Direction::Fwd, ConnectionMessage::Ack { cid }, None);
                if !ready {
                    self.connection_ready(cid);
                }
            }
            (Direction::Bck, false) => {
                if !ready {
                    conn.state = ConnectionState::Ack;
                }
                self.queue_message(cid, Direction::Bck, ConnectionMessage::Ack { cid }, None);
            }
            (Direction::Fwd, true) => {
                if !ready {
                    self.connection_ready(cid);
                }
            }
            (Direction::Fwd, false) => {
                conn.state = ConnectionState::Ready;
                self.queue_message(cid, Direction::Fwd, ConnectionMessage::Ack { cid }, None);
            }
        }
    }

    fn connection_ready(&mut self, cid: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        conn.state = ConnectionState::Ready;
        conn.create_factor = 1;
        let own = conn.send_direction();
        let tunnel = conn.tunnel;
        info!("Connection {} ready", cid);
        let refresh = self.config.refresh_connection_time();
        self.schedule_maintenance(cid, own, refresh);
        if let Some(peer) = tunnel {
            self.tunnel_connection_ready(peer, cid);
        }
    }

    pub(crate) fn handle_encrypted(&mut self, from: PeerId, direction: Direction, mut frame: EncryptedFrame) {
        let cid = frame.cid;
        let kind = if direction.is_fwd() { "FWD" } else { "BCK" };
        let Some(travel) = self.inbound_direction(from, cid, kind) else {
            return;
        };
        if travel != direction {
            self.protocol_violation(from, kind, "frame travelling the wrong way");
            return;
        }
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let rf = conn.fc_mut(direction.reverse());
        match rf.check_received(frame.pid) {
            PidCheck::OutOfWindow => {
                let reason = format!("pid {} beyond credit {}", frame.pid, rf.last_ack_sent);
                self.protocol_violation(from, kind, &reason);
                return;
            }
            PidCheck::Duplicate => {
                self.stats.dropped_duplicate += 1;
                debug!("Duplicate pid {} on {} (last {})", frame.pid, cid, rf.last_pid_recv);
                return;
            }
            PidCheck::Accept => rf.last_pid_recv = frame.pid,
        }
        let terminal = conn.is_terminal(direction);
        let ready = conn.is_ready();
        let tunnel = conn.tunnel;
        self.connection_reset_timeout(cid, direction);

        if terminal {
            if !ready {
                self.connection_ready(cid);
            }
            if let Some(peer) = tunnel {
                self.tunnel_handle_frame(peer, from, frame);
            }
            self.connection_send_ack(cid, direction, false);
        } else if frame.ttl == 0 {
            self.stats.dropped_ttl += 1;
            debug!("TTL expired on {}", cid);
            self.connection_send_ack(cid, direction, false);
        } else {
            frame.ttl -= 1;
            self.stats.messages_forwarded += 1;
            self.queue_message(cid, direction, ConnectionMessage::encrypted(direction, frame), None);
        }
    }

    /// Advertise credit for traffic travelling `direction` to whoever sends it
    pub(crate) fn connection_send_ack(&mut self, cid: ConnectionId, direction: Direction, force: bool) {
        let Some(conn) = self.connections.get(&cid) else {
            return;
        };
        let buffer = if conn.is_terminal(direction) {
            conn.tunnel
                .and_then(|peer| self.tunnels.get(&peer))
                .map_or(0, |t| t.channels_buffer())
        } else {
            conn.fc(direction).buffer_free()
        };
        let Some(ack) = conn.fc(direction.reverse()).next_ack(buffer, force) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&cid) {
            conn.fc_mut(direction.reverse()).last_ack_sent = ack;
        }
        debug!("Granting credit {} on {} ({})", ack, cid, direction);
        self.queue_message(cid, direction.reverse(), ConnectionMessage::FlowAck { cid, ack }, None);
    }

    pub(crate) fn handle_flow_ack(&mut self, from: PeerId, cid: ConnectionId, ack: u32) {
        let Some(travel) = self.inbound_direction(from, cid, "ACK") else {
            return;
        };
        self.connection_reset_timeout(cid, travel);
        let send = travel.reverse();
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let fc = conn.fc_mut(send);
        if fc.record_ack(ack) {
            if let Some(poll) = fc.poll_timer.take() {
                self.timers.cancel(poll);
            }
        }
        let hop = conn.hop(send);
        let endpoint = conn.is_origin(send);
        let tunnel = conn.tunnel;
        self.request_transmit(hop);
        if let (true, Some(peer)) = (endpoint, tunnel) {
            self.tunnel_send_queued(peer);
            self.tunnel_unchoke_channels(peer);
        }
    }

    pub(crate) fn handle_poll(&mut self, from: PeerId, cid: ConnectionId, pid: u32) {
        let Some(travel) = self.inbound_direction(from, cid, "POLL") else {
            return;
        };
        self.connection_reset_timeout(cid, travel);
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let rf = conn.fc_mut(travel.reverse());
        if is_pid_bigger(pid, rf.last_pid_recv) && !is_pid_bigger(pid, rf.last_ack_sent) {
            rf.last_pid_recv = pid;
        }
        self.connection_send_ack(cid, travel, true);
    }

    pub(crate) fn connection_poll(&mut self, id: TimerId, cid: ConnectionId, direction: Direction) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let fc = conn.fc_mut(direction);
        if fc.poll_timer != Some(id) {
            return;
        }
        fc.poll_timer = None;
        let pid = fc.last_pid_sent;
        if !self.has_queued_payload(cid, direction) {
            return;
        }
        debug!("Polling on {} ({}), last pid {}", cid, direction, pid);
        self.queue_message(cid, direction, ConnectionMessage::Poll { cid, pid }, None);
        if let Some(conn) = self.connections.get_mut(&cid) {
            let fc = conn.fc_mut(direction);
            fc.poll_time = std_backoff(fc.poll_time);
        }
        self.schedule_poll(cid, direction);
    }

    pub(crate) fn handle_keepalive(&mut self, from: PeerId, cid: ConnectionId, _direction: Direction) {
        let Some(travel) = self.inbound_direction(from, cid, "KEEPALIVE") else {
            return;
        };
        self.connection_reset_timeout(cid, travel);
        let terminal = self.connections.get(&cid).map_or(true, |c| c.is_terminal(travel));
        if !terminal {
            let keepalive = ConnectionMessage::Keepalive { cid, direction: travel };
            self.queue_message(cid, travel, keepalive, None);
        }
    }

    pub(crate) fn handle_kx(
        &mut self,
        from: PeerId,
        cid: ConnectionId,
        _direction: Direction,
        ephemeral: Bytes32,
        force_reply: bool,
    ) {
        let Some(travel) = self.inbound_direction(from, cid, "KX") else {
            return;
        };
        self.connection_reset_timeout(cid, travel);
        let Some(conn) = self.connections.get(&cid) else {
            return;
        };
        if conn.is_terminal(travel) {
            if let Some(peer) = conn.tunnel {
                self.tunnel_handle_kx(peer, cid, ephemeral, force_reply);
            }
        } else {
            let kx = ConnectionMessage::Kx {
                cid,
                direction: travel,
                ephemeral,
                force_reply,
            };
            self.queue_message(cid, travel, kx, None);
        }
    }

    pub(crate) fn connection_maintenance(&mut self, id: TimerId, cid: ConnectionId, direction: Direction) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        if conn.maintenance[slot(direction)] != Some(id) {
            return;
        }
        conn.maintenance[slot(direction)] = None;

        if !conn.is_origin(direction) {
            info!("Connection {} timed out ({})", cid, direction);
            self.connection_send_destroy(cid);
            return;
        }

        if conn.is_ready() {
            let keepalive = ConnectionMessage::Keepalive { cid, direction };
            let refresh = self.config.refresh_connection_time();
            self.queue_message(cid, direction, keepalive, None);
            self.schedule_maintenance(cid, direction, refresh);
            return;
        }

        conn.create_factor = (conn.create_factor * 2).min(MAX_CREATE_FACTOR);
        let delay = self.config.create_connection_time() * conn.create_factor;
        let message = match direction {
            Direction::Fwd => ConnectionMessage::Create {
                cid,
                path: conn.path.peers().to_vec(),
            },
            Direction::Bck => ConnectionMessage::Ack { cid },
        };
        debug!("Retrying {} on {}, next in {:?}", message.kind(), cid, delay);
        self.queue_message(cid, direction, message, None);
        self.schedule_maintenance(cid, direction, delay);
    }

    pub(crate) fn handle_connection_broken(&mut self, from: PeerId, cid: ConnectionId, peer1: PeerId, peer2: PeerId) {
        self.prune_paths(peer1, peer2);
        let Some(travel) = self.inbound_direction(from, cid, "CONNECTION_BROKEN") else {
            return;
        };
        let terminal = self.connections.get(&cid).map_or(true, |c| c.is_terminal(travel));
        info!("Connection {} broken between {} and {}", cid, peer1, peer2);
        if terminal {
            self.connection_destroy(cid);
        } else {
            let broken = ConnectionMessage::Broken { cid, peer1, peer2 };
            self.queue_message(cid, travel, broken, None);
            self.connection_mark_draining(cid);
        }
    }

    pub(crate) fn handle_connection_destroy(&mut self, from: PeerId, cid: ConnectionId) {
        let Some(travel) = self.inbound_direction(from, cid, "CONNECTION_DESTROY") else {
            return;
        };
        let Some(conn) = self.connections.get(&cid) else {
            return;
        };
        if conn.is_terminal(travel) {
            debug!("Connection {} destroyed by {}", cid, from);
            self.connection_destroy(cid);
        } else if !conn.is_draining() {
            self.queue_message(cid, travel, ConnectionMessage::Destroy { cid }, None);
            self.connection_mark_draining(cid);
        }
    }

    /// Tell every remaining hop to tear the connection down, then drain
    pub(crate) fn connection_send_destroy(&mut self, cid: ConnectionId) {
        let Some(conn) = self.connections.get(&cid) else {
            return;
        };
        if conn.is_draining() {
            return;
        }
        let targets: Vec<Direction> = [Direction::Fwd, Direction::Bck]
            .into_iter()
            .filter(|d| !conn.is_terminal(*d))
            .collect();
        for direction in targets {
            self.queue_message(cid, direction, ConnectionMessage::Destroy { cid }, None);
        }
        self.connection_mark_draining(cid);
    }

    /// Adjacency to `neighbor` is gone: tell the other side, or destroy
    pub(crate) fn connection_notify_broken(&mut self, cid: ConnectionId, neighbor: PeerId) {
        let Some(conn) = self.connections.get(&cid) else {
            return;
        };
        let toward = if conn.own_pos > 0 && conn.prev_hop() == neighbor {
            Direction::Bck
        } else {
            Direction::Fwd
        };
        let away = toward.reverse();
        if conn.is_terminal(away) {
            self.connection_destroy(cid);
            return;
        }
        let broken = ConnectionMessage::Broken {
            cid,
            peer1: self.my_id,
            peer2: neighbor,
        };
        self.queue_message(cid, away, broken, None);
        self.connection_mark_draining(cid);
    }

    /// Refuse new work; free once every queued message has left
    pub(crate) fn connection_mark_draining(&mut self, cid: ConnectionId) {
        self.cancel_connection_timers(cid);
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        conn.lifecycle = Lifecycle::Draining;
        let idle = conn.pending == 0;
        let tunnel = conn.tunnel.take();
        if let Some(peer) = tunnel {
            self.tunnel_remove_connection(peer, cid);
        }
        if idle {
            self.connection_destroy(cid);
        }
    }

    /// Free a connection now. Safe to call twice.
    pub(crate) fn connection_destroy(&mut self, cid: ConnectionId) {
        self.cancel_connection_timers(cid);
        let Some(conn) = self.connections.remove(&cid) else {
            return;
        };
        self.purge_queued(cid, &[conn.prev_hop(), conn.next_hop()]);
        self.stats.connections_destroyed += 1;
        debug!("Connection {} freed", cid);
        if let Some(peer) = conn.tunnel {
            self.tunnel_remove_connection(peer, cid);
        }
    }
}
