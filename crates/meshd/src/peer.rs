//! Peer records: known paths and the outgoing queue of each neighbor

use crate::mesh::Mesh;
use crate::path::Path;
use crate::timers::TimerEvent;
use mesh_core::{ChannelNumber, ConnectionId, ConnectionMessage, Direction, PeerId};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Neighbor transport: told when a neighbor has something to send
pub trait NeighborSink: Send {
    /// The driver should call [`Mesh::transmit_ready`] for `peer` until it returns `None`
    fn notify_transmit_ready(&mut self, peer: PeerId);
}

/// Identifies the channel data a queued frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTag {
    pub peer: PeerId,
    pub gid: ChannelNumber,
    /// Sending direction of the channel end
    pub direction: Direction,
    pub mid: u32,
}

/// A message waiting for its neighbor
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: ConnectionMessage,
    pub cid: ConnectionId,
    /// Direction the message travels along its connection
    pub direction: Direction,
    pub data: Option<DataTag>,
}

/// A path with the cost it was ranked at
#[derive(Debug, Clone)]
pub struct RankedPath {
    pub cost: u32,
    pub path: Arc<Path>,
}

/// Everything known about one remote peer
#[derive(Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Paths from us to this peer, cheapest first
    pub paths: Vec<RankedPath>,
    /// Messages for this neighbor, consumed by [`Mesh::transmit_ready`]
    pub queue: VecDeque<QueuedMessage>,
    pub connected: bool,
    pub search_active: bool,
    pub transmit_requested: bool,
}

impl PeerRecord {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            paths: Vec::new(),
            queue: VecDeque::new(),
            connected: false,
            search_active: false,
            transmit_requested: false,
        }
    }

    /// Insert a path keeping cost order; false if already known
    pub fn add_path(&mut self, path: Arc<Path>, cost: u32) -> bool {
        if self.paths.iter().any(|p| p.path.digest() == path.digest()) {
            return false;
        }
        let pos = self.paths.partition_point(|p| p.cost <= cost);
        self.paths.insert(pos, RankedPath { cost, path });
        true
    }

    /// Drop every path using the adjacency `a`-`b`
    pub fn remove_paths_using(&mut self, a: &PeerId, b: &PeerId) -> usize {
        let before = self.paths.len();
        self.paths.retain(|p| !p.path.uses_link(a, b));
        before - self.paths.len()
    }

    fn is_idle(&self) -> bool {
        !self.connected && !self.search_active && self.paths.is_empty() && self.queue.is_empty()
    }
}

impl Mesh {
    pub(crate) fn peer_record(&mut self, peer: PeerId) -> &mut PeerRecord {
        self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer))
    }

    pub(crate) fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map_or(false, |r| r.connected)
    }

    /// A neighbor link came up
    pub fn handle_neighbor_connected(&mut self, neighbor: PeerId, now: Instant) {
        self.now = now;
        if neighbor == self.my_id {
            return;
        }
        info!("Neighbor {} connected", neighbor);
        self.peer_record(neighbor).connected = true;
        if let Ok(path) = Path::new(vec![self.my_id, neighbor]) {
            self.add_path(neighbor, path);
        }
        let waiting: Vec<PeerId> = self
            .tunnels
            .values()
            .filter(|t| !t.loopback && !t.is_ready_state())
            .map(|t| t.peer)
            .collect();
        for peer in waiting {
            self.tunnel_ensure_connections(peer);
        }
    }

    /// A neighbor link went down
    pub fn handle_neighbor_disconnected(&mut self, neighbor: PeerId, now: Instant) {
        self.now = now;
        let Some(record) = self.peers.get_mut(&neighbor) else {
            return;
        };
        if !record.connected {
            return;
        }
        info!("Neighbor {} disconnected", neighbor);
        record.connected = false;
        record.transmit_requested = false;
        let dropped = mem::take(&mut record.queue);
        for queued in dropped {
            self.forget_queued(&queued);
        }

        self.prune_paths(self.my_id, neighbor);

        let affected: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.has_neighbor(&neighbor))
            .map(|c| c.id)
            .collect();
        for cid in affected {
            self.connection_notify_broken(cid, neighbor);
        }
        self.gc_peer(neighbor);
    }

    /// Discovery found a path to `peer`
    pub fn handle_path_found(&mut self, peer: PeerId, peers: Vec<PeerId>, now: Instant) {
        self.now = now;
        let Some(path) = Path::from_discovery(self.my_id, peer, peers) else {
            debug!("Ignoring unusable path to {}", peer);
            return;
        };
        if self.add_path(peer, path) && self.tunnels.contains_key(&peer) {
            self.tunnel_ensure_connections(peer);
        }
    }

    /// Rank and store a path; false if it was already known
    pub(crate) fn add_path(&mut self, peer: PeerId, path: Arc<Path>) -> bool {
        let cost = {
            let used = self
                .tunnels
                .get(&peer)
                .map(|t| t.connections.as_slice())
                .unwrap_or(&[])
                .iter()
                .filter_map(|cid| self.connections.get(cid))
                .map(|c| c.path.as_ref());
            path.cost(used)
        };
        let added = self.peer_record(peer).add_path(path.clone(), cost);
        if added {
            debug!("Path to {} ({} hops, cost {})", peer, path.len() - 1, cost);
        }
        added
    }

    /// Forget every path using the adjacency `a`-`b`
    pub(crate) fn prune_paths(&mut self, a: PeerId, b: PeerId) {
        let mut pruned = 0;
        for record in self.peers.values_mut() {
            pruned += record.remove_paths_using(&a, &b);
        }
        if pruned > 0 {
            debug!("Pruned {} paths using {}-{}", pruned, a, b);
        }
    }

    pub(crate) fn gc_peer(&mut self, peer: PeerId) {
        let idle = self.peers.get(&peer).map_or(false, |r| r.is_idle());
        if idle && !self.tunnels.contains_key(&peer) {
            self.peers.remove(&peer);
        }
    }

    pub(crate) fn request_transmit(&mut self, neighbor: PeerId) {
        let Some(record) = self.peers.get_mut(&neighbor) else {
            return;
        };
        if record.connected && !record.transmit_requested {
            record.transmit_requested = true;
            self.sink.notify_transmit_ready(neighbor);
        }
    }

    /// Queue `message` on connection `cid`, travelling `direction`.
    ///
    /// Flow-control messages jump the queue and replace an older one of the
    /// same kind. Payload frames get the next packet id and are dropped when
    /// the link queue is full.
    pub(crate) fn queue_message(
        &mut self,
        cid: ConnectionId,
        direction: Direction,
        mut message: ConnectionMessage,
        data: Option<DataTag>,
    ) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            debug!("Not queueing {} on unknown connection {}", message.kind(), cid);
            return;
        };
        let hop = conn.hop(direction);
        if !self.peers.get(&hop).map_or(false, |r| r.connected) {
            debug!("Neighbor {} not connected, dropping {} on {}", hop, message.kind(), cid);
            return;
        }

        let fc = conn.fc_mut(direction);
        let mut start_poll = false;
        if message.is_flow_control() {
            let kind = mem::discriminant(&message);
            let record = self.peer_record(hop);
            let before = record.queue.len();
            record.queue.retain(|q| {
                !(q.cid == cid && q.direction == direction && mem::discriminant(&q.message) == kind)
            });
            let replaced = (before - record.queue.len()) as u32;
            record.queue.push_front(QueuedMessage {
                message,
                cid,
                direction,
                data,
            });
            if let Some(conn) = self.connections.get_mut(&cid) {
                conn.pending = (conn.pending + 1).saturating_sub(replaced);
            }
        } else {
            if message.is_payload() {
                if fc.is_full() {
                    self.stats.dropped_buffer_full += 1;
                    debug!("Queue to {} full ({}/{}), dropping {}", hop, fc.queue_n, fc.queue_max, message.kind());
                    return;
                }
                let pid = fc.assign_pid();
                if let ConnectionMessage::Fwd(frame) | ConnectionMessage::Bck(frame) = &mut message {
                    frame.pid = pid;
                }
                start_poll = !fc.can_send(pid) && fc.poll_timer.is_none();
            }
            fc.queue_n += 1;
            conn.pending += 1;
            self.peer_record(hop).queue.push_back(QueuedMessage {
                message,
                cid,
                direction,
                data,
            });
        }

        if start_poll {
            self.schedule_poll(cid, direction);
        }
        self.request_transmit(hop);
    }

    /// Next message for `neighbor`, or `None` once nothing is sendable
    pub fn transmit_ready(&mut self, neighbor: PeerId, now: Instant) -> Option<ConnectionMessage> {
        self.now = now;
        loop {
            let connections = &self.connections;
            let record = self.peers.get_mut(&neighbor)?;
            let pos = record.queue.iter().position(|q| match &q.message {
                ConnectionMessage::Fwd(frame) | ConnectionMessage::Bck(frame) => connections
                    .get(&q.cid)
                    .map_or(true, |c| c.fc(q.direction).can_send(frame.pid)),
                _ => true,
            });
            let Some(queued) = pos.and_then(|pos| record.queue.remove(pos)) else {
                record.transmit_requested = false;
                return None;
            };

            let drop_percent = self.config.drop_percent;
            let message = self.message_sent(queued);
            if drop_percent > 0 && rand::thread_rng().gen_range(0..100u8) < drop_percent {
                self.stats.dropped_testing += 1;
                debug!("Testing drop of {} to {}", message.kind(), neighbor);
                continue;
            }
            debug!("-> {} to {} on {}", message.kind(), neighbor, message.cid());
            return Some(message);
        }
    }

    /// Bookkeeping for a message leaving the queue
    fn message_sent(&mut self, queued: QueuedMessage) -> ConnectionMessage {
        let QueuedMessage {
            message,
            cid,
            direction,
            data,
        } = queued;

        let Some(conn) = self.connections.get_mut(&cid) else {
            return message;
        };
        conn.pending = conn.pending.saturating_sub(1);
        let fc = conn.fc_mut(direction);
        if !message.is_flow_control() {
            fc.queue_n = fc.queue_n.saturating_sub(1);
        }
        let mut payload = false;
        if let ConnectionMessage::Fwd(frame) | ConnectionMessage::Bck(frame) = &message {
            fc.last_pid_sent = frame.pid;
            payload = true;
        }
        if matches!(message, ConnectionMessage::Create { .. }) {
            conn.mark_create_sent();
        }
        let origin = conn.is_origin(direction);
        let tunnel = conn.tunnel;
        let drained = conn.is_draining() && conn.pending == 0;

        if drained {
            self.connection_destroy(cid);
        } else if payload {
            if origin {
                if let Some(peer) = tunnel {
                    self.tunnel_send_queued(peer);
                    self.tunnel_unchoke_channels(peer);
                }
            } else {
                self.connection_send_ack(cid, direction, false);
            }
        }
        if let Some(peer) = tunnel {
            self.tunnel_try_finalize(peer);
        }
        if let Some(tag) = data {
            self.channel_message_sent(tag);
        }
        message
    }

    /// Undo the accounting of a message that will never be sent
    pub(crate) fn forget_queued(&mut self, queued: &QueuedMessage) {
        if let Some(conn) = self.connections.get_mut(&queued.cid) {
            conn.pending = conn.pending.saturating_sub(1);
            if !queued.message.is_flow_control() {
                let fc = conn.fc_mut(queued.direction);
                fc.queue_n = fc.queue_n.saturating_sub(1);
            }
        }
    }

    /// Remove every queued message of `cid` from the queues of `neighbors`
    pub(crate) fn purge_queued(&mut self, cid: ConnectionId, neighbors: &[PeerId]) {
        for neighbor in neighbors {
            if let Some(record) = self.peers.get_mut(neighbor) {
                record.queue.retain(|q| q.cid != cid);
            }
        }
    }

    /// Is the frame carrying `tag` still waiting in a neighbor queue?
    pub(crate) fn is_data_queued(&self, tag: &DataTag) -> bool {
        self.peers
            .values()
            .any(|r| r.queue.iter().any(|q| q.data.as_ref() == Some(tag)))
    }

    /// Does any blocked payload of `cid` wait to travel `direction`?
    pub(crate) fn has_queued_payload(&self, cid: ConnectionId, direction: Direction) -> bool {
        let Some(conn) = self.connections.get(&cid) else {
            return false;
        };
        self.peers.get(&conn.hop(direction)).map_or(false, |r| {
            r.queue
                .iter()
                .any(|q| q.cid == cid && q.direction == direction && q.message.is_payload())
        })
    }

    pub(crate) fn schedule_poll(&mut self, cid: ConnectionId, direction: Direction) {
        let Some(conn) = self.connections.get_mut(&cid) else {
            return;
        };
        let fc = conn.fc_mut(direction);
        let at = self.now + fc.poll_time;
        fc.poll_timer = Some(self.timers.schedule(at, TimerEvent::Poll { cid, direction }));
    }

    /// Neighbors currently known to be connected
    pub fn neighbors(&self) -> HashSet<PeerId> {
        self.peers
            .values()
            .filter(|r| r.connected)
            .map(|r| r.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    #[test]
    fn test_paths_sorted_by_cost_and_deduplicated() {
        let mut record = PeerRecord::new(peer(9));
        let long = Path::new(vec![peer(1), peer(2), peer(3), peer(9)]).unwrap();
        let short = Path::new(vec![peer(1), peer(9)]).unwrap();

        assert!(record.add_path(long.clone(), 400));
        assert!(record.add_path(short.clone(), 200));
        assert!(!record.add_path(short, 200));

        assert_eq!(record.paths.len(), 2);
        assert_eq!(record.paths[0].path.len(), 2);
        assert_eq!(record.paths[1].path.len(), 4);
    }

    #[test]
    fn test_remove_paths_using_adjacency() {
        let mut record = PeerRecord::new(peer(9));
        record.add_path(Path::new(vec![peer(1), peer(2), peer(9)]).unwrap(), 300);
        record.add_path(Path::new(vec![peer(1), peer(3), peer(9)]).unwrap(), 300);

        assert_eq!(record.remove_paths_using(&peer(9), &peer(2)), 1);
        assert_eq!(record.paths.len(), 1);
        assert_eq!(record.paths[0].path.peers()[1], peer(3));
    }

    #[test]
    fn test_idle_record() {
        let mut record = PeerRecord::new(peer(9));
        assert!(record.is_idle());
        record.connected = true;
        assert!(!record.is_idle());
    }
}
