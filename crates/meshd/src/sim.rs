//! In-memory network of mesh engines for end-to-end tests
//!
//! Every node runs a real [`Mesh`] with recording collaborators. Links are
//! synchronous and lose only what the installed filter rejects; time only
//! moves through [`SimNetwork::advance`].

use crate::config::MeshConfig;
use crate::discovery::{DiscoveryRequest, PathDiscovery};
use crate::local::{ClientId, LocalClient};
use crate::mesh::Mesh;
use crate::peer::NeighborSink;
use mesh_core::{ChannelNumber, ChannelOptions, ConnectionMessage, PeerId, Port};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_ROUNDS: usize = 10_000;

/// Decides whether a message from node `.0` to node `.1` is lost
pub type LossFilter = Box<dyn FnMut(usize, usize, &ConnectionMessage) -> bool>;

/// Everything a node's local clients were told
#[derive(Debug, Default)]
pub struct ClientLog {
    pub created: Vec<(ClientId, ChannelNumber, Port, PeerId)>,
    pub destroyed: Vec<(ClientId, ChannelNumber)>,
    pub delivered: Vec<(ClientId, ChannelNumber, Vec<u8>)>,
    pub send_acks: Vec<(ClientId, ChannelNumber)>,
}

struct RecordingClient(Arc<Mutex<ClientLog>>);

impl LocalClient for RecordingClient {
    fn notify_channel_created(
        &mut self,
        client: ClientId,
        lid: ChannelNumber,
        port: Port,
        origin: PeerId,
        _options: ChannelOptions,
    ) {
        self.0.lock().created.push((client, lid, port, origin));
    }

    fn notify_channel_destroyed(&mut self, client: ClientId, lid: ChannelNumber) {
        self.0.lock().destroyed.push((client, lid));
    }

    fn deliver_data(&mut self, client: ClientId, lid: ChannelNumber, payload: Vec<u8>) {
        self.0.lock().delivered.push((client, lid, payload));
    }

    fn notify_send_ack(&mut self, client: ClientId, lid: ChannelNumber) {
        self.0.lock().send_acks.push((client, lid));
    }
}

struct RecordingSink(Arc<Mutex<Vec<PeerId>>>);

impl NeighborSink for RecordingSink {
    fn notify_transmit_ready(&mut self, peer: PeerId) {
        self.0.lock().push(peer);
    }
}

struct RecordingDiscovery(Arc<Mutex<Vec<DiscoveryRequest>>>);

impl PathDiscovery for RecordingDiscovery {
    fn start_search(&mut self, peer: PeerId) {
        self.0.lock().push(DiscoveryRequest::Start(peer));
    }

    fn stop_search(&mut self, peer: PeerId) {
        self.0.lock().push(DiscoveryRequest::Stop(peer));
    }
}

pub struct SimNode {
    pub mesh: Mesh,
    pub log: Arc<Mutex<ClientLog>>,
    pub searches: Arc<Mutex<Vec<DiscoveryRequest>>>,
    ready: Arc<Mutex<Vec<PeerId>>>,
}

pub struct SimNetwork {
    pub nodes: Vec<SimNode>,
    pub now: Instant,
    links: HashSet<(usize, usize)>,
    filter: Option<LossFilter>,
}

impl SimNetwork {
    /// `count` nodes with ascending ids
    pub fn new(count: usize) -> Self {
        Self::with_config(count, MeshConfig::default())
    }

    pub fn with_config(count: usize, config: MeshConfig) -> Self {
        let now = Instant::now();
        let nodes = (0..count)
            .map(|i| {
                let log = Arc::new(Mutex::new(ClientLog::default()));
                let searches = Arc::new(Mutex::new(Vec::new()));
                let ready = Arc::new(Mutex::new(Vec::new()));
                let mesh = Mesh::new(
                    Self::peer_id(i),
                    config.clone(),
                    Box::new(RecordingSink(ready.clone())),
                    Box::new(RecordingDiscovery(searches.clone())),
                    Box::new(RecordingClient(log.clone())),
                    now,
                );
                SimNode {
                    mesh,
                    log,
                    searches,
                    ready,
                }
            })
            .collect();
        Self {
            nodes,
            now,
            links: HashSet::new(),
            filter: None,
        }
    }

    pub fn peer_id(index: usize) -> PeerId {
        PeerId([index as u8 + 1; 32])
    }

    pub fn id(&self, index: usize) -> PeerId {
        Self::peer_id(index)
    }

    fn index_of(&self, peer: &PeerId) -> Option<usize> {
        (0..self.nodes.len()).find(|i| Self::peer_id(*i) == *peer)
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }

    pub fn link(&mut self, a: usize, b: usize) {
        self.links.insert((a.min(b), a.max(b)));
        let now = self.now;
        self.nodes[a].mesh.handle_neighbor_connected(Self::peer_id(b), now);
        self.nodes[b].mesh.handle_neighbor_connected(Self::peer_id(a), now);
    }

    pub fn unlink(&mut self, a: usize, b: usize) {
        self.links.remove(&(a.min(b), a.max(b)));
        let now = self.now;
        self.nodes[a].mesh.handle_neighbor_disconnected(Self::peer_id(b), now);
        self.nodes[b].mesh.handle_neighbor_disconnected(Self::peer_id(a), now);
    }

    /// Lose every message for which `filter` returns true
    pub fn set_filter(&mut self, filter: impl FnMut(usize, usize, &ConnectionMessage) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    fn lost(&mut self, from: usize, to: usize, message: &ConnectionMessage) -> bool {
        self.filter.as_mut().map_or(false, |filter| filter(from, to, message))
    }

    /// Move messages until no node has anything left to send
    pub fn run_until_idle(&mut self) {
        let now = self.now;
        for _ in 0..MAX_ROUNDS {
            let mut moved = false;
            for i in 0..self.nodes.len() {
                let ready = mem::take(&mut *self.nodes[i].ready.lock());
                for neighbor in ready {
                    while let Some(message) = self.nodes[i].mesh.transmit_ready(neighbor, now) {
                        moved = true;
                        let Some(j) = self.index_of(&neighbor) else {
                            continue;
                        };
                        if self.linked(i, j) && !self.lost(i, j, &message) {
                            self.nodes[j].mesh.handle_message(Self::peer_id(i), message, now);
                        }
                    }
                }
            }
            if !moved {
                return;
            }
        }
        panic!("network did not settle");
    }

    /// Let time pass, fire due timers and settle
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for node in &mut self.nodes {
            node.mesh.handle_timeouts(now);
        }
        self.run_until_idle();
    }

    /// Keep acking `lid` until the client has taken everything buffered
    pub fn drain_client(&mut self, node: usize, client: ClientId, lid: ChannelNumber) {
        let now = self.now;
        loop {
            let before = self.nodes[node].log.lock().delivered.len();
            self.nodes[node].mesh.ack(client, lid, now).unwrap();
            self.run_until_idle();
            if self.nodes[node].log.lock().delivered.len() == before {
                return;
            }
        }
    }

    pub fn payloads(&self, node: usize) -> Vec<Vec<u8>> {
        self.nodes[node]
            .log
            .lock()
            .delivered
            .iter()
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::flow::INITIAL_POLL_TIME;
    use crate::tunnel::{TunnelState, GID_SIDE_BIT};
    use mesh_core::{ChannelMessage, Direction};

    const A: usize = 0;
    const M: usize = 1;
    const P: usize = 2;

    /// A reaches P through M; P listens on port 7
    fn relayed_channel(net: &mut SimNetwork) -> (ClientId, ChannelNumber, ClientId, ChannelNumber) {
        net.link(A, M);
        net.link(M, P);
        let now = net.now;
        let listener = net.nodes[P].mesh.connect_client();
        net.nodes[P].mesh.open_port(listener, 7).unwrap();
        let client = net.nodes[A].mesh.connect_client();
        let p = net.id(P);
        let lid = net.nodes[A]
            .mesh
            .create_channel(client, p, 7, ChannelOptions::reliable(), now)
            .unwrap();
        assert!(net.nodes[A].searches.lock().contains(&DiscoveryRequest::Start(p)));
        assert_eq!(net.nodes[A].mesh.tunnel_state(&p), Some(TunnelState::Searching));

        let path = vec![net.id(A), net.id(M), p];
        net.nodes[A].mesh.handle_path_found(p, path, now);
        net.run_until_idle();

        let created = net.nodes[P].log.lock().created.clone();
        assert_eq!(created.len(), 1);
        let (owner, remote_lid, port, origin) = created[0];
        assert_eq!((owner, port, origin), (listener, 7, net.id(A)));
        assert!(remote_lid.is_service_local());
        (client, lid, listener, remote_lid)
    }

    /// Node 0 opens a reliable channel to port 7 at node 1; nothing moves yet
    fn direct_channel(net: &mut SimNetwork) -> (ClientId, ChannelNumber, ClientId) {
        net.link(0, 1);
        let now = net.now;
        let peer = net.id(1);
        let listener = net.nodes[1].mesh.connect_client();
        net.nodes[1].mesh.open_port(listener, 7).unwrap();
        let client = net.nodes[0].mesh.connect_client();
        let lid = net.nodes[0]
            .mesh
            .create_channel(client, peer, 7, ChannelOptions::reliable(), now)
            .unwrap();
        (client, lid, listener)
    }

    fn is_kx(message: &ConnectionMessage) -> bool {
        matches!(message, ConnectionMessage::Kx { .. })
    }

    #[test]
    fn test_end_to_end_relayed_reliable() {
        let mut net = SimNetwork::new(3);
        let (client, lid, listener, remote_lid) = relayed_channel(&mut net);
        let p = net.id(P);
        assert_eq!(net.nodes[A].mesh.tunnel_state(&p), Some(TunnelState::Ready));
        assert!(net.nodes[A].log.lock().send_acks.contains(&(client, lid)));

        let now = net.now;
        for payload in [b"x", b"y", b"z"] {
            net.nodes[A].mesh.send(client, lid, payload.to_vec(), now).unwrap();
            net.run_until_idle();
        }
        net.drain_client(P, listener, remote_lid);

        assert_eq!(net.payloads(P), vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
        assert_eq!(net.nodes[A].mesh.unacked(client, lid), Ok(0));
        assert!(net.nodes[M].mesh.stats().messages_forwarded >= 3);
        assert_eq!(net.nodes[M].mesh.tunnel_count(), 0);
    }

    #[test]
    fn test_send_buffered_across_reconnect() {
        let mut net = SimNetwork::new(3);
        let (client, lid, listener, remote_lid) = relayed_channel(&mut net);
        let p = net.id(P);
        let now = net.now;
        net.nodes[A].mesh.send(client, lid, b"before".to_vec(), now).unwrap();
        net.run_until_idle();
        net.drain_client(P, listener, remote_lid);

        net.unlink(M, P);
        net.run_until_idle();
        assert_eq!(net.nodes[A].mesh.tunnel_state(&p), Some(TunnelState::Reconnecting));
        assert!(net.nodes[A].mesh.paths_to(&p).is_empty());

        net.nodes[A].mesh.send(client, lid, b"after".to_vec(), now).unwrap();
        net.run_until_idle();
        assert_eq!(net.payloads(P), vec![b"before".to_vec()]);

        net.link(M, P);
        let path = vec![net.id(A), net.id(M), p];
        net.nodes[A].mesh.handle_path_found(p, path, now);
        net.run_until_idle();
        net.drain_client(P, listener, remote_lid);

        assert_eq!(net.payloads(P), vec![b"before".to_vec(), b"after".to_vec()]);
        assert_eq!(net.nodes[A].mesh.unacked(client, lid), Ok(0));
    }

    #[test]
    fn test_send_before_confirmation_refused() {
        let mut net = SimNetwork::new(2);
        let now = net.now;
        let peer = net.id(1);
        let client = net.nodes[A].mesh.connect_client();
        let lid = net.nodes[A]
            .mesh
            .create_channel(client, peer, 7, ChannelOptions::reliable(), now)
            .unwrap();
        assert_eq!(
            net.nodes[A].mesh.send(client, lid, b"early".to_vec(), now),
            Err(MeshError::NotAllowed(lid))
        );
    }

    #[test]
    fn test_destroy_twice_notifies_once() {
        let mut net = SimNetwork::new(2);
        net.link(0, 1);
        let now = net.now;
        let peer = net.id(1);
        let listener = net.nodes[1].mesh.connect_client();
        net.nodes[1].mesh.open_port(listener, 7).unwrap();
        let client = net.nodes[0].mesh.connect_client();
        let lid = net.nodes[0]
            .mesh
            .create_channel(client, peer, 7, ChannelOptions::unreliable(), now)
            .unwrap();
        net.run_until_idle();
        assert_eq!(net.nodes[1].log.lock().created.len(), 1);

        net.nodes[0].mesh.destroy_channel(client, lid, now).unwrap();
        assert_eq!(
            net.nodes[0].mesh.destroy_channel(client, lid, now),
            Err(MeshError::UnknownChannel(lid))
        );
        net.run_until_idle();
        net.nodes[0].mesh.disconnect_client(client, now).unwrap();
        net.nodes[1].mesh.disconnect_client(listener, now).unwrap();
        net.run_until_idle();

        assert_eq!(net.nodes[1].log.lock().destroyed.len(), 1);
        assert!(net.nodes[0].log.lock().destroyed.is_empty());
        for node in &net.nodes {
            assert_eq!(node.mesh.tunnel_count(), 0);
            assert_eq!(node.mesh.connection_count(), 0);
        }
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut net = SimNetwork::new(2);
        net.link(0, 1);
        let now = net.now;
        let peer = net.id(1);
        let client = net.nodes[0].mesh.connect_client();
        let lid = net.nodes[0]
            .mesh
            .create_channel(client, peer, 99, ChannelOptions::reliable(), now)
            .unwrap();
        net.run_until_idle();

        assert_eq!(net.nodes[0].log.lock().destroyed, vec![(client, lid)]);
        assert_eq!(
            net.nodes[0].mesh.channel_state(client, lid),
            Err(MeshError::UnknownChannel(lid))
        );
        assert_eq!(net.nodes[0].mesh.tunnel_count(), 0);
    }

    #[test]
    fn test_loopback_channel() {
        let mut net = SimNetwork::new(1);
        let now = net.now;
        let me = net.id(0);
        let listener = net.nodes[0].mesh.connect_client();
        net.nodes[0].mesh.open_port(listener, 9).unwrap();
        let client = net.nodes[0].mesh.connect_client();
        let lid = net.nodes[0]
            .mesh
            .create_channel(client, me, 9, ChannelOptions::reliable(), now)
            .unwrap();

        let (_, remote_lid, _, origin) = net.nodes[0].log.lock().created[0];
        assert_eq!(origin, me);
        net.nodes[0].mesh.send(client, lid, b"hello".to_vec(), now).unwrap();
        assert_eq!(net.payloads(0), vec![b"hello".to_vec()]);
        assert_eq!(net.nodes[0].mesh.unacked(client, lid), Ok(0));

        net.nodes[0].mesh.destroy_channel(listener, remote_lid, now).unwrap();
        assert_eq!(net.nodes[0].log.lock().destroyed, vec![(client, lid)]);
        assert_eq!(net.nodes[0].mesh.tunnel_count(), 0);
    }

    #[test]
    fn test_lost_data_is_retransmitted() {
        let mut net = SimNetwork::new(2);
        net.link(0, 1);
        let now = net.now;
        let peer = net.id(1);
        let listener = net.nodes[1].mesh.connect_client();
        net.nodes[1].mesh.open_port(listener, 7).unwrap();
        let client = net.nodes[0].mesh.connect_client();
        let lid = net.nodes[0]
            .mesh
            .create_channel(client, peer, 7, ChannelOptions::reliable(), now)
            .unwrap();
        net.run_until_idle();

        // The frame leaves while the link is down and is lost
        net.links.clear();
        net.nodes[0].mesh.send(client, lid, b"again".to_vec(), now).unwrap();
        net.run_until_idle();
        assert!(net.payloads(1).is_empty());
        assert_eq!(net.nodes[0].mesh.unacked(client, lid), Ok(1));

        net.links.insert((0, 1));
        net.advance(Duration::from_secs(2));
        assert_eq!(net.payloads(1), vec![b"again".to_vec()]);
        assert_eq!(net.nodes[0].mesh.unacked(client, lid), Ok(0));
        assert!(net.nodes[0].mesh.stats().data_retransmitted >= 1);
    }

    #[test]
    fn test_lost_kx_answered_on_request() {
        let mut net = SimNetwork::new(2);
        let mut dropped = false;
        net.set_filter(move |from, _, message| {
            let lose = from == 0 && !dropped && is_kx(message);
            dropped |= lose;
            lose
        });
        let (client, lid, _) = direct_channel(&mut net);
        net.run_until_idle();

        assert_eq!(net.nodes[1].log.lock().created.len(), 1);
        assert_eq!(net.nodes[1].mesh.stats().protocol_violations, 0);
        let now = net.now;
        net.nodes[0].mesh.send(client, lid, b"keyed".to_vec(), now).unwrap();
        net.run_until_idle();
        assert_eq!(net.payloads(1), vec![b"keyed".to_vec()]);
    }

    #[test]
    fn test_kx_retried_until_answered() {
        let mut net = SimNetwork::new(2);
        let mut lost = [false; 2];
        net.set_filter(move |from, _, message| {
            if !is_kx(message) || lost[from] {
                return false;
            }
            lost[from] = true;
            true
        });
        direct_channel(&mut net);
        net.run_until_idle();
        let peer = net.id(1);
        assert!(net.nodes[1].log.lock().created.is_empty());
        assert_ne!(net.nodes[0].mesh.tunnel_state(&peer), Some(TunnelState::Ready));

        let retry = net.nodes[0].mesh.config().create_connection_time();
        for _ in 0..3 {
            net.advance(retry);
        }
        assert_eq!(net.nodes[0].mesh.tunnel_state(&peer), Some(TunnelState::Ready));
        assert_eq!(net.nodes[1].log.lock().created.len(), 1);
        for node in &net.nodes {
            assert_eq!(node.mesh.stats().protocol_violations, 0);
        }
    }

    #[test]
    fn test_create_with_our_channel_number_rejected() {
        let mut net = SimNetwork::new(2);
        let (client, lid, _) = direct_channel(&mut net);
        let local = net.nodes[0].mesh.connect_client();
        net.nodes[0].mesh.open_port(local, 7).unwrap();
        net.run_until_idle();
        let gid = net.nodes[0].mesh.clients.channel(client, lid).unwrap().gid;

        let me = net.id(0);
        for chid in [gid, ChannelNumber(GID_SIDE_BIT | 0x77)] {
            let create = ChannelMessage::Create {
                chid,
                port: 7,
                options: ChannelOptions::reliable(),
            };
            net.nodes[1].mesh.tunnel_send(me, create, Direction::Fwd, None);
        }
        net.run_until_idle();

        assert_eq!(net.nodes[0].mesh.stats().protocol_violations, 2);
        assert!(net.nodes[0].log.lock().created.is_empty());
        let channel = &net.nodes[0].mesh.tunnels[&net.id(1)].channels[&gid];
        assert!(channel.root.is_some());
        assert!(channel.dest.is_none());
    }

    #[test]
    fn test_lost_credit_recovered_by_poll() {
        let mut net = SimNetwork::new(2);
        let mut dropped = false;
        net.set_filter(move |from, _, message| {
            let lose = from == 1 && !dropped && matches!(message, ConnectionMessage::FlowAck { .. });
            dropped |= lose;
            lose
        });
        let (client, lid, _) = direct_channel(&mut net);
        net.run_until_idle();
        assert_eq!(net.nodes[1].log.lock().created.len(), 1);

        let now = net.now;
        net.nodes[0].mesh.send(client, lid, b"late".to_vec(), now).unwrap();
        net.run_until_idle();
        assert!(net.payloads(1).is_empty());

        net.advance(INITIAL_POLL_TIME);
        assert_eq!(net.payloads(1), vec![b"late".to_vec()]);
        assert_eq!(net.nodes[0].mesh.unacked(client, lid), Ok(0));
    }

    #[test]
    fn test_ttl_expiry_drops_and_grants_credit() {
        let config = MeshConfig {
            default_ttl: 0,
            ..MeshConfig::default()
        };
        let mut net = SimNetwork::with_config(3, config);
        net.link(A, M);
        net.link(M, P);
        let now = net.now;
        let p = net.id(P);
        let listener = net.nodes[P].mesh.connect_client();
        net.nodes[P].mesh.open_port(listener, 7).unwrap();
        let client = net.nodes[A].mesh.connect_client();
        net.nodes[A]
            .mesh
            .create_channel(client, p, 7, ChannelOptions::reliable(), now)
            .unwrap();
        let path = vec![net.id(A), net.id(M), p];
        net.nodes[A].mesh.handle_path_found(p, path, now);
        net.run_until_idle();

        assert!(net.nodes[M].mesh.stats().dropped_ttl >= 1);
        assert_eq!(net.nodes[M].mesh.stats().messages_forwarded, 0);
        assert!(net.nodes[P].log.lock().created.is_empty());
        let conn = net.nodes[A].mesh.connections.values().next().unwrap();
        assert!(conn.fc(Direction::Fwd).last_ack_recv > 0);
    }

    #[test]
    fn test_keepalive_holds_idle_relay() {
        let mut net = SimNetwork::new(3);
        relayed_channel(&mut net);
        let cid = *net.nodes[M].mesh.connections.keys().next().unwrap();
        let refresh = net.nodes[M].mesh.config().refresh_connection_time();

        for _ in 0..8 {
            net.advance(refresh);
        }
        assert!(net.nodes[M].mesh.connections.contains_key(&cid));
        for node in &net.nodes {
            assert_eq!(node.mesh.stats().connections_destroyed, 0);
        }
    }

    #[test]
    fn test_relay_times_out_without_keepalives() {
        let mut net = SimNetwork::new(3);
        relayed_channel(&mut net);
        let cid = *net.nodes[M].mesh.connections.keys().next().unwrap();
        let refresh = net.nodes[M].mesh.config().refresh_connection_time();

        net.set_filter(|_, _, message| matches!(message, ConnectionMessage::Keepalive { .. }));
        for _ in 0..5 {
            net.advance(refresh);
        }
        assert!(!net.nodes[M].mesh.connections.contains_key(&cid));
        assert!(net.nodes[M].mesh.stats().connections_destroyed >= 1);
    }

    #[test]
    fn test_destroy_on_draining_tunnel() {
        let mut net = SimNetwork::new(2);
        let (client, first, _) = direct_channel(&mut net);
        net.run_until_idle();
        let now = net.now;
        let peer = net.id(1);

        // CHANNEL_DESTROY is still queued, so the tunnel drains instead of closing
        net.nodes[0].mesh.destroy_channel(client, first, now).unwrap();
        assert!(net.nodes[0].mesh.tunnels[&peer].draining);

        let second = net.nodes[0]
            .mesh
            .create_channel(client, peer, 7, ChannelOptions::reliable(), now)
            .unwrap();
        assert!(!net.nodes[0].mesh.tunnels[&peer].draining);
        net.nodes[0].mesh.destroy_channel(client, second, now).unwrap();
        assert!(net.nodes[0].mesh.tunnels[&peer].draining);
        net.run_until_idle();

        assert!(net.nodes[0].log.lock().destroyed.is_empty());
        assert_eq!(net.nodes[1].log.lock().destroyed.len(), 1);
        for node in &net.nodes {
            assert_eq!(node.mesh.tunnel_count(), 0);
            assert_eq!(node.mesh.connection_count(), 0);
        }
    }

    #[test]
    fn test_destroy_from_both_ends() {
        let mut net = SimNetwork::new(2);
        let (client, lid, listener) = direct_channel(&mut net);
        net.run_until_idle();
        let (_, remote_lid, _, _) = net.nodes[1].log.lock().created[0];
        let now = net.now;

        net.nodes[0].mesh.destroy_channel(client, lid, now).unwrap();
        net.nodes[1].mesh.destroy_channel(listener, remote_lid, now).unwrap();
        net.run_until_idle();

        for node in &net.nodes {
            assert!(node.log.lock().destroyed.is_empty());
            assert_eq!(node.mesh.tunnel_count(), 0);
            assert_eq!(node.mesh.connection_count(), 0);
        }
    }
}
