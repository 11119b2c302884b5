//! Tunnels: the encrypted container towards one destination peer
//!
//! A tunnel owns the channels to its peer, picks a connection for each
//! outgoing channel message, and seals it with the session keys agreed over
//! KX. Channel traffic waits in the tunnel queue until a connection is ready,
//! keys exist and some connection has room.

use crate::channel::Channel;
use crate::connection::Connection;
use crate::mesh::Mesh;
use crate::path::Path;
use crate::peer::DataTag;
use crate::reliability::WINDOW;
use crate::timers::{std_backoff, TimerEvent, TimerId};
use mesh_core::crypto::derive_tunnel_context;
use mesh_core::{
    Bytes32, ChannelMessage, ChannelNumber, ConnectionId, ConnectionMessage, Direction,
    EncryptedFrame, PeerId,
};
use mesh_net::{EphemeralKeyExchange, FrameCipher};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Global channel ids allocated by the peer with the lower id carry this bit
pub const GID_SIDE_BIT: u32 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    New,
    /// Path lookup outstanding
    Searching,
    /// A CREATE or key exchange is outstanding
    Waiting,
    Ready,
    /// Every connection was lost, retrying
    Reconnecting,
}

/// Channel message waiting in a tunnel or loopback queue
#[derive(Debug, Clone)]
pub struct TunnelMessage {
    pub message: ChannelMessage,
    /// Sending direction of the channel end
    pub direction: Direction,
    pub tag: Option<DataTag>,
}

pub struct Tunnel {
    pub peer: PeerId,
    pub state: TunnelState,
    /// Tunnel to ourselves: no connections, no encryption
    pub loopback: bool,
    pub connections: Vec<ConnectionId>,
    pub channels: BTreeMap<ChannelNumber, Channel>,
    pub queue: VecDeque<TunnelMessage>,
    pub draining: bool,
    next_chid: ChannelNumber,
    kx: EphemeralKeyExchange,
    peer_ephemeral: Option<Bytes32>,
    cipher: Option<Box<dyn FrameCipher>>,
    kx_sent_on: HashSet<ConnectionId>,
    /// Resends our KX while we hold no keys
    kx_timer: Option<TimerId>,
    kx_retry_time: Duration,
}

impl Tunnel {
    pub fn new(peer: PeerId, loopback: bool) -> Self {
        Self {
            peer,
            state: if loopback {
                TunnelState::Ready
            } else {
                TunnelState::New
            },
            loopback,
            connections: Vec::new(),
            channels: BTreeMap::new(),
            queue: VecDeque::new(),
            draining: false,
            next_chid: ChannelNumber(0),
            kx: EphemeralKeyExchange::new(),
            peer_ephemeral: None,
            cipher: None,
            kx_sent_on: HashSet::new(),
            kx_timer: None,
            kx_retry_time: Duration::ZERO,
        }
    }

    pub fn is_ready_state(&self) -> bool {
        self.state == TunnelState::Ready
    }

    pub fn has_keys(&self) -> bool {
        self.cipher.is_some()
    }

    /// Next free global channel id, on our side of the id space
    pub fn alloc_chid(&mut self, my_id: &PeerId) -> ChannelNumber {
        loop {
            let mut gid = self.next_chid.0;
            self.next_chid = self.next_chid.next_global();
            if *my_id < self.peer {
                gid |= GID_SIDE_BIT;
            } else {
                gid &= !GID_SIDE_BIT;
            }
            let gid = ChannelNumber(gid);
            if !self.channels.contains_key(&gid) {
                return gid;
            }
        }
    }

    /// Was `gid` allocated on our side of the id space?
    pub fn is_own_chid(&self, my_id: &PeerId, gid: ChannelNumber) -> bool {
        (gid.0 & GID_SIDE_BIT != 0) == (*my_id < self.peer)
    }

    /// Free receive space advertised to the remote end: the best of all local receivers
    pub fn channels_buffer(&self) -> u32 {
        self.channels
            .values()
            .flat_map(|c| c.local_ends())
            .map(|end| WINDOW.saturating_sub(end.rel.recv.len() as u32))
            .max()
            .unwrap_or(WINDOW)
    }
}

impl Mesh {
    pub(crate) fn tunnel_get_or_create(&mut self, peer: PeerId) {
        if self.tunnels.contains_key(&peer) {
            return;
        }
        let loopback = peer == self.my_id;
        self.tunnels.insert(peer, Tunnel::new(peer, loopback));
        if !loopback {
            self.peer_record(peer);
        }
        self.stats.tunnels_created += 1;
        info!("Tunnel to {} created{}", peer, if loopback { " (loopback)" } else { "" });
    }

    fn usable_connections<'a>(&'a self, tunnel: &'a Tunnel) -> impl Iterator<Item = &'a Connection> + 'a {
        tunnel
            .connections
            .iter()
            .filter_map(|cid| self.connections.get(cid))
            .filter(|c| c.is_usable())
    }

    pub(crate) fn tunnel_is_ready(&self, peer: &PeerId) -> bool {
        self.tunnels.get(peer).map_or(false, |t| {
            t.loopback || (t.has_keys() && self.usable_connections(t).next().is_some())
        })
    }

    /// Free slots over every usable connection
    pub(crate) fn tunnel_connections_buffer(&self, peer: &PeerId) -> u32 {
        self.tunnels.get(peer).map_or(0, |t| {
            self.usable_connections(t)
                .map(|c| c.fc(c.send_direction()).buffer_free())
                .sum()
        })
    }

    /// Usable connection with the fewest queued messages; the oldest wins ties
    fn tunnel_select_connection(&self, peer: &PeerId) -> Option<ConnectionId> {
        let tunnel = self.tunnels.get(peer)?;
        self.usable_connections(tunnel)
            .min_by_key(|c| c.fc(c.send_direction()).queue_n)
            .map(|c| c.id)
    }

    /// Update the tunnel state from its connections and keys; true if ready
    pub(crate) fn tunnel_refresh_state(&mut self, peer: PeerId) -> bool {
        let ready = self.tunnel_is_ready(&peer);
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return false;
        };
        if ready && tunnel.state != TunnelState::Ready {
            info!("Tunnel to {} ready", peer);
            tunnel.state = TunnelState::Ready;
        } else if !ready && tunnel.state == TunnelState::Ready {
            tunnel.state = if tunnel.connections.is_empty() {
                TunnelState::Reconnecting
            } else {
                TunnelState::Waiting
            };
            info!("Tunnel to {} lost readiness ({:?})", peer, tunnel.state);
        }
        ready
    }

    /// Send a channel message to the other end of the tunnel, in submission order
    pub(crate) fn tunnel_send(&mut self, peer: PeerId, message: ChannelMessage, direction: Direction, tag: Option<DataTag>) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            debug!("No tunnel to {} for {}", peer, message.kind());
            return;
        };
        let item = TunnelMessage {
            message,
            direction,
            tag,
        };
        if tunnel.loopback {
            self.loopback_queue.push_back(item);
            self.drain_loopback();
            return;
        }
        tunnel.queue.push_back(item);
        self.tunnel_send_queued(peer);
    }

    /// Loopback messages are handled one at a time, never re-entrantly
    fn drain_loopback(&mut self) {
        if self.loopback_draining {
            return;
        }
        self.loopback_draining = true;
        while let Some(item) = self.loopback_queue.pop_front() {
            if let Some(tag) = item.tag {
                self.channel_message_sent(tag);
            }
            let me = self.my_id;
            self.handle_channel_message(me, item.message, Some(item.direction));
        }
        self.loopback_draining = false;
    }

    /// Move queued channel traffic onto connections while there is room
    pub(crate) fn tunnel_send_queued(&mut self, peer: PeerId) {
        while self.tunnel_is_ready(&peer) && self.tunnel_connections_buffer(&peer) > 0 {
            let Some(item) = self.tunnels.get_mut(&peer).and_then(|t| t.queue.pop_front()) else {
                break;
            };
            self.tunnel_seal_and_queue(peer, item);
        }
    }

    fn tunnel_seal_and_queue(&mut self, peer: PeerId, item: TunnelMessage) {
        let Some(cid) = self.tunnel_select_connection(&peer) else {
            if let Some(tunnel) = self.tunnels.get_mut(&peer) {
                tunnel.queue.push_front(item);
            }
            return;
        };
        let Some(direction) = self.connections.get(&cid).map(|c| c.send_direction()) else {
            return;
        };
        let plaintext = match item.message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", item.message.kind(), e);
                return;
            }
        };
        let Some(cipher) = self.tunnels.get_mut(&peer).and_then(|t| t.cipher.as_mut()) else {
            return;
        };
        let (iv, ciphertext) = match cipher.seal(&plaintext, &cid.0) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to seal {} for {}: {}", item.message.kind(), peer, e);
                return;
            }
        };
        debug!("{} {} to {} on {}", item.message.kind(), item.message.chid(), peer, cid);
        let frame = EncryptedFrame {
            cid,
            pid: 0,
            ttl: self.config.default_ttl,
            iv,
            ciphertext,
        };
        self.queue_message(cid, direction, ConnectionMessage::encrypted(direction, frame), item.tag);
    }

    /// Open, decode and dispatch a frame that terminated here
    pub(crate) fn tunnel_handle_frame(&mut self, peer: PeerId, from: PeerId, frame: EncryptedFrame) {
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        let kind = "ENCRYPTED";
        let Some(cipher) = tunnel.cipher.as_ref() else {
            self.protocol_violation(from, kind, "encrypted frame before key exchange");
            return;
        };
        let plaintext = match cipher.open(frame.iv, &frame.ciphertext, &frame.cid.0) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.protocol_violation(from, kind, &e.to_string());
                return;
            }
        };
        match ChannelMessage::from_bytes(&plaintext) {
            Ok(message) => self.handle_channel_message(peer, message, None),
            Err(e) => self.protocol_violation(from, kind, &e.to_string()),
        }
    }

    /// Announce our ephemeral key on `cid`, asking for an answer while we hold no keys
    fn tunnel_send_kx(&mut self, peer: PeerId, cid: ConnectionId) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        let Some(direction) = self.connections.get(&cid).map(|c| c.send_direction()) else {
            return;
        };
        tunnel.kx_sent_on.insert(cid);
        let kx = ConnectionMessage::Kx {
            cid,
            direction,
            ephemeral: tunnel.kx.public_key(),
            force_reply: tunnel.cipher.is_none(),
        };
        self.queue_message(cid, direction, kx, None);
        self.tunnel_arm_kx_retry(peer);
    }

    fn tunnel_arm_kx_retry(&mut self, peer: PeerId) {
        let first = self.config.create_connection_time();
        let now = self.now;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if tunnel.kx_timer.is_some() || tunnel.has_keys() {
            return;
        }
        if tunnel.kx_retry_time.is_zero() {
            tunnel.kx_retry_time = first;
        }
        let event = TimerEvent::TunnelKxRetry { peer };
        tunnel.kx_timer = Some(self.timers.schedule(now + tunnel.kx_retry_time, event));
    }

    /// Our KX got no answer yet: send it again on every usable connection
    pub(crate) fn tunnel_kx_retry(&mut self, id: TimerId, peer: PeerId) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if tunnel.kx_timer != Some(id) {
            return;
        }
        tunnel.kx_timer = None;
        if tunnel.has_keys() {
            return;
        }
        tunnel.kx_retry_time = std_backoff(tunnel.kx_retry_time);
        let delay = tunnel.kx_retry_time;
        let cids: Vec<ConnectionId> = match self.tunnels.get(&peer) {
            Some(tunnel) => self.usable_connections(tunnel).map(|c| c.id).collect(),
            None => return,
        };
        debug!("Resending KX to {} on {} connections, next in {:?}", peer, cids.len(), delay);
        for cid in cids {
            self.tunnel_send_kx(peer, cid);
        }
    }

    /// A connection of this tunnel became ready
    pub(crate) fn tunnel_connection_ready(&mut self, peer: PeerId, cid: ConnectionId) {
        let sent = self
            .tunnels
            .get(&peer)
            .map_or(true, |t| t.kx_sent_on.contains(&cid));
        if !sent {
            self.tunnel_send_kx(peer, cid);
        }
        if self.tunnel_refresh_state(peer) {
            self.tunnel_send_queued(peer);
            self.tunnel_unchoke_channels(peer);
        }
    }

    /// The remote end announced its ephemeral key on `cid`
    pub(crate) fn tunnel_handle_kx(&mut self, peer: PeerId, cid: ConnectionId, ephemeral: Bytes32, force_reply: bool) {
        let my_id = self.my_id;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if tunnel.peer_ephemeral != Some(ephemeral) {
            let context = derive_tunnel_context(&my_id, &peer);
            match tunnel.kx.session(&ephemeral, &context) {
                Ok(keys) => {
                    tunnel.cipher = Some(Box::new(keys));
                    tunnel.peer_ephemeral = Some(ephemeral);
                    if let Some(timer) = tunnel.kx_timer.take() {
                        self.timers.cancel(timer);
                    }
                    info!("Session keys agreed with {}", peer);
                }
                Err(e) => {
                    warn!("Key exchange with {} failed: {}", peer, e);
                    return;
                }
            }
        }
        if force_reply || !tunnel.kx_sent_on.contains(&cid) {
            self.tunnel_send_kx(peer, cid);
        }
        if self.tunnel_refresh_state(peer) {
            self.tunnel_send_queued(peer);
            self.tunnel_unchoke_channels(peer);
        }
    }

    /// Let every local channel end send again if there is room
    pub(crate) fn tunnel_unchoke_channels(&mut self, peer: PeerId) {
        let ends: Vec<(ChannelNumber, Direction)> = match self.tunnels.get(&peer) {
            Some(tunnel) => tunnel
                .channels
                .values()
                .flat_map(|c| c.local_directions().map(move |d| (c.gid, d)))
                .collect(),
            None => return,
        };
        for (gid, direction) in ends {
            self.channel_allow_client(peer, gid, direction);
        }
    }

    /// Open connections on the best unused paths, or ask discovery for more
    pub(crate) fn tunnel_ensure_connections(&mut self, peer: PeerId) {
        let max = self.config.max_tunnel_connections;
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        if tunnel.loopback || tunnel.draining || (tunnel.channels.is_empty() && tunnel.queue.is_empty()) {
            return;
        }
        let used: Vec<Bytes32> = tunnel
            .connections
            .iter()
            .filter_map(|cid| self.connections.get(cid))
            .map(|c| *c.path.digest())
            .collect();
        let mut count = tunnel.connections.len();
        let candidates: Vec<Arc<Path>> = self
            .peers
            .get(&peer)
            .map(|record| {
                record
                    .paths
                    .iter()
                    .filter(|p| !used.contains(p.path.digest()))
                    .filter(|p| p.path.peers().get(1).map_or(false, |hop| self.is_neighbor(hop)))
                    .map(|p| p.path.clone())
                    .collect()
            })
            .unwrap_or_default();

        for path in candidates {
            if count >= max {
                break;
            }
            self.connection_new_outgoing(peer, path);
            count += 1;
        }

        if count >= max {
            self.tunnel_stop_search(peer);
        } else {
            self.tunnel_start_search(peer);
        }

        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            if tunnel.state != TunnelState::Ready {
                tunnel.state = if !tunnel.connections.is_empty() {
                    TunnelState::Waiting
                } else if matches!(tunnel.state, TunnelState::New | TunnelState::Searching) {
                    TunnelState::Searching
                } else {
                    TunnelState::Reconnecting
                };
            }
        }
    }

    fn tunnel_start_search(&mut self, peer: PeerId) {
        let record = self.peer_record(peer);
        if record.search_active {
            return;
        }
        record.search_active = true;
        debug!("Searching paths to {}", peer);
        self.discovery.start_search(peer);
    }

    fn tunnel_stop_search(&mut self, peer: PeerId) {
        let Some(record) = self.peers.get_mut(&peer) else {
            return;
        };
        if !record.search_active {
            return;
        }
        record.search_active = false;
        self.discovery.stop_search(peer);
    }

    /// A connection stopped serving this tunnel
    pub(crate) fn tunnel_remove_connection(&mut self, peer: PeerId, cid: ConnectionId) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        tunnel.connections.retain(|c| *c != cid);
        tunnel.kx_sent_on.remove(&cid);
        if tunnel.draining {
            self.tunnel_try_finalize(peer);
            return;
        }
        if tunnel.channels.is_empty() && tunnel.connections.is_empty() {
            self.tunnel_remove(peer);
            return;
        }
        self.tunnel_refresh_state(peer);
        self.tunnel_ensure_connections(peer);
    }

    /// Start tearing the tunnel down once its last channel is gone
    pub(crate) fn tunnel_destroy_if_empty(&mut self, peer: PeerId) {
        let ready = self.tunnel_is_ready(&peer);
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if !tunnel.channels.is_empty() {
            return;
        }
        if tunnel.loopback {
            self.tunnel_remove(peer);
            return;
        }
        if !tunnel.draining {
            debug!("Tunnel to {} has no channels, draining", peer);
            tunnel.draining = true;
        }
        if !ready {
            tunnel.queue.clear();
        }
        self.tunnel_stop_search(peer);
        self.tunnel_try_finalize(peer);
    }

    /// Free a draining tunnel once nothing of it is queued anywhere
    pub(crate) fn tunnel_try_finalize(&mut self, peer: PeerId) {
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        if !tunnel.draining || !tunnel.queue.is_empty() {
            return;
        }
        let busy = tunnel
            .connections
            .iter()
            .filter_map(|cid| self.connections.get(cid))
            .any(|c| c.fwd_fc.queue_n > 0 || c.bck_fc.queue_n > 0);
        if busy {
            return;
        }
        let connections = self.tunnel_remove(peer);
        for cid in connections {
            if let Some(conn) = self.connections.get_mut(&cid) {
                conn.tunnel = None;
            }
            self.connection_send_destroy(cid);
        }
    }

    /// Drop the tunnel record, returning the connections it still held
    fn tunnel_remove(&mut self, peer: PeerId) -> Vec<ConnectionId> {
        let Some(tunnel) = self.tunnels.remove(&peer) else {
            return Vec::new();
        };
        if let Some(timer) = tunnel.kx_timer {
            self.timers.cancel(timer);
        }
        self.stats.tunnels_destroyed += 1;
        info!("Tunnel to {} destroyed", peer);
        self.tunnel_stop_search(peer);
        self.gc_peer(peer);
        tunnel.connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chid_sides_never_collide() {
        let low = PeerId([1; 32]);
        let high = PeerId([2; 32]);
        let mut at_low = Tunnel::new(high, false);
        let mut at_high = Tunnel::new(low, false);

        let a = at_low.alloc_chid(&low);
        let b = at_high.alloc_chid(&high);
        assert_ne!(a, b);
        assert_eq!(a.0 & GID_SIDE_BIT, GID_SIDE_BIT);
        assert_eq!(b.0 & GID_SIDE_BIT, 0);
        assert!(a.is_global() && b.is_global());
    }

    #[test]
    fn test_own_chid_side() {
        let low = PeerId([1; 32]);
        let high = PeerId([2; 32]);
        let mut at_low = Tunnel::new(high, false);
        let at_high = Tunnel::new(low, false);

        let gid = at_low.alloc_chid(&low);
        assert!(at_low.is_own_chid(&low, gid));
        assert!(!at_high.is_own_chid(&high, gid));
        assert!(at_high.is_own_chid(&high, ChannelNumber(3)));
    }

    #[test]
    fn test_empty_tunnel_advertises_full_window() {
        let tunnel = Tunnel::new(PeerId([1; 32]), false);
        assert_eq!(tunnel.channels_buffer(), WINDOW);
        assert!(!tunnel.has_keys());
        assert_eq!(tunnel.state, TunnelState::New);
    }

    #[test]
    fn test_loopback_starts_ready() {
        let tunnel = Tunnel::new(PeerId([1; 32]), true);
        assert!(tunnel.is_ready_state());
    }
}
