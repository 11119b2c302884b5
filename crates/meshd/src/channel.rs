//! Channels: end-to-end streams multiplexed over a tunnel
//!
//! A channel has a root end (the creator, sending `Fwd`) and a destination
//! end (the listener, sending `Bck`). Only the local ends exist here; both
//! exist for loopback channels. Every local end owns a [`Reliability`] for
//! its traffic and a client binding through its local id.
//!
//! Handshake: CHANNEL_CREATE (fwd) is retried until CHANNEL_ACK (bck)
//! arrives; the destination retries its ACK until the root's answering ACK
//! (fwd) or data shows the root is ready.

use crate::error::{MeshError, Result};
use crate::local::{ChannelRef, ClientId};
use crate::mesh::Mesh;
use crate::peer::DataTag;
use crate::reliability::{Accepted, Reliability, WINDOW};
use crate::timers::{std_backoff, TimerEvent, TimerId};
use mesh_core::{
    ChannelMessage, ChannelNumber, ChannelOptions, Direction, PeerId, Port, MAX_PAYLOAD_SIZE,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    /// CREATE or the answering ACK sent, waiting for the other end
    Sent,
    Ready,
}

/// One local end of a channel
#[derive(Debug)]
pub struct ChannelEnd {
    pub client: ClientId,
    pub lid: ChannelNumber,
    pub rel: Reliability,
    /// The other end is known to be ready
    pub confirmed: bool,
    control_retry: Option<TimerId>,
    control_retry_time: Duration,
}

impl ChannelEnd {
    fn new(client: ClientId, lid: ChannelNumber) -> Self {
        Self {
            client,
            lid,
            rel: Reliability::new(),
            confirmed: false,
            control_retry: None,
            control_retry_time: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub struct Channel {
    pub gid: ChannelNumber,
    pub port: Port,
    pub options: ChannelOptions,
    pub state: ChannelState,
    /// Local root end, sending `Fwd`
    pub root: Option<ChannelEnd>,
    /// Local destination end, sending `Bck`
    pub dest: Option<ChannelEnd>,
}

impl Channel {
    fn new(gid: ChannelNumber, port: Port, options: ChannelOptions) -> Self {
        Self {
            gid,
            port,
            options,
            state: ChannelState::New,
            root: None,
            dest: None,
        }
    }

    /// End sending in `direction`
    pub fn end(&self, direction: Direction) -> Option<&ChannelEnd> {
        match direction {
            Direction::Fwd => self.root.as_ref(),
            Direction::Bck => self.dest.as_ref(),
        }
    }

    pub fn end_mut(&mut self, direction: Direction) -> Option<&mut ChannelEnd> {
        match direction {
            Direction::Fwd => self.root.as_mut(),
            Direction::Bck => self.dest.as_mut(),
        }
    }

    fn take_end(&mut self, direction: Direction) -> Option<ChannelEnd> {
        match direction {
            Direction::Fwd => self.root.take(),
            Direction::Bck => self.dest.take(),
        }
    }

    pub fn local_ends(&self) -> impl Iterator<Item = &ChannelEnd> + '_ {
        self.root.iter().chain(self.dest.iter())
    }

    /// Sending directions of the local ends
    pub fn local_directions(&self) -> impl Iterator<Item = Direction> + '_ {
        self.root
            .as_ref()
            .map(|_| Direction::Fwd)
            .into_iter()
            .chain(self.dest.as_ref().map(|_| Direction::Bck))
    }

    pub fn is_reliable(&self) -> bool {
        self.options.is_reliable()
    }

    fn refresh_state(&mut self) {
        let confirmed = self.local_ends().all(|end| end.confirmed);
        if confirmed && self.local_ends().next().is_some() {
            self.state = ChannelState::Ready;
        }
    }
}

impl Mesh {
    fn channel_mut(&mut self, peer: PeerId, gid: ChannelNumber) -> Option<&mut Channel> {
        self.tunnels.get_mut(&peer)?.channels.get_mut(&gid)
    }

    fn channel_is_loopback(&self, peer: &PeerId) -> bool {
        self.tunnels.get(peer).map_or(false, |t| t.loopback)
    }

    /// Open a channel from `client` to `port` at `peer`
    pub fn create_channel(
        &mut self,
        client: ClientId,
        peer: PeerId,
        port: Port,
        options: ChannelOptions,
        now: Instant,
    ) -> Result<ChannelNumber> {
        self.now = now;
        if !self.clients.contains(client) {
            return Err(MeshError::UnknownClient(client));
        }
        self.tunnel_get_or_create(peer);
        let my_id = self.my_id;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return Err(MeshError::UnknownClient(client));
        };
        if tunnel.draining {
            debug!("Reviving draining tunnel to {}", peer);
            tunnel.draining = false;
        }
        let gid = tunnel.alloc_chid(&my_id);
        let lid = self.clients.bind_channel(
            client,
            ChannelRef {
                peer,
                gid,
                direction: Direction::Fwd,
            },
        )?;

        let mut channel = Channel::new(gid, port, options);
        channel.root = Some(ChannelEnd::new(client, lid));
        channel.state = ChannelState::Sent;
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.channels.insert(gid, channel);
        }
        self.stats.channels_created += 1;
        info!("Channel {} ({}) to {}:{} created by {}", gid, lid, peer, port, client);

        let retry = self.config.retransmit_time();
        self.schedule_control_retry(peer, gid, Direction::Fwd, retry);
        self.tunnel_send(peer, ChannelMessage::Create { chid: gid, port, options }, Direction::Fwd, None);
        self.tunnel_ensure_connections(peer);
        Ok(lid)
    }

    /// Send one payload on a local channel
    pub fn send(&mut self, client: ClientId, lid: ChannelNumber, payload: Vec<u8>, now: Instant) -> Result<()> {
        self.now = now;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MeshError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let ChannelRef { peer, gid, direction } = self.clients.channel(client, lid)?;
        let Some(channel) = self.channel_mut(peer, gid) else {
            return Err(MeshError::UnknownChannel(lid));
        };
        let reliable = channel.is_reliable();
        let Some(end) = channel.end_mut(direction) else {
            return Err(MeshError::UnknownChannel(lid));
        };
        if !end.confirmed || !end.rel.client_allowed {
            return Err(MeshError::NotAllowed(lid));
        }
        end.rel.client_allowed = false;
        let mid = end.rel.next_mid(&payload, reliable);
        let arm_retry = reliable && end.rel.retry_timer.is_none();
        debug!("DATA {} on {} ({} bytes)", mid, gid, payload.len());

        if arm_retry {
            self.channel_arm_retransmit(peer, gid, direction, true);
        }
        let tag = reliable.then_some(DataTag {
            peer,
            gid,
            direction,
            mid,
        });
        self.tunnel_send(peer, ChannelMessage::Data { chid: gid, mid, payload }, direction, tag);
        self.channel_allow_client(peer, gid, direction);
        Ok(())
    }

    /// The client is ready for the next delivery on `lid`
    pub fn ack(&mut self, client: ClientId, lid: ChannelNumber, now: Instant) -> Result<()> {
        self.now = now;
        let ChannelRef { peer, gid, direction } = self.clients.channel(client, lid)?;
        let Some(end) = self.channel_mut(peer, gid).and_then(|c| c.end_mut(direction)) else {
            return Err(MeshError::UnknownChannel(lid));
        };
        end.rel.client_ready = true;
        self.channel_deliver(peer, gid, direction);

        if self.channel_is_loopback(&peer) {
            self.channel_allow_client(peer, gid, direction.reverse());
        } else {
            let connections = self
                .tunnels
                .get(&peer)
                .map(|t| t.connections.clone())
                .unwrap_or_default();
            for cid in connections {
                let incoming = match self.connections.get(&cid) {
                    Some(conn) => conn.send_direction().reverse(),
                    None => continue,
                };
                self.connection_send_ack(cid, incoming, false);
            }
        }
        Ok(())
    }

    /// Close a local channel; the client gets no notification for it
    pub fn destroy_channel(&mut self, client: ClientId, lid: ChannelNumber, now: Instant) -> Result<()> {
        self.now = now;
        let channel = self.clients.channel(client, lid)?;
        self.clients.unbind_channel(client, lid);
        debug!("Client {} destroys channel {} ({})", client, channel.gid, lid);
        self.channel_teardown(channel.peer, channel.gid, channel.direction);
        Ok(())
    }

    /// Remove the local end sending `direction`; idempotent
    ///
    /// The caller already unbound that end's local id. The remote end hears
    /// CHANNEL_DESTROY; a loopback peer end is notified directly.
    pub(crate) fn channel_teardown(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        let loopback = self.channel_is_loopback(&peer);
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        let Some(end) = channel.take_end(direction) else {
            return;
        };
        let other = if loopback {
            channel.take_end(direction.reverse())
        } else {
            None
        };
        self.channel_cancel_timers(&end);
        if let Some(other) = other {
            self.channel_cancel_timers(&other);
            if self.clients.unbind_channel(other.client, other.lid) {
                self.client.notify_channel_destroyed(other.client, other.lid);
            }
        }
        if !loopback {
            self.tunnel_send(peer, ChannelMessage::Destroy { chid: gid }, direction, None);
        }
        self.channel_remove(peer, gid);
    }

    fn channel_remove(&mut self, peer: PeerId, gid: ChannelNumber) {
        let Some(channel) = self.tunnels.get_mut(&peer).and_then(|t| t.channels.remove(&gid)) else {
            return;
        };
        for end in channel.local_ends() {
            self.channel_cancel_timers(end);
        }
        self.stats.channels_destroyed += 1;
        debug!("Channel {} to {} destroyed", gid, peer);
        self.tunnel_destroy_if_empty(peer);
    }

    fn channel_cancel_timers(&mut self, end: &ChannelEnd) {
        for id in [end.rel.retry_timer, end.control_retry].into_iter().flatten() {
            self.timers.cancel(id);
        }
    }

    /// Dispatch a channel message from the other end of the tunnel
    ///
    /// `direction` is the travel direction when known (loopback); remote
    /// messages travel towards whichever end is local.
    pub(crate) fn handle_channel_message(&mut self, peer: PeerId, message: ChannelMessage, direction: Option<Direction>) {
        let gid = message.chid();
        let travel = match (&message, direction) {
            (ChannelMessage::Create { .. }, _) => Direction::Fwd,
            (_, Some(direction)) => direction,
            (_, None) => match self.tunnels.get(&peer).and_then(|t| t.channels.get(&gid)) {
                Some(channel) if channel.dest.is_some() => Direction::Fwd,
                Some(_) => Direction::Bck,
                None => {
                    debug!("{} for unknown channel {} from {}", message.kind(), gid, peer);
                    return;
                }
            },
        };
        debug!("<- {} {} from {} ({})", message.kind(), gid, peer, travel);

        match message {
            ChannelMessage::Create { chid, port, options } => self.handle_channel_create(peer, chid, port, options),
            ChannelMessage::Ack { chid } => self.handle_channel_ack(peer, chid, travel),
            ChannelMessage::Nack { chid } => self.handle_channel_nack(peer, chid),
            ChannelMessage::Destroy { chid } => self.handle_channel_destroy(peer, chid, travel),
            ChannelMessage::Data { chid, mid, payload } => self.handle_data(peer, chid, travel, mid, payload),
            ChannelMessage::DataAck { chid, mid, futures } => {
                self.handle_data_ack(peer, chid, travel, mid, futures)
            }
        }
    }

    fn handle_channel_create(&mut self, peer: PeerId, gid: ChannelNumber, port: Port, options: ChannelOptions) {
        if !gid.is_global() {
            self.protocol_violation(peer, "CHANNEL_CREATE", "local channel number on the wire");
            return;
        }
        let my_id = self.my_id;
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        let existing = tunnel.channels.get(&gid);
        if !tunnel.loopback && (tunnel.is_own_chid(&my_id, gid) || existing.map_or(false, |c| c.root.is_some())) {
            self.protocol_violation(peer, "CHANNEL_CREATE", "channel number from our side of the id space");
            return;
        }
        if existing.map_or(false, |c| c.dest.is_some()) {
            debug!("Duplicate CHANNEL_CREATE for {}, answering again", gid);
            self.tunnel_send(peer, ChannelMessage::Ack { chid: gid }, Direction::Bck, None);
            return;
        }
        let is_new = existing.is_none();

        let Some(owner) = self.clients.port_owner(port) else {
            info!("No client on port {} for channel {} from {}", port, gid, peer);
            self.tunnel_send(peer, ChannelMessage::Nack { chid: gid }, Direction::Bck, None);
            return;
        };
        let lid = match self.clients.bind_channel(
            owner,
            ChannelRef {
                peer,
                gid,
                direction: Direction::Bck,
            },
        ) {
            Ok(lid) => lid,
            Err(e) => {
                warn!("Cannot bind channel {} to {}: {}", gid, owner, e);
                return;
            }
        };

        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        tunnel.draining = false;
        let channel = tunnel
            .channels
            .entry(gid)
            .or_insert_with(|| Channel::new(gid, port, options));
        channel.dest = Some(ChannelEnd::new(owner, lid));
        channel.state = ChannelState::Sent;
        if is_new {
            self.stats.channels_created += 1;
        }
        info!("Channel {} from {} on port {} accepted by {} ({})", gid, peer, port, owner, lid);

        self.client.notify_channel_created(owner, lid, port, peer, options);
        let retry = self.config.retransmit_time();
        self.schedule_control_retry(peer, gid, Direction::Bck, retry);
        self.tunnel_send(peer, ChannelMessage::Ack { chid: gid }, Direction::Bck, None);
    }

    fn handle_channel_ack(&mut self, peer: PeerId, gid: ChannelNumber, travel: Direction) {
        let receiver = travel.reverse();
        let has_end = self
            .channel_mut(peer, gid)
            .map_or(false, |c| c.end(receiver).is_some());
        if !has_end {
            debug!("CHANNEL_ACK for {} without a local end", gid);
            return;
        }
        self.channel_confirm(peer, gid, receiver);
        if receiver == Direction::Fwd {
            self.tunnel_send(peer, ChannelMessage::Ack { chid: gid }, Direction::Fwd, None);
        }
    }

    /// The other end of the local end sending `direction` is ready
    fn channel_confirm(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        let Some(channel) = self.tunnels.get_mut(&peer).and_then(|t| t.channels.get_mut(&gid)) else {
            return;
        };
        let Some(end) = channel.end_mut(direction) else {
            return;
        };
        if end.confirmed {
            return;
        }
        end.confirmed = true;
        if let Some(id) = end.control_retry.take() {
            self.timers.cancel(id);
        }
        channel.refresh_state();
        debug!("Channel {} confirmed ({})", gid, direction);
        self.channel_allow_client(peer, gid, direction);
    }

    fn handle_channel_nack(&mut self, peer: PeerId, gid: ChannelNumber) {
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        match &channel.root {
            Some(root) if !root.confirmed => {}
            _ => {
                debug!("Ignoring CHANNEL_NACK for {}", gid);
                return;
            }
        }
        let Some(root) = channel.root.take() else {
            return;
        };
        info!("Channel {} rejected by {}", gid, peer);
        self.channel_cancel_timers(&root);
        if self.clients.unbind_channel(root.client, root.lid) {
            self.client.notify_channel_destroyed(root.client, root.lid);
        }
        self.channel_remove(peer, gid);
    }

    fn handle_channel_destroy(&mut self, peer: PeerId, gid: ChannelNumber, travel: Direction) {
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        let Some(end) = channel.take_end(travel.reverse()) else {
            return;
        };
        info!("Channel {} destroyed by {}", gid, peer);
        self.channel_cancel_timers(&end);
        if self.clients.unbind_channel(end.client, end.lid) {
            self.client.notify_channel_destroyed(end.client, end.lid);
        }
        let empty = self
            .channel_mut(peer, gid)
            .map_or(true, |c| c.local_ends().next().is_none());
        if empty {
            self.channel_remove(peer, gid);
        }
    }

    fn handle_data(&mut self, peer: PeerId, gid: ChannelNumber, travel: Direction, mid: u32, payload: Vec<u8>) {
        let receiver = travel.reverse();
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        let reliable = channel.is_reliable();
        let Some(end) = channel.end_mut(receiver) else {
            debug!("DATA for {} without a local receiver", gid);
            return;
        };
        let confirmed = end.confirmed;
        match end.rel.accept(mid, payload, reliable) {
            Accepted::Buffered => {}
            Accepted::Duplicate => {
                self.stats.dropped_duplicate += 1;
                debug!("Duplicate DATA {} on {}", mid, gid);
            }
            Accepted::OutOfWindow => {
                self.stats.dropped_duplicate += 1;
                debug!("DATA {} on {} outside the window", mid, gid);
            }
        }
        if !confirmed {
            self.channel_confirm(peer, gid, receiver);
        }
        self.channel_deliver(peer, gid, receiver);

        if reliable {
            let Some((ack, futures)) = self
                .channel_mut(peer, gid)
                .and_then(|c| c.end(receiver))
                .map(|end| end.rel.ack_state())
            else {
                return;
            };
            self.tunnel_send(peer, ChannelMessage::DataAck { chid: gid, mid: ack, futures }, receiver, None);
        }
    }

    fn handle_data_ack(&mut self, peer: PeerId, gid: ChannelNumber, travel: Direction, ack: u32, futures: u64) {
        let sender = travel.reverse();
        let now = self.now;
        let Some(end) = self.channel_mut(peer, gid).and_then(|c| c.end_mut(sender)) else {
            return;
        };
        let before = end.rel.sent.len();
        if let Some(measured) = end.rel.retire(ack, futures, now) {
            end.rel.update_delay(measured);
        }
        let retired = before - end.rel.sent.len();
        if retired == 0 {
            return;
        }
        debug!("DATA_ACK {} on {} retired {}, {} left", ack, gid, retired, end.rel.sent.len());
        let idle = end.rel.sent.is_empty();
        if let Some(id) = end.rel.retry_timer.take() {
            self.timers.cancel(id);
        }
        if !idle {
            self.channel_arm_retransmit(peer, gid, sender, true);
        }
        self.channel_allow_client(peer, gid, sender);
    }

    /// Hand buffered data to the client of the end sending `direction` while it is ready
    fn channel_deliver(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        loop {
            let Some(channel) = self.channel_mut(peer, gid) else {
                return;
            };
            let reliable = channel.is_reliable();
            let Some(end) = channel.end_mut(direction) else {
                return;
            };
            if !end.rel.client_ready {
                return;
            }
            let Some((mid, payload)) = end.rel.next_deliverable(reliable) else {
                return;
            };
            end.rel.client_ready = false;
            let (client, lid) = (end.client, end.lid);
            self.stats.data_delivered += 1;
            debug!("Delivering DATA {} on {} to {}", mid, gid, client);
            if self.clients.contains(client) {
                self.client.deliver_data(client, lid, payload);
            }
        }
    }

    /// Grant the client of the end sending `direction` one more send if there is room
    pub(crate) fn channel_allow_client(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        let loopback = self.channel_is_loopback(&peer);
        let buffer = if loopback {
            self.tunnels
                .get(&peer)
                .and_then(|t| t.channels.get(&gid))
                .and_then(|c| c.end(direction.reverse()))
                .map_or(0, |other| WINDOW.saturating_sub(other.rel.recv.len() as u32))
        } else if self.tunnel_is_ready(&peer) {
            self.tunnel_connections_buffer(&peer)
        } else {
            0
        };
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        let reliable = channel.is_reliable();
        let Some(end) = channel.end_mut(direction) else {
            return;
        };
        if !end.confirmed || end.rel.client_allowed || buffer == 0 {
            return;
        }
        if reliable && end.rel.window_full() {
            return;
        }
        end.rel.client_allowed = true;
        let (client, lid) = (end.client, end.lid);
        if self.clients.contains(client) {
            self.client.notify_send_ack(client, lid);
        }
    }

    /// A tagged DATA frame left towards a neighbor (or the loopback end)
    pub(crate) fn channel_message_sent(&mut self, tag: DataTag) {
        let now = self.now;
        let Some(end) = self
            .channel_mut(tag.peer, tag.gid)
            .and_then(|c| c.end_mut(tag.direction))
        else {
            return;
        };
        if let Some(copy) = end.rel.sent.iter_mut().find(|c| c.mid == tag.mid) {
            copy.timestamp = Some(now);
        }
    }

    fn channel_arm_retransmit(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction, reset: bool) {
        let retransmit_time = self.config.retransmit_time();
        let margin = self.config.retransmit_margin;
        let at = self.now;
        let Some(end) = self
            .tunnels
            .get_mut(&peer)
            .and_then(|t| t.channels.get_mut(&gid))
            .and_then(|c| c.end_mut(direction))
        else {
            return;
        };
        if reset || end.rel.retry_time.is_zero() {
            end.rel.retry_time = end.rel.retry_base(retransmit_time, margin);
        }
        if let Some(old) = end.rel.retry_timer.take() {
            self.timers.cancel(old);
        }
        let event = TimerEvent::ChannelRetransmit { peer, gid, direction };
        end.rel.retry_timer = Some(self.timers.schedule(at + end.rel.retry_time, event));
    }

    /// Retransmit the oldest unacknowledged message sent in `direction`
    pub(crate) fn channel_retransmit(&mut self, id: TimerId, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        let Some(end) = self.channel_mut(peer, gid).and_then(|c| c.end_mut(direction)) else {
            return;
        };
        if end.rel.retry_timer != Some(id) {
            return;
        }
        end.rel.retry_timer = None;
        let Some(copy) = end.rel.sent.front().cloned() else {
            return;
        };
        end.rel.retry_time = std_backoff(end.rel.retry_time);
        let tag = DataTag {
            peer,
            gid,
            direction,
            mid: copy.mid,
        };

        let in_tunnel = self
            .tunnels
            .get(&peer)
            .map_or(false, |t| t.queue.iter().any(|q| q.tag == Some(tag)));
        if in_tunnel || self.is_data_queued(&tag) {
            debug!("DATA {} on {} still queued, not retransmitting", copy.mid, gid);
        } else {
            self.stats.data_retransmitted += 1;
            debug!("Retransmitting DATA {} on {}", copy.mid, gid);
            let data = ChannelMessage::Data {
                chid: gid,
                mid: copy.mid,
                payload: copy.payload,
            };
            self.tunnel_send(peer, data, direction, Some(tag));
        }
        self.channel_arm_retransmit(peer, gid, direction, false);
    }

    fn schedule_control_retry(&mut self, peer: PeerId, gid: ChannelNumber, direction: Direction, delay: Duration) {
        let at = self.now + delay;
        let Some(end) = self
            .tunnels
            .get_mut(&peer)
            .and_then(|t| t.channels.get_mut(&gid))
            .and_then(|c| c.end_mut(direction))
        else {
            return;
        };
        if let Some(old) = end.control_retry.take() {
            self.timers.cancel(old);
        }
        end.control_retry_time = delay;
        let event = TimerEvent::ChannelControlRetry { peer, gid, direction };
        end.control_retry = Some(self.timers.schedule(at, event));
    }

    /// Resend CHANNEL_CREATE (root) or its answering CHANNEL_ACK (destination)
    pub(crate) fn channel_control_retry(&mut self, id: TimerId, peer: PeerId, gid: ChannelNumber, direction: Direction) {
        let Some(channel) = self.channel_mut(peer, gid) else {
            return;
        };
        let (port, options) = (channel.port, channel.options);
        let Some(end) = channel.end_mut(direction) else {
            return;
        };
        if end.control_retry != Some(id) {
            return;
        }
        end.control_retry = None;
        if end.confirmed {
            return;
        }
        let delay = std_backoff(end.control_retry_time);
        let message = match direction {
            Direction::Fwd => ChannelMessage::Create { chid: gid, port, options },
            Direction::Bck => ChannelMessage::Ack { chid: gid },
        };
        debug!("Retrying {} for {}, next in {:?}", message.kind(), gid, delay);
        self.schedule_control_retry(peer, gid, direction, delay);
        self.tunnel_send(peer, message, direction, None);
    }

    /// State of a local channel
    pub fn channel_state(&self, client: ClientId, lid: ChannelNumber) -> Result<ChannelState> {
        let channel = self.clients.channel(client, lid)?;
        self.tunnels
            .get(&channel.peer)
            .and_then(|t| t.channels.get(&channel.gid))
            .map(|c| c.state)
            .ok_or(MeshError::UnknownChannel(lid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(root: bool, dest: bool) -> Channel {
        let mut channel = Channel::new(ChannelNumber(4), 7, ChannelOptions::reliable());
        if root {
            channel.root = Some(ChannelEnd::new(ClientId(0), ChannelNumber(0x8000_0000)));
        }
        if dest {
            channel.dest = Some(ChannelEnd::new(ClientId(1), ChannelNumber(0xB000_0000)));
        }
        channel
    }

    #[test]
    fn test_ends_by_sending_direction() {
        let channel = channel_with(true, false);
        assert_eq!(channel.end(Direction::Fwd).map(|e| e.client), Some(ClientId(0)));
        assert!(channel.end(Direction::Bck).is_none());
        assert_eq!(channel.local_directions().collect::<Vec<_>>(), vec![Direction::Fwd]);
    }

    #[test]
    fn test_loopback_ready_only_when_both_confirmed() {
        let mut channel = channel_with(true, true);
        assert_eq!(channel.local_ends().count(), 2);
        if let Some(root) = channel.root.as_mut() {
            root.confirmed = true;
        }
        channel.refresh_state();
        assert_eq!(channel.state, ChannelState::New);
        if let Some(dest) = channel.dest.as_mut() {
            dest.confirmed = true;
        }
        channel.refresh_state();
        assert_eq!(channel.state, ChannelState::Ready);
    }
}
