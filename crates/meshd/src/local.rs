//! Local clients: ids, open ports and local channel numbers
//!
//! A client sees channels only through local ids. Ids of channels the client
//! created come from `[0x8000_0000, 0xB000_0000)`; ids of incoming channels
//! come from `[0xB000_0000, 0xFFFF_FFFF]`.

use crate::error::{MeshError, Result};
use mesh_core::{ChannelNumber, ChannelOptions, Direction, PeerId, Port};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Local client handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Callbacks towards local clients
pub trait LocalClient: Send {
    /// An incoming channel was opened on one of the client's ports
    fn notify_channel_created(
        &mut self,
        client: ClientId,
        lid: ChannelNumber,
        port: Port,
        origin: PeerId,
        options: ChannelOptions,
    );

    /// A channel went away (remote destroy, rejected create, or loopback peer close)
    fn notify_channel_destroyed(&mut self, client: ClientId, lid: ChannelNumber);

    /// Payload for the client; the client calls `ack` when it wants the next one
    fn deliver_data(&mut self, client: ClientId, lid: ChannelNumber, payload: Vec<u8>);

    /// The client may send one more message on `lid`
    fn notify_send_ack(&mut self, client: ClientId, lid: ChannelNumber);
}

/// A [`LocalClient`] callback as seen by the driver loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ChannelCreated {
        client: ClientId,
        lid: ChannelNumber,
        port: Port,
        origin: PeerId,
    },
    ChannelDestroyed {
        client: ClientId,
        lid: ChannelNumber,
    },
    Data {
        client: ClientId,
        lid: ChannelNumber,
        payload: Vec<u8>,
    },
    SendAck {
        client: ClientId,
        lid: ChannelNumber,
    },
}

impl ClientEvent {
    /// Client the event is addressed to
    pub fn client(&self) -> ClientId {
        match self {
            ClientEvent::ChannelCreated { client, .. }
            | ClientEvent::ChannelDestroyed { client, .. }
            | ClientEvent::Data { client, .. }
            | ClientEvent::SendAck { client, .. } => *client,
        }
    }
}

/// Forwards client callbacks to the driver loop
pub struct ChannelClient {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelClient {
    pub fn new(tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            debug!("Client loop gone, dropping event");
        }
    }
}

impl LocalClient for ChannelClient {
    fn notify_channel_created(
        &mut self,
        client: ClientId,
        lid: ChannelNumber,
        port: Port,
        origin: PeerId,
        _options: ChannelOptions,
    ) {
        self.emit(ClientEvent::ChannelCreated {
            client,
            lid,
            port,
            origin,
        });
    }

    fn notify_channel_destroyed(&mut self, client: ClientId, lid: ChannelNumber) {
        self.emit(ClientEvent::ChannelDestroyed { client, lid });
    }

    fn deliver_data(&mut self, client: ClientId, lid: ChannelNumber, payload: Vec<u8>) {
        self.emit(ClientEvent::Data {
            client,
            lid,
            payload,
        });
    }

    fn notify_send_ack(&mut self, client: ClientId, lid: ChannelNumber) {
        self.emit(ClientEvent::SendAck { client, lid });
    }
}

/// Where a local channel id points
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelRef {
    /// Tunnel peer (the local peer for loopback channels)
    pub peer: PeerId,
    /// Global channel number inside the tunnel
    pub gid: ChannelNumber,
    /// Direction this end sends in (`Fwd` for the root)
    pub direction: Direction,
}

#[derive(Debug)]
struct ClientRecord {
    next_client_lid: u32,
    next_service_lid: u32,
    channels: HashMap<ChannelNumber, ChannelRef>,
}

impl ClientRecord {
    fn new() -> Self {
        Self {
            next_client_lid: ChannelNumber::LOCAL_CLIENT_BASE,
            next_service_lid: ChannelNumber::LOCAL_SERVICE_BASE,
            channels: HashMap::new(),
        }
    }

    fn alloc(&mut self, root: bool) -> ChannelNumber {
        loop {
            let lid = if root {
                let lid = self.next_client_lid;
                self.next_client_lid = if lid + 1 >= ChannelNumber::LOCAL_SERVICE_BASE {
                    ChannelNumber::LOCAL_CLIENT_BASE
                } else {
                    lid + 1
                };
                lid
            } else {
                let lid = self.next_service_lid;
                self.next_service_lid = lid.checked_add(1).unwrap_or(ChannelNumber::LOCAL_SERVICE_BASE);
                lid
            };
            let lid = ChannelNumber(lid);
            if !self.channels.contains_key(&lid) {
                return lid;
            }
        }
    }
}

/// Registry of connected clients, their ports and their channels
#[derive(Debug, Default)]
pub struct ClientRegistry {
    next_id: u64,
    clients: HashMap<ClientId, ClientRecord>,
    ports: HashMap<Port, ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client
    pub fn connect(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(id, ClientRecord::new());
        id
    }

    /// Remove a client, returning its channels and releasing its ports
    pub fn disconnect(&mut self, client: ClientId) -> Result<Vec<(ChannelNumber, ChannelRef)>> {
        let record = self
            .clients
            .remove(&client)
            .ok_or(MeshError::UnknownClient(client))?;
        self.ports.retain(|_, owner| *owner != client);
        let mut channels: Vec<_> = record.channels.into_iter().collect();
        channels.sort_by_key(|(lid, _)| *lid);
        Ok(channels)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Start listening on `port`
    pub fn open_port(&mut self, client: ClientId, port: Port) -> Result<()> {
        if !self.contains(client) {
            return Err(MeshError::UnknownClient(client));
        }
        if self.ports.contains_key(&port) {
            return Err(MeshError::PortInUse(port));
        }
        self.ports.insert(port, client);
        Ok(())
    }

    /// Stop listening on `port`
    pub fn close_port(&mut self, client: ClientId, port: Port) -> Result<()> {
        match self.ports.get(&port) {
            Some(owner) if *owner == client => {
                self.ports.remove(&port);
                Ok(())
            }
            _ => Err(MeshError::PortNotOpen(port)),
        }
    }

    /// Client listening on `port`
    pub fn port_owner(&self, port: Port) -> Option<ClientId> {
        self.ports.get(&port).copied()
    }

    /// Allocate a local id and bind it to a channel end
    pub fn bind_channel(&mut self, client: ClientId, channel: ChannelRef) -> Result<ChannelNumber> {
        let record = self
            .clients
            .get_mut(&client)
            .ok_or(MeshError::UnknownClient(client))?;
        let lid = record.alloc(channel.direction.is_fwd());
        record.channels.insert(lid, channel);
        Ok(lid)
    }

    /// Look up a local id
    pub fn channel(&self, client: ClientId, lid: ChannelNumber) -> Result<ChannelRef> {
        let record = self
            .clients
            .get(&client)
            .ok_or(MeshError::UnknownClient(client))?;
        record
            .channels
            .get(&lid)
            .copied()
            .ok_or(MeshError::UnknownChannel(lid))
    }

    /// Forget a local id; false if it was not bound
    pub fn unbind_channel(&mut self, client: ClientId, lid: ChannelNumber) -> bool {
        self.clients
            .get_mut(&client)
            .map(|r| r.channels.remove(&lid).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_ref(direction: Direction) -> ChannelRef {
        ChannelRef {
            peer: PeerId([1; 32]),
            gid: ChannelNumber(0),
            direction,
        }
    }

    #[test]
    fn test_local_ids_come_from_disjoint_ranges() {
        let mut registry = ClientRegistry::new();
        let client = registry.connect();

        let root = registry.bind_channel(client, channel_ref(Direction::Fwd)).unwrap();
        let dest = registry.bind_channel(client, channel_ref(Direction::Bck)).unwrap();
        assert!(root.is_client_local());
        assert!(dest.is_service_local());

        let next = registry.bind_channel(client, channel_ref(Direction::Fwd)).unwrap();
        assert_eq!(next, ChannelNumber(root.0 + 1));
    }

    #[test]
    fn test_port_held_by_one_client() {
        let mut registry = ClientRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        registry.open_port(a, 7).unwrap();
        assert_eq!(registry.open_port(b, 7), Err(MeshError::PortInUse(7)));
        assert_eq!(registry.close_port(b, 7), Err(MeshError::PortNotOpen(7)));
        assert_eq!(registry.port_owner(7), Some(a));
    }

    #[test]
    fn test_disconnect_releases_ports_and_returns_channels() {
        let mut registry = ClientRegistry::new();
        let client = registry.connect();
        registry.open_port(client, 7).unwrap();
        let lid = registry.bind_channel(client, channel_ref(Direction::Fwd)).unwrap();

        let channels = registry.disconnect(client).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].0, lid);
        assert_eq!(registry.port_owner(7), None);
        assert_eq!(registry.disconnect(client), Err(MeshError::UnknownClient(client)));
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let mut registry = ClientRegistry::new();
        let client = registry.connect();
        let lid = registry.bind_channel(client, channel_ref(Direction::Fwd)).unwrap();
        assert!(registry.unbind_channel(client, lid));
        assert!(!registry.unbind_channel(client, lid));
        assert_eq!(registry.channel(client, lid), Err(MeshError::UnknownChannel(lid)));
    }
}
