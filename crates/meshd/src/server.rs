//! meshd server - drives the engine from the neighbor transport

use crate::config::{Config, MeshConfig};
use crate::discovery::{ChannelDiscovery, DiscoveryRequest};
use crate::error::MeshError;
use crate::local::{ChannelClient, ClientEvent, ClientId};
use crate::mesh::Mesh;
use crate::peer::NeighborSink;
use mesh_core::{ChannelNumber, PeerId, Port};
use mesh_net::crypto::KeyPair;
use mesh_net::transport::{Transport, TransportEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep_until};
use tracing::{debug, error, info, warn};

/// Transport events buffered between the link tasks and the engine
const EVENT_QUEUE_SIZE: usize = 4096;

/// Period of the statistics summary
const STATS_INTERVAL: Duration = Duration::from_secs(300);

/// Sleep used when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Server state
pub struct Server {
    config: Config,
    tunables: MeshConfig,
    keypair: KeyPair,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let seed = config
            .identity_seed_bytes()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let keypair = match seed {
            Some(seed) => KeyPair::from_seed(&seed),
            None => KeyPair::generate(),
        };
        let tunables = config
            .load_tunables()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            tunables,
            keypair,
            shutdown_tx,
        })
    }

    /// Our identity on the mesh
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.keypair.public_key())
    }

    pub fn tunables(&self) -> &MeshConfig {
        &self.tunables
    }

    /// Run the server until [`Server::shutdown`] is called
    pub async fn run(&self) -> Result<(), ServerError> {
        let me = self.peer_id();
        info!("Starting meshd as {} on {}", me, self.config.listen);

        let transport = Arc::new(Transport::new(self.keypair.clone(), self.config.listen));
        let listener = TcpListener::bind(self.config.listen).await?;
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        {
            let transport = Arc::clone(&transport);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.serve(listener, event_tx).await {
                    error!("Transport stopped: {}", e);
                }
            });
        }
        for addr in &self.config.connect {
            let transport = Arc::clone(&transport);
            let event_tx = event_tx.clone();
            let addr = *addr;
            tokio::spawn(async move {
                match transport.connect(addr, event_tx).await {
                    Ok(peer) => info!("Dialed {} at {}", peer, addr),
                    Err(e) => warn!("Failed to dial {}: {}", addr, e),
                }
            });
        }

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let mut mesh = Mesh::new(
            me,
            self.tunables.clone(),
            Box::new(ChannelSink::new(ready_tx)),
            Box::new(ChannelDiscovery::new(discovery_tx)),
            Box::new(ChannelClient::new(client_tx)),
            Instant::now(),
        );
        let mut discovery = StaticDiscovery::new();
        let mut echo = match self.config.echo_port {
            Some(port) => Some(EchoService::start(&mut mesh, port)?),
            None => None,
        };

        let mut stats_ticker = interval_at(
            tokio::time::Instant::now() + STATS_INTERVAL,
            STATS_INTERVAL,
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let deadline = mesh
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    let now = Instant::now();
                    match event {
                        TransportEvent::NeighborConnected(peer) => {
                            mesh.handle_neighbor_connected(peer, now);
                            discovery.neighbor_connected(&mut mesh, peer, now);
                        }
                        TransportEvent::NeighborDisconnected(peer) => {
                            if let Some(info) = transport.get_peer(&peer) {
                                debug!("Neighbor {} lost, last seen at {} via {:?}", peer, info.last_seen, info.addrs);
                            }
                            mesh.handle_neighbor_disconnected(peer, now);
                        }
                        TransportEvent::MessageReceived { from, message } => {
                            mesh.handle_message(from, message, now);
                        }
                    }
                }
                Some(peer) = ready_rx.recv() => {
                    while let Some(message) = mesh.transmit_ready(peer, Instant::now()) {
                        if let Err(e) = transport.send(&peer, &message).await {
                            debug!("Send of {} to {} failed: {}", message.kind(), peer, e);
                            break;
                        }
                    }
                }
                Some(request) = discovery_rx.recv() => {
                    discovery.handle(&mut mesh, request, &transport, Instant::now());
                }
                Some(event) = client_rx.recv() => {
                    match echo.as_mut() {
                        Some(echo) if echo.client() == event.client() => {
                            echo.handle(&mut mesh, event, Instant::now());
                        }
                        _ => debug!("Unhandled client event {:?}", event),
                    }
                }
                _ = sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    mesh.handle_timeouts(Instant::now());
                }
                _ = stats_ticker.tick() => {
                    info!("{} neighbors linked", transport.connected_peers().len());
                    mesh.stats().log();
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        mesh.stats().log();
        Ok(())
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Wakes the driver loop for neighbors with queued messages
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PeerId>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<PeerId>) -> Self {
        Self { tx }
    }
}

impl NeighborSink for ChannelSink {
    fn notify_transmit_ready(&mut self, peer: PeerId) {
        if self.tx.send(peer).is_err() {
            debug!("Driver loop gone, wakeup for {} dropped", peer);
        }
    }
}

/// Path discovery limited to direct neighbors
///
/// A search for a connected neighbor is answered at once with the one-hop
/// path; other searches stay open until that peer links up.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    searching: HashSet<PeerId>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(
        &mut self,
        mesh: &mut Mesh,
        request: DiscoveryRequest,
        transport: &Transport,
        now: Instant,
    ) {
        match request {
            DiscoveryRequest::Start(peer) => {
                if transport.is_connected(&peer) {
                    mesh.handle_path_found(peer, vec![mesh.my_id(), peer], now);
                } else {
                    debug!("No route to {} yet", peer);
                    self.searching.insert(peer);
                }
            }
            DiscoveryRequest::Stop(peer) => {
                self.searching.remove(&peer);
            }
        }
    }

    pub fn neighbor_connected(&mut self, mesh: &mut Mesh, peer: PeerId, now: Instant) {
        if self.searching.contains(&peer) {
            mesh.handle_path_found(peer, vec![mesh.my_id(), peer], now);
        }
    }
}

/// Echoes every payload back on the channel it arrived on
pub struct EchoService {
    client: ClientId,
    port: Port,
    /// Channels the engine currently accepts a send on
    allowed: HashSet<ChannelNumber>,
    backlog: HashMap<ChannelNumber, VecDeque<Vec<u8>>>,
}

impl EchoService {
    /// Register a client listening on `port`
    pub fn start(mesh: &mut Mesh, port: Port) -> Result<Self, MeshError> {
        let client = mesh.connect_client();
        mesh.open_port(client, port)?;
        info!("Echo service on port {}", port);
        Ok(Self {
            client,
            port,
            allowed: HashSet::new(),
            backlog: HashMap::new(),
        })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn handle(&mut self, mesh: &mut Mesh, event: ClientEvent, now: Instant) {
        match event {
            ClientEvent::ChannelCreated { lid, origin, .. } => {
                debug!("Echo channel {} from {} on port {}", lid, origin, self.port);
            }
            ClientEvent::ChannelDestroyed { lid, .. } => {
                self.allowed.remove(&lid);
                self.backlog.remove(&lid);
            }
            ClientEvent::Data { lid, payload, .. } => {
                self.backlog.entry(lid).or_default().push_back(payload);
                self.flush(mesh, lid, now);
                if let Err(e) = mesh.ack(self.client, lid, now) {
                    debug!("Echo ack on {} failed: {}", lid, e);
                }
            }
            ClientEvent::SendAck { lid, .. } => {
                self.allowed.insert(lid);
                self.flush(mesh, lid, now);
            }
        }
    }

    fn flush(&mut self, mesh: &mut Mesh, lid: ChannelNumber, now: Instant) {
        if !self.allowed.contains(&lid) {
            return;
        }
        let Some(payload) = self.backlog.get_mut(&lid).and_then(|q| q.pop_front()) else {
            return;
        };
        self.allowed.remove(&lid);
        if let Err(e) = mesh.send(self.client, lid, payload, now) {
            warn!("Echo on {} failed: {}", lid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PathDiscovery;
    use mesh_core::ChannelOptions;

    struct NoDiscovery;

    impl PathDiscovery for NoDiscovery {
        fn start_search(&mut self, _peer: PeerId) {}
        fn stop_search(&mut self, _peer: PeerId) {}
    }

    fn test_config(seed: Option<&str>) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            connect: vec![],
            identity_seed: seed.map(str::to_string),
            tunables: None,
            echo_port: None,
            verbose: false,
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn test_seeded_identity_is_stable() {
        let seed = "11".repeat(32);
        let a = Server::new(test_config(Some(&seed))).unwrap();
        let b = Server::new(test_config(Some(&seed))).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());

        let c = Server::new(test_config(None)).unwrap();
        assert_ne!(a.peer_id(), c.peer_id());
    }

    #[test]
    fn test_bad_seed_rejected() {
        let result = Server::new(test_config(Some("abcd")));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_sink_wakes_the_driver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        let peer = PeerId([5; 32]);

        sink.notify_transmit_ready(peer);
        assert_eq!(rx.try_recv().unwrap(), peer);

        drop(rx);
        sink.notify_transmit_ready(peer);
    }

    #[test]
    fn test_echo_over_loopback() {
        let me = PeerId([7; 32]);
        let (ready_tx, _ready_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut mesh = Mesh::new(
            me,
            MeshConfig::default(),
            Box::new(ChannelSink::new(ready_tx)),
            Box::new(NoDiscovery),
            Box::new(ChannelClient::new(client_tx)),
            now,
        );
        let mut echo = EchoService::start(&mut mesh, 7).unwrap();
        let user = mesh.connect_client();
        let lid = mesh
            .create_channel(user, me, 7, ChannelOptions::reliable(), now)
            .unwrap();

        let mut sent = false;
        let mut echoed = Vec::new();
        for _ in 0..100 {
            let Ok(event) = client_rx.try_recv() else {
                break;
            };
            if event.client() == echo.client() {
                echo.handle(&mut mesh, event, now);
                continue;
            }
            match event {
                ClientEvent::SendAck { lid: l, .. } if l == lid && !sent => {
                    mesh.send(user, lid, b"ping".to_vec(), now).unwrap();
                    sent = true;
                }
                ClientEvent::Data { lid: l, payload, .. } if l == lid => {
                    echoed.push(payload);
                    mesh.ack(user, lid, now).unwrap();
                }
                _ => {}
            }
        }

        assert!(sent);
        assert_eq!(echoed, vec![b"ping".to_vec()]);
    }
}
