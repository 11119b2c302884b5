//! TCP transport between directly connected peers
//!
//! Each link starts with a challenge-response hello in both directions: each
//! side sends a fresh nonce and proves its key by signing the nonce it
//! received. The link then carries framed connection messages. A reader task turns frames into
//! [`TransportEvent`]s; a writer task drains the link's outgoing queue.

use crate::crypto::KeyPair;
use crate::framing::{Frame, FrameCodec, FrameError, FrameType};
use crate::peer::{PeerId, PeerInfo};
use bytes::BytesMut;
use mesh_core::ConnectionMessage;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

/// Domain prefix for hello signatures
const DOMAIN_HELLO: &[u8] = b"mesh-hello";

/// Outgoing frames buffered per link
const LINK_QUEUE_SIZE: usize = 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Already connected to peer: {0}")]
    AlreadyConnected(PeerId),
}

/// First handshake message: the nonce the other side must sign
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Challenge {
    nonce: [u8; 32],
}

impl Challenge {
    fn new() -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill(&mut nonce);
        Self { nonce }
    }
}

/// Second handshake message: our key and a signature over the received challenge
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Hello {
    public_key: [u8; 32],
    signature: Vec<u8>,
}

impl Hello {
    fn signed_bytes(public_key: &[u8; 32], challenge: &Challenge) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DOMAIN_HELLO.len() + 64);
        bytes.extend_from_slice(DOMAIN_HELLO);
        bytes.extend_from_slice(public_key);
        bytes.extend_from_slice(&challenge.nonce);
        bytes
    }

    fn answer(keypair: &KeyPair, challenge: &Challenge) -> Self {
        let public_key = keypair.public_key();
        let signature = keypair.sign(&Self::signed_bytes(&public_key, challenge)).to_vec();
        Self {
            public_key,
            signature,
        }
    }

    /// Check the answer to the challenge we sent
    fn verify(&self, challenge: &Challenge) -> Result<PeerId, TransportError> {
        let signature: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| TransportError::Handshake("bad signature length".into()))?;
        KeyPair::verify(
            &self.public_key,
            &Self::signed_bytes(&self.public_key, challenge),
            &signature,
        )
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(PeerId::from_public_key(&self.public_key))
    }
}

async fn write_handshake<T: Serialize>(
    write_half: &mut OwnedWriteHalf,
    codec: &mut FrameCodec,
    message: &T,
) -> Result<(), TransportError> {
    let payload = postcard::to_allocvec(message).map_err(|e| TransportError::Handshake(e.to_string()))?;
    let mut out = BytesMut::new();
    codec.encode(Frame::new(FrameType::Hello, payload), &mut out)?;
    write_half.write_all(&out).await?;
    Ok(())
}

async fn read_handshake<T: for<'de> Deserialize<'de>>(
    read_half: &mut OwnedReadHalf,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
) -> Result<T, TransportError> {
    let frame = loop {
        if let Some(frame) = codec.decode(buf)? {
            break frame;
        }
        if read_half.read_buf(buf).await? == 0 {
            return Err(TransportError::ConnectionClosed);
        }
    };
    if frame.frame_type != FrameType::Hello {
        return Err(TransportError::Handshake(format!(
            "expected hello, got {:?}",
            frame.frame_type
        )));
    }
    postcard::from_bytes(&frame.payload).map_err(|e| TransportError::Handshake(e.to_string()))
}

/// Link to a directly connected peer
pub struct Link {
    /// Remote peer
    pub peer: PeerId,
    /// Send channel
    tx: mpsc::Sender<Frame>,
    /// Is the link open
    open: Arc<RwLock<bool>>,
    /// Wakes the reader when the link is closed locally
    closed: Notify,
}

impl Link {
    /// Queue a frame for this peer
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !*self.open.read() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Check if link is open
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Close the link
    pub fn close(&self) {
        *self.open.write() = false;
        self.closed.notify_one();
    }
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// Neighbor link established
    NeighborConnected(PeerId),
    /// Neighbor link lost
    NeighborDisconnected(PeerId),
    /// Connection message received from a neighbor
    MessageReceived {
        from: PeerId,
        message: ConnectionMessage,
    },
}

/// Transport layer managing neighbor links
pub struct Transport {
    /// Our keypair
    keypair: KeyPair,
    /// Our peer ID
    our_id: PeerId,
    /// Listen address
    listen_addr: SocketAddr,
    /// Open links
    links: RwLock<HashMap<PeerId, Arc<Link>>>,
    /// Known peers (may not be connected)
    known_peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl Transport {
    /// Create a new transport
    pub fn new(keypair: KeyPair, listen_addr: SocketAddr) -> Self {
        let our_id = PeerId::from_public_key(&keypair.public_key());
        Self {
            keypair,
            our_id,
            listen_addr,
            links: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(HashMap::new()),
        }
    }

    /// Get our peer ID
    pub fn our_id(&self) -> PeerId {
        self.our_id
    }

    /// Get our public key
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Get a known peer
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.known_peers.read().get(id).cloned()
    }

    /// List connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links.read().keys().copied().collect()
    }

    /// Check if connected to a peer
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.links
            .read()
            .get(id)
            .map(|l| l.is_open())
            .unwrap_or(false)
    }

    /// Send a connection message to a neighbor
    pub async fn send(&self, to: &PeerId, message: &ConnectionMessage) -> Result<(), TransportError> {
        let link = self
            .links
            .read()
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(*to))?;

        link.send(Frame::from_message(message)?).await
    }

    /// Drop the link to a neighbor
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some(link) = self.links.write().remove(peer) {
            link.close();
        }
    }

    /// Accept neighbor links until the listener fails
    pub async fn run(
        self: Arc<Self>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("Transport listening on {}", listener.local_addr()?);
        self.serve(listener, event_tx).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let transport = Arc::clone(&self);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.establish(stream, addr, event_tx).await {
                    warn!("Inbound link from {} failed: {}", addr, e);
                }
            });
        }
    }

    /// Dial a neighbor
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<PeerId, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        Arc::clone(self).establish(stream, addr, event_tx).await
    }

    async fn establish(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<PeerId, TransportError> {
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::with_capacity(4096);

        let ours = Challenge::new();
        write_handshake(&mut write_half, &mut codec, &ours).await?;
        let theirs: Challenge = read_handshake(&mut read_half, &mut codec, &mut buf).await?;
        if theirs.nonce == ours.nonce {
            return Err(TransportError::Handshake("challenge reflected".into()));
        }
        write_handshake(&mut write_half, &mut codec, &Hello::answer(&self.keypair, &theirs)).await?;
        let hello: Hello = read_handshake(&mut read_half, &mut codec, &mut buf).await?;
        let peer = hello.verify(&ours)?;
        if peer == self.our_id {
            return Err(TransportError::Handshake("connected to self".into()));
        }

        let (tx, rx) = mpsc::channel(LINK_QUEUE_SIZE);
        let link = Arc::new(Link {
            peer,
            tx,
            open: Arc::new(RwLock::new(true)),
            closed: Notify::new(),
        });
        {
            let mut links = self.links.write();
            if links.get(&peer).map(|l| l.is_open()).unwrap_or(false) {
                return Err(TransportError::AlreadyConnected(peer));
            }
            links.insert(peer, Arc::clone(&link));
        }
        self.known_peers
            .write()
            .entry(peer)
            .or_insert_with(|| PeerInfo::new(hello.public_key, vec![]))
            .add_addr(addr);

        info!("Link up with {} at {}", peer, addr);
        let _ = event_tx.send(TransportEvent::NeighborConnected(peer)).await;

        tokio::spawn(write_loop(write_half, rx));
        tokio::spawn(Arc::clone(&self).read_loop(read_half, buf, link, event_tx));
        Ok(peer)
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        mut buf: BytesMut,
        link: Arc<Link>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) {
        let peer = link.peer;
        let mut codec = FrameCodec::new();
        'link: while link.is_open() {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if frame.frame_type == FrameType::Hello {
                            debug!("Ignoring repeated hello from {}", peer);
                            continue;
                        }
                        match frame.to_message() {
                            Ok(message) => {
                                if let Some(info) = self.known_peers.write().get_mut(&peer) {
                                    info.touch();
                                }
                                let event = TransportEvent::MessageReceived { from: peer, message };
                                if event_tx.send(event).await.is_err() {
                                    break 'link;
                                }
                            }
                            Err(e) => warn!("Malformed {:?} from {}: {}", frame.frame_type, peer, e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Framing error from {}: {}", peer, e);
                        break 'link;
                    }
                }
            }
            tokio::select! {
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error from {}: {}", peer, e);
                        break;
                    }
                },
                _ = link.closed.notified() => break,
            }
        }

        link.close();
        {
            let mut links = self.links.write();
            if links.get(&peer).map(|l| Arc::ptr_eq(l, &link)).unwrap_or(false) {
                links.remove(&peer);
            }
        }
        info!("Link down with {}", peer);
        let _ = event_tx.send(TransportEvent::NeighborDisconnected(peer)).await;
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    let mut codec = FrameCodec::new();
    let mut out = BytesMut::new();
    while let Some(frame) = rx.recv().await {
        if let Err(e) = codec.encode(frame, &mut out) {
            warn!("Dropping unencodable frame: {}", e);
            continue;
        }
        if write_half.write_all(&out).await.is_err() {
            break;
        }
        out.clear();
    }
    let _ = write_half.shutdown().await;
}
