use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_util::codec::Framed;
use tracing::Instrument;

use crate::{
    block::{BlockData, BlockInfo},
    Bitfield,
};

mod handshake;
mod message;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("peer sent an unsupported protocol identifier")]
    IncorrectProtocol,

    #[error("peer's info hash does not match ours")]
    IncorrectInfoHash,

    #[error("connection closed before a handshake was received")]
    NoHandshake,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield received outside of the introduction phase")]
    UnexpectedBitfield,

    #[error("malformed message")]
    InvalidMessage,

    #[error("peer timed out")]
    Timeout,
}

/// Events a peer session reports up to the coordinator. The coordinator
/// never reaches into a session directly; sessions only ever produce these.
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    Unconnected,
    Bitfield(Bitfield),
    Has(u32),
    Choked,
    Unchoked,
    Block { index: usize, begin: usize, data: Vec<u8> },
    // Accepted per the wire protocol but a no-op for this coordinator: it
    // never serves uploads, so there is nothing to act on when a peer
    // expresses interest, loses interest, requests, or cancels a request.
    Interested,
    NotInterested,
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

pub type PeerEventTx = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventRx = mpsc::UnboundedReceiver<PeerEvent>;

/// Commands the coordinator issues to a peer session.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    Interested,
    NotInterested,
    Request(BlockInfo),
    Drop,
}

/// Coordinator-facing handle to one peer connection. Command delivery is
/// fire-and-forget: the coordinator never blocks on a peer.
pub trait PeerConnection: Send + Sync {
    fn addr(&self) -> SocketAddr;
    fn interested(&self);
    fn not_interested(&self);
    fn request(&self, block: BlockInfo);
    fn drop_connection(&self);
    fn is_interested(&self) -> bool;
    fn is_peer_choked(&self) -> bool;
}

struct PeerHandleState {
    interested: AtomicBool,
    peer_choked: AtomicBool,
}

/// Real `PeerConnection`: a command channel into the session task plus the
/// locally cached flags `is_interested`/`is_peer_choked` reflect.
pub struct TcpPeerConnection {
    addr: SocketAddr,
    command_tx: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<PeerHandleState>,
    _session: JoinHandle<()>,
}

impl PeerConnection for TcpPeerConnection {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn interested(&self) {
        self.state.interested.store(true, Ordering::Relaxed);
        let _ = self.command_tx.send(PeerCommand::Interested);
    }

    fn not_interested(&self) {
        self.state.interested.store(false, Ordering::Relaxed);
        let _ = self.command_tx.send(PeerCommand::NotInterested);
    }

    fn request(&self, block: BlockInfo) {
        let _ = self.command_tx.send(PeerCommand::Request(block));
    }

    fn drop_connection(&self) {
        let _ = self.command_tx.send(PeerCommand::Drop);
    }

    fn is_interested(&self) -> bool {
        self.state.interested.load(Ordering::Relaxed)
    }

    fn is_peer_choked(&self) -> bool {
        self.state.peer_choked.load(Ordering::Relaxed)
    }
}

/// Opens outbound peer connections on the coordinator's behalf.
#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn PeerConnection>, PeerError>;
}

pub struct TcpPeerConnector {
    info_hash: [u8; 20],
    client_id: [u8; 20],
    event_tx: PeerEventTx,
}

impl TcpPeerConnector {
    pub fn new(info_hash: [u8; 20], client_id: [u8; 20], event_tx: PeerEventTx) -> Self {
        Self { info_hash, client_id, event_tx }
    }
}

#[async_trait::async_trait]
impl PeerConnector for TcpPeerConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn PeerConnection>, PeerError> {
        let socket = TcpStream::connect(addr).await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(PeerHandleState {
            interested: AtomicBool::new(false),
            peer_choked: AtomicBool::new(true),
        });

        let session_state = state.clone();
        let event_tx = self.event_tx.clone();
        let info_hash = self.info_hash;
        let client_id = self.client_id;

        let session = tokio::spawn(
            async move {
                if let Err(e) =
                    run_session(addr, socket, info_hash, client_id, event_tx.clone(), command_rx, session_state)
                        .await
                {
                    tracing::warn!(%addr, error = %e, "peer session ended with error");
                }
                let _ = event_tx.send(PeerEvent { addr, kind: PeerEventKind::Unconnected });
            }
            .instrument(tracing::info_span!("peer_session", %addr)),
        );

        Ok(Box::new(TcpPeerConnection { addr, command_tx, state, _session: session }))
    }
}

#[tracing::instrument(skip(socket, event_tx, command_rx, state))]
async fn run_session(
    addr: SocketAddr,
    socket: TcpStream,
    info_hash: [u8; 20],
    client_id: [u8; 20],
    event_tx: PeerEventTx,
    mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
    state: Arc<PeerHandleState>,
) -> Result<(), PeerError> {
    let mut handshake_io = Framed::new(socket, HandshakeCodec);
    handshake_io.send(Handshake::new(info_hash, client_id)).await?;
    let handshake = handshake_io.next().await.ok_or(PeerError::NoHandshake)??;
    if handshake.info_hash != info_hash {
        return Err(PeerError::IncorrectInfoHash);
    }

    let mut stream = Framed::new(handshake_io.into_inner(), MessageCodec);
    let mut bitfield_received = false;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(msg) => msg?,
                    None => return Ok(()),
                };
                match msg {
                    Message::KeepAlive => {}
                    Message::Choke => {
                        state.peer_choked.store(true, Ordering::Relaxed);
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::Choked }).ok();
                    }
                    Message::Unchoke => {
                        state.peer_choked.store(false, Ordering::Relaxed);
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::Unchoked }).ok();
                    }
                    Message::Interested => {
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::Interested }).ok();
                    }
                    Message::NotInterested => {
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::NotInterested }).ok();
                    }
                    Message::Have { idx } => {
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::Has(idx) }).ok();
                    }
                    Message::Bitfield(bf) => {
                        if bitfield_received {
                            return Err(PeerError::UnexpectedBitfield);
                        }
                        bitfield_received = true;
                        event_tx.send(PeerEvent { addr, kind: PeerEventKind::Bitfield(bf) }).ok();
                    }
                    Message::Block(BlockData { piece_idx, offset, data }) => {
                        event_tx.send(PeerEvent {
                            addr,
                            kind: PeerEventKind::Block { index: piece_idx, begin: offset, data },
                        }).ok();
                    }
                    // This coordinator never serves uploads: requests and cancels from
                    // peers are accepted (to keep the connection alive) and ignored.
                    Message::Request(_) | Message::Cancel(_) => {}
                    Message::Port { .. } => {}
                }
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(PeerCommand::Interested) => stream.send(Message::Interested).await?,
                    Some(PeerCommand::NotInterested) => stream.send(Message::NotInterested).await?,
                    Some(PeerCommand::Request(block)) => {
                        stream.send(Message::Request(BlockInfo {
                            piece_idx: block.piece_idx,
                            offset: block.offset,
                            len: block.len,
                        })).await?;
                    }
                    Some(PeerCommand::Drop) | None => return Ok(()),
                }
            }
        }
    }
}
