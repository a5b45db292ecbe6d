use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{block::{Block, BlockInfo}, torrent::TorrentContext};

mod session;
mod message;
mod handshake;
pub mod state;

pub use session::PeerSession;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::Receiver<PeerCommand>;
pub type PeerTx = mpsc::Sender<PeerCommand>;

// Bound on each peer's inbound command queue (scheduler/supervisor -> peer).
// A full outbox means a stalled peer, handled by disconnecting rather than
// letting the sender (the scheduler) block.
pub const PEER_OUTBOX_CAPACITY: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("bitfield sent after the first post-handshake message")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,

    #[error("idle timeout, no message received")]
    IdleTimeout,
}

// Commands sent to a peer session from the scheduler or the supervisor.
pub enum PeerCommand {

    // Scheduler assigned us this block to request from the peer.
    Request(BlockInfo),

    // Tell the peer we got a piece (piece idx).
    PieceWritten(usize),

    // Block read from disk, ready to serve to the peer.
    BlockRead(Block),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Commands to the peer session (requests, have-broadcasts, shutdown).
    pub peer_tx: PeerTx,

    // Handle to the peer session task.
    pub session_handle: JoinHandle<()>,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session(socket).await {
                tracing::warn!("session error: {}", e);
            }
            session.disconnect().await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle,
        }
    }
}
