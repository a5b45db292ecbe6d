use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::{mpsc, watch}, task::JoinHandle};
use crate::{
    block::BlockInfo,
    fs,
    p2p::{PeerCommand, PeerTx},
    picker::Pieces,
    piece_state::{PieceOutcome, PieceState},
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield, ID,
};

/*
Owns every `PieceState` for the lifetime of the torrent. Peers never touch
piece data directly: they forward wire events (bitfields, haves, chokes,
block deliveries) here as typed commands and receive back only assignments
("request this block") and broadcasts ("we now have piece i"). This is the
single point where rarest-first selection, request pipelining and timeout/
corruption bookkeeping all live, with no piece data shared behind a lock.
*/

// At most this many outstanding requests per peer at once.
const MAX_PIPELINE: usize = 5;

// A requested block not delivered within this long is returned to pending
// and the peer incurs a timeout strike.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(30);

// Strikes before a peer is disconnected for each kind of misbehavior.
const TIMEOUT_STRIKES: u32 = 3;
const CORRUPTION_STRIKES: u32 = 2;

// Consecutive disk-write failures on the same piece before giving up on the
// torrent entirely; an isolated failure just makes the piece redownloadable.
const PIECE_WRITE_FAILURE_LIMIT: u32 = 3;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub type SchedulerTx = mpsc::UnboundedSender<SchedulerCommand>;
pub type SchedulerRx = mpsc::UnboundedReceiver<SchedulerCommand>;

pub enum SchedulerCommand {

    // A piece finished (or failed) its write-through to disk.
    PieceFlushed { idx: usize, ok: bool },

    // A peer session has registered itself, ready to receive assignments.
    PeerConnected { address: SocketAddr, peer_tx: PeerTx },

    // Peer sent us its full bitfield (only valid as the first post-handshake message).
    PeerBitfield { address: SocketAddr, bitfield: Bitfield },

    // Peer announced it now has a single additional piece.
    PeerHave { address: SocketAddr, idx: usize },

    // Peer choked/unchoked us.
    PeerChoked { address: SocketAddr },
    PeerUnchoked { address: SocketAddr },

    // A block we asked for arrived.
    BlockReceived { address: SocketAddr, block: BlockInfo, data: Vec<u8> },

    // Peer session ended; release anything it held.
    PeerDisconnected { address: SocketAddr },
}

struct PeerEntry {
    peer_tx: PeerTx,
    bitfield: Bitfield,
    // Peer is choking us; blocks may not be assigned to it while true.
    choked: bool,
    outstanding: HashMap<BlockInfo, Instant>,
    timeout_strikes: u32,
    corrupt_strikes: u32,
}

pub struct Scheduler {
    ctx: Arc<TorrentContext>,
    scheduler_rx: SchedulerRx,
    piece_hashes: Vec<ID>,
    pieces: Pieces,
    in_progress: HashMap<usize, PieceState>,
    // Pieces that verified in memory but haven't been confirmed written yet;
    // kept out of `in_progress` (nothing left to assemble) while still
    // `in_flight` in `pieces` (not re-selectable) until the disk replies.
    awaiting_flush: HashMap<usize, HashSet<SocketAddr>>,
    piece_failures: HashMap<usize, u32>,
    peers: HashMap<SocketAddr, PeerEntry>,
    completed_tx: watch::Sender<Bitfield>,
    num_pieces: usize,
}

pub fn spawn(
    ctx: Arc<TorrentContext>,
    scheduler_rx: SchedulerRx,
    piece_hashes: Vec<ID>,
    resume: Bitfield,
    completed_tx: watch::Sender<Bitfield>,
) -> JoinHandle<()> {
    let num_pieces = piece_hashes.len();
    let mut pieces = Pieces::new(num_pieces);
    pieces.set_own_bitfield(resume);
    let scheduler = Scheduler {
        ctx,
        scheduler_rx,
        piece_hashes,
        pieces,
        in_progress: HashMap::new(),
        awaiting_flush: HashMap::new(),
        piece_failures: HashMap::new(),
        peers: HashMap::new(),
        completed_tx,
        num_pieces,
    };
    tokio::spawn(scheduler.run())
}

impl Scheduler {

    #[tracing::instrument(name = "scheduler", skip_all)]
    async fn run(mut self) {
        if self.pieces.all() {
            tracing::info!("all pieces already present on disk, nothing to download");
        }

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                cmd = self.scheduler_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep_timeouts(),
            }
        }
        tracing::info!("scheduler shutting down");
    }

    fn handle(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::PieceFlushed { idx, ok } => self.on_piece_flushed(idx, ok),
            SchedulerCommand::PeerConnected { address, peer_tx } => {
                self.peers.insert(address, PeerEntry {
                    peer_tx,
                    bitfield: Bitfield::repeat(false, self.num_pieces),
                    choked: true,
                    outstanding: HashMap::new(),
                    timeout_strikes: 0,
                    corrupt_strikes: 0,
                });
            }
            SchedulerCommand::PeerBitfield { address, bitfield } => {
                self.pieces.bitfield_update(&bitfield);
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.bitfield = bitfield;
                }
                self.fill_for_peer(address);
            }
            SchedulerCommand::PeerHave { address, idx } => {
                self.pieces.increment_piece(idx);
                if let Some(peer) = self.peers.get_mut(&address) {
                    if idx < peer.bitfield.len() {
                        peer.bitfield.set(idx, true);
                    }
                }
                self.fill_for_peer(address);
            }
            SchedulerCommand::PeerChoked { address } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.choked = true;
                    for (block, _) in peer.outstanding.drain() {
                        if let Some(piece) = self.in_progress.get_mut(&block.piece_idx) {
                            piece.free_block(block);
                        }
                    }
                }
            }
            SchedulerCommand::PeerUnchoked { address } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.choked = false;
                }
                self.fill_for_peer(address);
            }
            SchedulerCommand::BlockReceived { address, block, data } => {
                self.on_block_received(address, block, data);
            }
            SchedulerCommand::PeerDisconnected { address } => {
                if let Some(peer) = self.peers.remove(&address) {
                    self.release_peer(peer);
                }
            }
        }
    }

    fn on_block_received(&mut self, address: SocketAddr, block: BlockInfo, data: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&address) else { return };
        if peer.outstanding.remove(&block).is_none() {
            // Not something we asked this peer for: stale cancel race or a
            // duplicate delivery. Drop silently.
            return;
        }
        let Some(piece) = self.in_progress.get_mut(&block.piece_idx) else { return };
        piece.mark_received(block, data, address);

        match piece.maybe_complete() {
            PieceOutcome::Incomplete => {}
            PieceOutcome::Complete(buf, contributors) => {
                self.in_progress.remove(&block.piece_idx);
                self.awaiting_flush.insert(block.piece_idx, contributors);
                self.ctx.disk_tx.send(fs::CommandToDisk::WritePiece { idx: block.piece_idx, data: buf }).ok();
            }
            PieceOutcome::Corrupt(contributors) => {
                tracing::warn!("piece {} failed hash verification, blaming {} peer(s)", block.piece_idx, contributors.len());
                for addr in contributors {
                    self.strike_corruption(addr);
                }
            }
        }

        self.fill_for_peer(address);
    }

    fn strike_corruption(&mut self, address: SocketAddr) {
        let disconnect = if let Some(peer) = self.peers.get_mut(&address) {
            peer.corrupt_strikes += 1;
            peer.corrupt_strikes >= CORRUPTION_STRIKES
        } else {
            false
        };
        if disconnect {
            self.disconnect_peer(address, "too many corrupt pieces");
        }
    }

    fn on_piece_flushed(&mut self, idx: usize, ok: bool) {
        self.awaiting_flush.remove(&idx);
        if ok {
            self.piece_failures.remove(&idx);
            self.pieces.received_piece(idx);
            self.completed_tx.send_replace(self.pieces.own_bitfield().clone());

            if self.pieces.all() {
                tracing::info!("torrent fully downloaded and verified");
                self.ctx.torrent_tx.send(CommandToTorrent::DownloadComplete).ok();
            } else {
                let addresses: Vec<SocketAddr> = self.peers.keys().copied().collect();
                for address in addresses {
                    self.send_to_peer(address, PeerCommand::PieceWritten(idx));
                }
            }
        } else {
            self.pieces.release_piece(idx);
            let failures = self.piece_failures.entry(idx).or_insert(0);
            *failures += 1;
            tracing::error!("failed to write piece {} to disk ({} consecutive failures)", idx, failures);
            if *failures >= PIECE_WRITE_FAILURE_LIMIT {
                self.ctx.torrent_tx.send(CommandToTorrent::Fatal(
                    format!("piece {idx} could not be written to disk after {failures} attempts")
                )).ok();
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let mut disconnect = Vec::new();

        for (&address, peer) in self.peers.iter_mut() {
            let stale: Vec<BlockInfo> = peer.outstanding.iter()
                .filter(|&(_, &at)| now.duration_since(at) >= BLOCK_TIMEOUT)
                .map(|(&block, _)| block)
                .collect();

            for block in stale {
                peer.outstanding.remove(&block);
                peer.timeout_strikes += 1;
                if let Some(piece) = self.in_progress.get_mut(&block.piece_idx) {
                    piece.free_block(block);
                }
            }
            if peer.timeout_strikes >= TIMEOUT_STRIKES {
                disconnect.push(address);
            }
        }

        for address in disconnect {
            self.disconnect_peer(address, "too many request timeouts");
        }
        self.fill_pipelines();
    }

    fn disconnect_peer(&mut self, address: SocketAddr, reason: &str) {
        if let Some(peer) = self.peers.remove(&address) {
            tracing::warn!("disconnecting {}: {}", address, reason);
            peer.peer_tx.try_send(PeerCommand::Shutdown).ok();
            self.release_peer(peer);
        }
    }

    // The per-peer outbox is bounded; a full outbox means a stalled peer
    // and is handled by disconnecting it rather than blocking the scheduler.
    // A closed outbox just means the session already ended.
    fn send_to_peer(&mut self, address: SocketAddr, cmd: PeerCommand) {
        let Some(peer) = self.peers.get(&address) else { return };
        match peer.peer_tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.disconnect_peer(address, "outbox full, peer appears stalled");
            }
        }
    }

    // Common cleanup whether the peer left on its own or we evicted it:
    // fold its bitfield back out of availability and return anything it had
    // outstanding to its piece's pending set.
    fn release_peer(&mut self, peer: PeerEntry) {
        for idx in 0..peer.bitfield.len() {
            if peer.bitfield[idx] {
                self.pieces.decrement_piece(idx);
            }
        }
        for (block, _) in peer.outstanding {
            if let Some(piece) = self.in_progress.get_mut(&block.piece_idx) {
                piece.free_block(block);
            }
        }
    }

    fn fill_pipelines(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for address in addrs {
            self.fill_for_peer(address);
        }
    }

    // Assigns as many new requests as the peer's pipeline has room for:
    // first by continuing any piece already in flight that this peer has,
    // then by starting fresh pieces via rarest-first selection.
    fn fill_for_peer(&mut self, address: SocketAddr) {
        let Some(peer) = self.peers.get(&address) else { return };
        if peer.choked {
            return;
        }
        let mut need = MAX_PIPELINE.saturating_sub(peer.outstanding.len());
        if need == 0 {
            return;
        }
        let peer_bf = peer.bitfield.clone();
        let now = Instant::now();
        let mut assigned = Vec::with_capacity(need);

        let in_progress_indices: Vec<usize> = self.in_progress.keys().copied().collect();
        for idx in in_progress_indices {
            if need == 0 {
                break;
            }
            if !*peer_bf.get(idx).as_deref().unwrap_or(&false) {
                continue;
            }
            let piece = self.in_progress.get_mut(&idx).expect("idx from own key set");
            for block in piece.next_missing_blocks(need, now, BLOCK_TIMEOUT) {
                assigned.push(block);
                need -= 1;
            }
        }

        while need > 0 {
            let Some(idx) = self.pieces.pick_piece(&peer_bf) else { break };
            let piece_len = self.ctx.info.piece_length(idx);
            let piece = self.in_progress.entry(idx)
                .or_insert_with(|| PieceState::new(idx, piece_len, self.piece_hashes[idx]));
            let blocks = piece.next_missing_blocks(need, now, BLOCK_TIMEOUT);
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                assigned.push(block);
                need -= 1;
            }
        }

        if assigned.is_empty() {
            return;
        }

        let peer = self.peers.get_mut(&address).expect("checked above");
        for &block in &assigned {
            peer.outstanding.insert(block, now);
        }

        for block in assigned {
            self.send_to_peer(address, PeerCommand::Request(block));
        }
    }
}
