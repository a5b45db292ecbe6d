use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    block::{Block, BlockInfo},
    scheduler::SchedulerCommand,
    torrent::{CommandToTorrent, TorrentContext},
    Bitfield,
};
use super::{
    PeerCommand, PeerError, PeerRx, PeerTx, Result,
    message::{self, Message},
    handshake::{Handshake, HandshakeCodec, PROTOCOL},
    state::{ConnState, SessionState},
    PEER_OUTBOX_CAPACITY,
};

type MessageSink = SplitSink<Framed<TcpStream, message::MessageCodec>, Message>;

// No message of any kind (including keep-alives) for this long closes the
// connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// Send a keep-alive after this long without sending anything else.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct PeerSession {

    address: SocketAddr,

    ctx: Arc<TorrentContext>,

    peer_rx: PeerRx,

    // Our own outbox sender, cloned into the scheduler/supervisor on
    // connect and handed back to ourselves for requests we serve (disk
    // replies route back through this same channel).
    peer_tx: PeerTx,

    // Pieces the peer has told us about.
    bitfield: Bitfield,

    // Pending requests the peer made of us, so we can match disk replies.
    requests_in: std::collections::HashSet<BlockInfo>,

    state: SessionState,

    // Whether we've processed any message yet; a bitfield is only legal as
    // the very first one.
    seen_first_message: bool,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {
        let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(PEER_OUTBOX_CAPACITY);
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                requests_in: std::collections::HashSet::new(),
                state: SessionState::default(),
                seen_first_message: false,
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.conn_state = ConnState::Dialing;
        let inbound = inbound_stream.is_some();

        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.state.conn_state = ConnState::Handshaking;
        self.exchange_handshake(&mut socket, inbound).await?;

        self.state.conn_state = ConnState::Active;
        let now = Instant::now();
        self.state.note_received(now);
        self.state.note_sent(now);
        self.ctx.scheduler_tx.send(SchedulerCommand::PeerConnected {
            address: self.address,
            peer_tx: self.peer_tx.clone(),
        }).ok();

        let socket = Framed::new(socket.into_inner(), message::MessageCodec);
        self.run(socket).await
    }

    pub async fn disconnect(&mut self) {
        let reached_active = self.state.conn_state == ConnState::Active;
        self.state.conn_state = ConnState::Closed;
        if reached_active {
            self.ctx.scheduler_tx.send(SchedulerCommand::PeerDisconnected { address: self.address }).ok();
        }
        self.ctx.torrent_tx.send(CommandToTorrent::PeerGone {
            address: self.address,
            reached_active,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        if !inbound {
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        if let Some(Ok(handshake)) = socket.next().await {
            if handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if handshake.info_hash != self.ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }

            if inbound {
                let reply = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
                socket.send(reply).await?;
            }

            tracing::info!("handshake successful, peer connected");
            Ok(())
        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, message::MessageCodec>) -> Result<()> {

        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(30));

        loop { tokio::select! {

            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => self.handle_msg(&mut sink, msg).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::info!("peer closed connection");
                        return Ok(());
                    }
                }
            }

            cmd = self.peer_rx.recv() => {
                match cmd {
                    Some(PeerCommand::Request(block)) => self.send_request(&mut sink, block).await?,
                    Some(PeerCommand::BlockRead(block)) => self.send_block(&mut sink, block).await?,
                    Some(PeerCommand::PieceWritten(idx)) => self.handle_written_piece(&mut sink, idx).await?,
                    Some(PeerCommand::Shutdown) | None => {
                        tracing::info!("session shutdown");
                        return Ok(());
                    }
                }
            }

            _ = ticker.tick() => self.tick(&mut sink).await?,

        }}
    }

    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await?;
        self.state.note_sent(Instant::now());
        Ok(())
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);
        self.state.note_received(Instant::now());

        match msg {
            Message::Bitfield(bitfield) => {
                if self.seen_first_message {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bitfield).await?;
            }
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.ctx.scheduler_tx.send(SchedulerCommand::PeerChoked { address: self.address }).ok();
                }
            }
            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    self.ctx.scheduler_tx.send(SchedulerCommand::PeerUnchoked { address: self.address }).ok();
                }
            }
            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                }
                if self.state.am_choking {
                    self.state.am_choking = false;
                    self.send_message(sink, Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                self.state.peer_interested = false;
                if !self.state.am_choking {
                    self.state.am_choking = true;
                    self.send_message(sink, Message::Choke).await?;
                }
            }
            Message::Have { idx } => self.handle_have(sink, idx).await?,
            Message::Request(request) => self.handle_request(request).await?,
            Message::Block(block) => self.handle_block(block).await?,
            Message::Cancel(request) => { self.requests_in.remove(&request); }
            Message::Port { .. } => {} // No DHT node to register the peer's listening port with.
        }

        self.seen_first_message = true;
        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.ctx.info.num_pieces as usize;
        if bitfield.len() < num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        bitfield.resize(num_pieces, false);
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        self.bitfield = bitfield.clone();
        self.ctx.scheduler_tx.send(SchedulerCommand::PeerBitfield { address: self.address, bitfield }).ok();
        self.update_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx as usize >= self.ctx.info.num_pieces as usize {
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.ctx.scheduler_tx.send(SchedulerCommand::PeerHave { address: self.address, idx: idx as usize }).ok();
        self.update_interest(sink).await
    }

    // We've become interested iff the peer has a piece we don't, per the
    // latest snapshot of our completed set.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let completed = self.ctx.completed.borrow().clone();
        let interested = self.bitfield.iter().by_vals().enumerate()
            .any(|(i, has)| has && !*completed.get(i).as_deref().unwrap_or(&true));

        if interested && !self.state.am_interested {
            self.state.am_interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if !interested && self.state.am_interested {
            self.state.am_interested = false;
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    fn validate_block(&self, block: &BlockInfo) -> bool {
        let num_pieces = self.ctx.info.num_pieces as usize;
        if block.piece_idx >= num_pieces || block.len == 0 || block.len > crate::BLOCK_SIZE {
            return false;
        }
        let piece_len = self.ctx.info.piece_length(block.piece_idx);
        block.offset.checked_add(block.len).map_or(false, |end| end <= piece_len)
    }

    async fn handle_request(&mut self, request: BlockInfo) -> Result<()> {
        if self.state.am_choking {
            // Peer is choked and shouldn't be requesting; ignore rather than
            // tear down the connection over a benign race.
            return Ok(());
        }
        if !self.validate_block(&request) {
            return Err(PeerError::InvalidMessage);
        }
        if !self.requests_in.insert(request) {
            return Ok(());
        }
        self.ctx.disk_tx.send(crate::fs::CommandToDisk::ReadBlock {
            block: request,
            tx: self.peer_tx.clone(),
        }).ok();
        Ok(())
    }

    async fn handle_block(&mut self, block: crate::block::BlockData) -> Result<()> {
        let info = BlockInfo { piece_idx: block.piece_idx, offset: block.offset, len: block.data.len() };
        if !self.validate_block(&info) {
            return Err(PeerError::InvalidMessage);
        }
        self.state.throughput.down += block.data.len() as u64;
        self.ctx.scheduler_tx.send(SchedulerCommand::BlockReceived {
            address: self.address,
            block: info,
            data: block.data,
        }).ok();
        Ok(())
    }

    async fn send_request(&mut self, sink: &mut MessageSink, block: BlockInfo) -> Result<()> {
        self.send_message(sink, Message::Request(block)).await
    }

    async fn send_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {
        let info = BlockInfo { piece_idx: block.piece_idx, offset: block.offset, len: block.data.len() };
        if !self.requests_in.remove(&info) {
            // Peer cancelled or disconnected before the disk read completed.
            return Ok(());
        }
        self.state.throughput.up += block.data.len() as u64;
        self.send_message(sink, Message::Block(crate::block::BlockData {
            piece_idx: block.piece_idx,
            offset: block.offset,
            data: (*block.data).clone(),
        })).await
    }

    // Sent to every `Active` peer regardless of whether their bitfield
    // already showed this piece — harmless and prescribed, so peers can't
    // use our silence to infer anything about timing.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        self.send_message(sink, Message::Have { idx: idx as u32 }).await
    }

    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        if self.state.is_idle(now, IDLE_TIMEOUT) {
            return Err(PeerError::IdleTimeout);
        }
        if self.state.needs_keepalive(now, KEEPALIVE_INTERVAL) {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        self.ctx.torrent_tx.send(CommandToTorrent::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
        self.state.tick();

        Ok(())
    }
}
