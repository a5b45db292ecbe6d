use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use crate::{
    config::{ClientConfig, TorrentConfig},
    fs,
    metainfo::MetaInfo,
    p2p::{self, PeerCommand, PeerHandle},
    scheduler::{self, SchedulerTx},
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::StoreInfo,
    tracker::{self, AnnounceParams, Event, TrackerSet},
    Bitfield, ID,
};

/*
The swarm supervisor. Owns peer lifecycle (dialing, accepting, capping,
replacing dead peers) and the tracker announce cadence; delegates piece
selection to the scheduler task and file I/O to the disk task, reaching both
only via the channels carried in `TorrentContext`.
*/

const MAINTAIN_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
// How long to wait for at least one peer before giving up on the session;
// mirrors the "tracker contact exhausted with zero peers" exit condition.
const NO_PEER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum TorrentError {

    #[error(transparent)]
    Disk(#[from] fs::DiskError),

    #[error("failed to bind listen address: {0}")]
    Bind(#[source] std::io::Error),

    #[error("tracker contact exhausted with zero peers obtained")]
    NoPeersObtained,

    #[error("fatal storage error: {0}")]
    Fatal(String),

    #[error("interrupted")]
    Interrupted,

}

pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands sent to the supervisor from peer sessions or the scheduler.
pub enum CommandToTorrent {

    // Every piece has verified and been flushed to disk.
    DownloadComplete,

    // Storage failed enough times on one piece that the session can't continue.
    Fatal(String),

    // A periodic snapshot of a peer's session state, for stats and liveness.
    PeerState { address: SocketAddr, state: p2p::state::SessionState },

    // A peer session ended. `reached_active` distinguishes a dial/handshake
    // failure (eligible for a dial cooldown) from an ordinary disconnect.
    PeerGone { address: SocketAddr, reached_active: bool },

    Shutdown,

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Started,
    Downloading,
    Seeding,
    Stopped,
}

// Read-only, shared with every peer session and the scheduler.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub scheduler_tx: SchedulerTx,

    pub torrent_tx: TorrentTx,

    pub disk_tx: fs::DiskTx,

    pub info: StoreInfo,

    // Snapshot of the scheduler's completed-piece bitmap, used by peer
    // sessions to compute `am_interested` without round-tripping a message.
    pub completed: watch::Receiver<Bitfield>,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    config: TorrentConfig,

    listener: TcpListener,

    listen_port: u16,

    torrent_rx: TorrentRx,

    discovered_rx: tracker::PeerRx,

    active_peers: HashMap<SocketAddr, PeerHandle>,

    // Tracker-discovered addresses not yet dialed.
    candidates: VecDeque<SocketAddr>,
    queued: HashSet<SocketAddr>,
    cooldown: HashMap<SocketAddr, Instant>,

    peer_stats: HashMap<SocketAddr, PeerStats>,
    // Cumulative totals folded in from peers that have since disconnected;
    // `total_throughput` adds these to the still-connected peers' own
    // cumulative counters so announce's uploaded/downloaded never regress.
    disconnected_throughput: ThroughputStats,

    scheduler_handle: JoinHandle<()>,
    disk_handle: JoinHandle<fs::Result<()>>,
    tracker_handle: JoinHandle<()>,
    tracker_params_tx: tracker::TrackerTx,

    state: TorrentState,
    start_time: Instant,

    fatal: Option<String>,
    interrupted: bool,
    no_peers: bool,
    no_peer_deadline: Option<Instant>,
    // Set once every piece has downloaded and verified, for leech-only
    // sessions (`config.seed == false`); the run loop exits on the next
    // iteration rather than seeding indefinitely.
    finished: bool,

}

impl Torrent {

    pub async fn new(metainfo: MetaInfo, client: &ClientConfig, config: TorrentConfig) -> Result<Self, TorrentError> {

        let info_hash = metainfo.info_hash();
        let piece_hashes = metainfo.piece_hashes();
        let store_info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let tiers = metainfo.tracker_tiers();

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let (disk_handle, disk_tx, resume) =
            fs::spawn(store_info.clone(), piece_hashes.clone(), scheduler_tx.clone()).await?;

        let (completed_tx, completed_rx) = watch::channel(resume.clone());

        let ctx = Arc::new(TorrentContext {
            info_hash,
            client_id: client.client_id,
            scheduler_tx,
            torrent_tx,
            disk_tx,
            info: store_info,
            completed: completed_rx,
        });

        let scheduler_handle = scheduler::spawn(ctx.clone(), scheduler_rx, piece_hashes, resume, completed_tx);

        let listener = Self::bind_listener(config.listen_address).await.map_err(TorrentError::Bind)?;
        let listen_port = listener.local_addr().map_err(TorrentError::Bind)?.port();
        tracing::info!("listening on port {}", listen_port);

        let (tracker_params_tx, tracker_params_rx) = watch::channel(None::<AnnounceParams>);
        let (discovered_tx, discovered_rx): (tracker::PeerTx, tracker::PeerRx) = mpsc::unbounded_channel();
        let tracker_handle = tokio::spawn(TrackerSet::new(tiers).run(tracker_params_rx, discovered_tx));

        Ok(Self {
            ctx,
            config,
            listener,
            listen_port,
            torrent_rx,
            discovered_rx,
            active_peers: HashMap::new(),
            candidates: VecDeque::new(),
            queued: HashSet::new(),
            cooldown: HashMap::new(),
            peer_stats: HashMap::new(),
            disconnected_throughput: ThroughputStats::default(),
            scheduler_handle,
            disk_handle,
            tracker_handle,
            tracker_params_tx,
            state: TorrentState::Started,
            start_time: Instant::now(),
            fatal: None,
            interrupted: false,
            no_peers: false,
            no_peer_deadline: Some(Instant::now() + NO_PEER_TIMEOUT),
            finished: false,
        })
    }

    // Binds the requested port; if it's within the conventional BitTorrent
    // range, falls through up to 6889 on failure rather than giving up
    // immediately.
    async fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let mut port = addr.port();
        let end = if (6881..=6889).contains(&port) { 6889 } else { port };
        loop {
            let candidate = SocketAddr::new(addr.ip(), port);
            match TcpListener::bind(candidate).await {
                Ok(listener) => return Ok(listener),
                Err(e) if port < end => {
                    tracing::warn!("failed to bind {}: {}, trying {}", candidate, e, port + 1);
                    port += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[tracing::instrument(name = "torrent", skip_all)]
    pub async fn start(mut self) -> Result<(), TorrentError> {
        tracing::info!("starting torrent session, info-hash {}", hex::encode(self.ctx.info_hash));
        self.state = TorrentState::Downloading;
        self.send_announce(Some(Event::Started));
        self.run().await
    }

    async fn run(mut self) -> Result<(), TorrentError> {

        let mut maintain = time::interval(MAINTAIN_INTERVAL);
        let mut reannounce = time::interval(self.config.announce_interval);
        reannounce.tick().await; // first tick fires immediately; we already announced `started`.

        loop {
            tokio::select! {

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => self.accept_peer(stream, address),
                        Err(e) => tracing::warn!("inbound accept error: {}", e),
                    }
                }

                Some(peers) = self.discovered_rx.recv() => self.add_candidates(peers),

                Some(cmd) = self.torrent_rx.recv() => {
                    self.handle_command(cmd);
                    if self.fatal.is_some() || self.state == TorrentState::Stopped || self.finished {
                        break;
                    }
                }

                _ = maintain.tick() => self.maintain_peers(),

                _ = reannounce.tick() => self.send_announce(None),

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received interrupt, shutting down");
                    self.interrupted = true;
                    break;
                }
            }

            if self.no_peers {
                break;
            }
        }

        self.shutdown().await;

        if let Some(reason) = self.fatal {
            Err(TorrentError::Fatal(reason))
        } else if self.no_peers {
            Err(TorrentError::NoPeersObtained)
        } else if self.interrupted {
            Err(TorrentError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn accept_peer(&mut self, stream: TcpStream, address: SocketAddr) {
        let (_, max) = self.config.min_max_peers;
        if self.active_peers.len() as u32 >= max {
            tracing::debug!("rejecting inbound peer {}, at capacity", address);
            return;
        }
        tracing::debug!("accepted inbound connection from {}", address);
        self.no_peer_deadline = None;
        let handle = PeerHandle::start_session(address, self.ctx.clone(), Some(stream));
        self.active_peers.insert(address, handle);
    }

    fn add_candidates(&mut self, addresses: Vec<SocketAddr>) {
        for address in addresses {
            if self.active_peers.contains_key(&address) || self.queued.contains(&address) {
                continue;
            }
            self.queued.insert(address);
            self.candidates.push_back(address);
        }
    }

    fn next_candidate(&mut self, now: Instant) -> Option<SocketAddr> {
        while let Some(address) = self.candidates.pop_front() {
            self.queued.remove(&address);
            if self.active_peers.contains_key(&address) {
                continue;
            }
            if self.cooldown.get(&address).is_some_and(|&until| until > now) {
                continue;
            }
            return Some(address);
        }
        None
    }

    // Maintains active_peers within [target/2, max]: only dials when below
    // target, never past max.
    fn maintain_peers(&mut self) {
        let now = Instant::now();
        self.cooldown.retain(|_, &mut until| until > now);

        if let Some(deadline) = self.no_peer_deadline {
            if now >= deadline {
                self.no_peer_deadline = None;
                if self.active_peers.is_empty() && self.peer_stats.is_empty() {
                    tracing::error!("no peers obtained within {:?} of starting", NO_PEER_TIMEOUT);
                    self.no_peers = true;
                    return;
                }
            }
        }

        let (target, max) = self.config.min_max_peers;
        if self.active_peers.len() as u32 >= target {
            return;
        }
        while (self.active_peers.len() as u32) < max {
            let Some(address) = self.next_candidate(now) else { break };
            tracing::debug!("dialing candidate peer {}", address);
            let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
            self.active_peers.insert(address, handle);
            if self.active_peers.len() as u32 >= target {
                break;
            }
        }
    }

    fn handle_command(&mut self, cmd: CommandToTorrent) {
        match cmd {
            CommandToTorrent::DownloadComplete => {
                self.send_announce(Some(Event::Completed));
                if self.config.seed {
                    tracing::info!("download complete, switching to seeding");
                    self.state = TorrentState::Seeding;
                } else {
                    tracing::info!("download complete, exiting (seeding not requested)");
                    self.finished = true;
                }
            }
            CommandToTorrent::Fatal(reason) => {
                self.fatal = Some(reason);
            }
            CommandToTorrent::PeerState { address, state } => {
                self.no_peer_deadline = None;
                self.peer_stats.insert(address, PeerStats { address, state });
            }
            CommandToTorrent::PeerGone { address, reached_active } => {
                self.active_peers.remove(&address);
                if let Some(stats) = self.peer_stats.remove(&address) {
                    self.disconnected_throughput += &stats.state.throughput;
                }
                if !reached_active {
                    self.cooldown.insert(address, Instant::now() + self.config.dial_cooldown);
                }
            }
            CommandToTorrent::Shutdown => {
                self.state = TorrentState::Stopped;
            }
        }
    }

    fn send_announce(&mut self, event: Option<Event>) {
        let have = self.ctx.completed.borrow().count_ones() as u64;
        let total_pieces = self.ctx.info.num_pieces as u64;
        let left = if have >= total_pieces {
            0
        } else {
            self.ctx.info.total_len.saturating_sub(have * self.ctx.info.piece_len as u64)
        };
        let throughput = self.total_throughput();

        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.listen_port,
            uploaded: throughput.up.total(),
            downloaded: throughput.down.total(),
            left,
            event,
            num_want: if event.is_some() { Some(50) } else { None },
        };
        self.tracker_params_tx.send(Some(params)).ok();
    }

    fn total_throughput(&self) -> ThroughputStats {
        let mut total = self.disconnected_throughput;
        for peer in self.peer_stats.values() {
            total += &peer.state.throughput;
        }
        total
    }

    pub fn stats(&self) -> TorrentStats {
        let num_pieces = self.ctx.info.num_pieces as usize;
        let num_downloaded = self.ctx.completed.borrow().count_ones();
        TorrentStats {
            start_time: Some(self.start_time),
            time_elapsed: self.start_time.elapsed(),
            state: self.state,
            piece_stats: PieceStats {
                num_pieces,
                num_pending: num_pieces.saturating_sub(num_downloaded),
                num_downloaded,
            },
            peer_stats: self.peer_stats.values().copied().collect(),
            throughput: self.total_throughput(),
        }
    }

    async fn shutdown(self) {
        tracing::info!("shutting down torrent session");

        let peer_handles: Vec<JoinHandle<()>> = self.active_peers.into_values().map(|peer| {
            peer.peer_tx.try_send(PeerCommand::Shutdown).ok();
            peer.session_handle
        }).collect();
        if time::timeout(SHUTDOWN_GRACE, futures::future::join_all(peer_handles)).await.is_err() {
            tracing::warn!("peer sessions did not all close within the shutdown grace period");
        }

        self.ctx.disk_tx.send(fs::CommandToDisk::Shutdown).ok();
        if time::timeout(SHUTDOWN_GRACE, self.disk_handle).await.is_err() {
            tracing::warn!("disk task did not shut down within the grace period");
        }

        self.tracker_params_tx.send(Some(AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Some(Event::Stopped),
            num_want: None,
        })).ok();
        if time::timeout(SHUTDOWN_GRACE, self.tracker_handle).await.is_err() {
            tracing::warn!("tracker stop announce did not complete within the grace period");
        }

        // `ctx` carries a clone of the scheduler's own sender, so the
        // scheduler's channel never closes via sender-drop; it must be
        // cancelled explicitly.
        self.scheduler_handle.abort();
    }
}
