use std::{net::SocketAddr, time::{Duration, Instant}};
use tracing::Instrument;
use url::Url;
use crate::ID;

mod http;
mod udp;
pub use udp::UdpTracker;
pub use http::HttpTracker;

type Result<T> = std::result::Result<T, TrackerError>;

pub type TrackerTx = tokio::sync::watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = tokio::sync::watch::Receiver<Option<AnnounceParams>>;

// Peer addresses discovered by the tracker set are pushed here; the supervisor
// (torrent.rs) owns the receiving end and folds them into its candidate queue.
pub type PeerTx = tokio::sync::mpsc::UnboundedSender<Vec<SocketAddr>>;
pub type PeerRx = tokio::sync::mpsc::UnboundedReceiver<Vec<SocketAddr>>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

// Retry backoff base: a tracker that just failed is retried after
// 15 * 2^n seconds, n capped at 8 (~64 minutes), at which point it's
// considered dead for the rest of this session.
const BACKOFF_BASE_SECS: u64 = 15;
const MAX_BACKOFF_EXPONENT: u32 = 8;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),

    // The tracker itself rejected the request via a `failure reason` key.
    // Distinct from a transient/transport error: per BEP 3 this tracker is
    // done for the session, not merely backed off.
    #[error("tracker failure: {0}")]
    Failure(String),

}

/// A tracker URL taken from `announce`/`announce-list`, not yet connected.
#[derive(Debug, Clone)]
pub struct TrackerAddr {
    pub url: Url,
}

impl TrackerAddr {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    async fn connect(&self) -> Result<Box<dyn TrackerClient>> {
        match self.url.scheme() {
            "http" | "https" => Ok(Box::new(HttpTracker::new(self.url.clone()))),
            "udp" => Ok(Box::new(UdpTracker::new(self.url.clone()).await)),
            scheme => {
                tracing::warn!("unsupported tracker scheme: {}", scheme);
                Err(TrackerError::InvalidUrl)
            }
        }
    }
}

#[async_trait::async_trait]
pub trait TrackerClient: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;

}

struct TrackerEntry {
    addr: TrackerAddr,
    client: Option<Box<dyn TrackerClient>>,
    backoff_failures: u32,
    retry_after: Option<Instant>,
    dead: bool,
}

impl TrackerEntry {
    fn new(addr: TrackerAddr) -> Self {
        Self { addr, client: None, backoff_failures: 0, retry_after: None, dead: false }
    }

    fn ready(&self, now: Instant) -> bool {
        !self.dead && self.retry_after.map_or(true, |t| now >= t)
    }

    fn record_failure(&mut self, err: &TrackerError) {
        tracing::warn!("tracker {} failed: {}", self.addr.url, err);

        // A `failure reason` response is the tracker itself refusing this
        // torrent, not a transient/transport hiccup: it terminates the
        // tracker for the rest of the session outright, no backoff retry.
        if matches!(err, TrackerError::Failure(_)) {
            self.dead = true;
            tracing::warn!("tracker {} marked dead for this session", self.addr.url);
            return;
        }

        self.backoff_failures += 1;
        if self.backoff_failures > MAX_BACKOFF_EXPONENT {
            self.dead = true;
            tracing::warn!("tracker {} marked dead for this session", self.addr.url);
            return;
        }
        let secs = BACKOFF_BASE_SECS * (1u64 << self.backoff_failures.min(MAX_BACKOFF_EXPONENT));
        self.retry_after = Some(Instant::now() + Duration::from_secs(secs));
    }

    fn record_success(&mut self) {
        self.backoff_failures = 0;
        self.retry_after = None;
    }
}

/// Owns the tracker tiers for one torrent (BEP 12): within a tier, trackers
/// are tried in order and a tracker that announces successfully is promoted
/// to the head of its tier for next time.
pub struct TrackerSet {
    tiers: Vec<Vec<TrackerEntry>>,
}

impl TrackerSet {

    pub fn new(tiers: Vec<Vec<TrackerAddr>>) -> Self {
        Self {
            tiers: tiers.into_iter()
                .map(|tier| tier.into_iter().map(TrackerEntry::new).collect())
                .collect(),
        }
    }

    fn active_entry(&self) -> Option<&TrackerEntry> {
        self.tiers.iter().flatten().find(|e| e.client.is_some())
    }

    pub async fn run(mut self, mut params_rx: TrackerRx, peer_tx: PeerTx) {
        loop {
            if params_rx.changed().await.is_err() {
                return;
            }
            let params = *params_rx.borrow();
            let Some(params) = params else { continue };
            let now = Instant::now();

            let must_announce = params.event.is_some();
            if !must_announce {
                let ready = match self.active_entry() {
                    Some(entry) => {
                        let client = entry.client.as_ref().unwrap();
                        client.should_announce(now)
                            || (params.num_want.unwrap_or(0) > 0 && client.can_announce(now))
                    }
                    None => true,
                };
                if !ready {
                    continue;
                }
            }

            match self.announce_via_tiers(params, now).await {
                Some(peers) => {
                    tracing::info!("tracker announce returned {} peers", peers.len());
                    if peer_tx.send(peers).is_err() {
                        return;
                    }
                }
                None => tracing::warn!("all trackers failed or are backing off"),
            }

            if matches!(params.event, Some(Event::Stopped)) {
                return;
            }
        }
    }

    async fn announce_via_tiers(&mut self, params: AnnounceParams, now: Instant) -> Option<Vec<SocketAddr>> {
        for tier in self.tiers.iter_mut() {
            for idx in 0..tier.len() {
                if !tier[idx].ready(now) {
                    continue;
                }
                if tier[idx].client.is_none() {
                    match tier[idx].addr.connect().await {
                        Ok(client) => tier[idx].client = Some(client),
                        Err(_) => { tier[idx].dead = true; continue; }
                    }
                }
                let span = tracing::info_span!("tracker", url = %tier[idx].addr.url);
                let result = tier[idx].client.as_mut().unwrap()
                    .announce(params)
                    .instrument(span)
                    .await;
                match result {
                    Ok(peers) => {
                        tier[idx].record_success();
                        if idx != 0 {
                            let entry = tier.remove(idx);
                            tier.insert(0, entry);
                        }
                        return Some(peers);
                    }
                    Err(e) => tier[idx].record_failure(&e),
                }
            }
        }
        None
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: ID,

    // Port number.
    pub port: u16,

    // The total amount uploaded (since the client sent the 'started' event to the tracker) in base ten ASCII..
    pub uploaded: u64,

    // The total amount downloaded (since the client sent the 'started' event to the tracker) in base ten ASCII..
    pub downloaded: u64,

    // The number of bytes this client still has to download in base ten ASCII.
    // Clarification: The number of bytes needed to download to be 100% complete and get all the included files in the torrent.
    pub left: u64,

    // If specified, must be one of started, completed, stopped, (or empty which is the same as not being specified).
    // If not specified, then this request is one performed at regular intervals.
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_eventually_marks_dead() {
        let mut entry = TrackerEntry::new(TrackerAddr::new(Url::parse("udp://tracker.test:80").unwrap()));
        for _ in 0..=MAX_BACKOFF_EXPONENT {
            assert!(!entry.dead);
            entry.record_failure(&TrackerError::InvalidUrl);
        }
        assert!(entry.dead);
    }

    #[test]
    fn failure_reason_marks_dead_immediately_without_backoff() {
        let mut entry = TrackerEntry::new(TrackerAddr::new(Url::parse("http://tracker.test:80").unwrap()));
        entry.record_failure(&TrackerError::Failure("unauthorized".to_string()));
        assert!(entry.dead, "a `failure reason` response must kill the tracker on the first failure");
        assert_eq!(entry.backoff_failures, 0, "no backoff should be scheduled for a terminal failure");
        assert!(entry.retry_after.is_none());
    }

    #[test]
    fn success_resets_backoff() {
        let mut entry = TrackerEntry::new(TrackerAddr::new(Url::parse("udp://tracker.test:80").unwrap()));
        entry.record_failure(&TrackerError::InvalidUrl);
        assert!(entry.backoff_failures > 0);
        entry.record_success();
        assert_eq!(entry.backoff_failures, 0);
        assert!(entry.retry_after.is_none());
    }
}
