use std::time::Instant;
use crate::stats::ThroughputStats;

/// Per-peer connection lifecycle. There's no separate bitfield-exchange
/// state: once the handshake completes there's no wire-visible difference
/// between "haven't seen a bitfield yet" and "exchanging pieces", it's just
/// `am_interested` starting out `false`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Dialing,
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub am_choking: bool,

    // Whether we are interested in the peer's pieces.
    pub am_interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    // Timestamp of the last message received from the peer, of any kind,
    // including keep-alives. None before the handshake completes.
    pub last_message_at: Option<Instant>,

    // Timestamp of the last message we sent; drives the keep-alive timer.
    pub last_sent_at: Option<Instant>,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Dialing,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            last_message_at: None,
            last_sent_at: None,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    // Whether we're allowed to have outstanding requests with this peer.
    pub fn can_request(&self) -> bool {
        self.conn_state == ConnState::Active && self.am_interested && !self.peer_choking
    }

    pub fn note_received(&mut self, now: Instant) {
        self.last_message_at = Some(now);
    }

    pub fn note_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
    }

    // No message of any kind (including keep-alives) in this long disconnects
    // the peer.
    pub fn is_idle(&self, now: Instant, timeout: std::time::Duration) -> bool {
        match self.last_message_at {
            Some(at) => now.duration_since(at) >= timeout,
            None => false,
        }
    }

    // Whether a keep-alive is due: nothing sent in this long.
    pub fn needs_keepalive(&self, now: Instant, interval: std::time::Duration) -> bool {
        match self.last_sent_at {
            Some(at) => now.duration_since(at) >= interval,
            None => true,
        }
    }
}
