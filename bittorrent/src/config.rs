use std::{
    net::{Ipv4Addr, SocketAddr}, 
    path::PathBuf, 
    time::Duration
};

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub announce_interval: Duration,

    // (target, max). The supervisor dials from its candidate queue whenever
    // active_peers falls below target, never exceeding max.
    pub min_max_peers: (u32, u32),

    // A peer we failed to dial, or that disconnected before reaching the
    // active state, isn't retried until this long has passed.
    pub dial_cooldown: Duration,

    // Whether to keep the session alive and serving pieces after every
    // piece has downloaded and verified. When false (the default), a
    // finished download exits the session instead of seeding indefinitely.
    pub seed: bool,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            dial_cooldown: Duration::from_secs(600),
            seed: false,
        }
    }
}

pub struct ClientConfig {

    pub client_id: [u8; 20],

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}