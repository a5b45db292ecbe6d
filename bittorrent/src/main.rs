use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use bittorrent::{ClientConfig, MetaInfo, Torrent, TorrentConfig, TorrentError};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bittorrent", about = "A BitTorrent client")]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Directory files are downloaded into.
    #[arg(short, long, default_value = "downloads")]
    destination: PathBuf,

    /// Port to listen for incoming peer connections on. If unavailable,
    /// falls through 6881-6889 before giving up.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Maximum number of simultaneously active peers.
    #[arg(long, default_value_t = 50)]
    max_peers: u32,

    /// Keep the session running and serving pieces after the download
    /// completes, instead of exiting.
    #[arg(long)]
    seed: bool,

    /// Increase logging verbosity. Can be passed multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn verbosity_to_level(count: u8) -> tracing::Level {
    match count {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(verbosity_to_level(args.verbose))
        .init();

    let metainfo = match MetaInfo::load(&args.torrent) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            eprintln!("failed to load torrent: {e}");
            return ExitCode::from(1);
        }
    };

    let client_config = ClientConfig::default();
    let torrent_config = TorrentConfig {
        output_dir: args.destination,
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), args.port),
        min_max_peers: (args.max_peers.min(5), args.max_peers),
        seed: args.seed,
        ..TorrentConfig::default()
    };

    let torrent = match Torrent::new(metainfo, &client_config, torrent_config).await {
        Ok(torrent) => torrent,
        Err(e) => {
            eprintln!("failed to initialize torrent: {e}");
            return exit_code_for(&e);
        }
    };

    match torrent.start().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("{e}");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &TorrentError) -> ExitCode {
    match error {
        TorrentError::NoPeersObtained => ExitCode::from(2),
        TorrentError::Disk(_) | TorrentError::Bind(_) | TorrentError::Fatal(_) => ExitCode::from(3),
        TorrentError::Interrupted => ExitCode::from(130),
    }
}
