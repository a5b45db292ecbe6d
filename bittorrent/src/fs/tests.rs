use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::{
    block::{Block, BlockInfo},
    fs::{spawn, CommandToDisk},
    p2p::PeerCommand,
    scheduler::SchedulerCommand,
    store::StoreInfo,
    MetaInfo,
};

// Two files, 10 and 6 bytes, piece length 8: piece 1 spans bytes [8, 16) and
// crosses the file boundary at byte 10.
fn two_file_torrent() -> (MetaInfo, Vec<u8>) {
    let data_a = vec![b'a'; 10];
    let data_b = vec![b'b'; 6];
    let mut whole = data_a;
    whole.extend_from_slice(&data_b);

    let piece_length = 8usize;
    let mut pieces = Vec::new();
    for chunk in whole.chunks(piece_length) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        pieces.extend_from_slice(&hasher.finalize());
    }

    let files_dict = "d6:lengthi10e4:pathl1:a1:ee6:lengthi6e4:pathl1:bee";
    let info = format!(
        "d5:filesl{}e4:name5:multi12:piece lengthi{}e6:pieces{}:",
        files_dict,
        piece_length,
        pieces.len(),
    );
    let mut buf = Vec::new();
    buf.extend_from_slice(b"d8:announce20:http://tracker.test4:info");
    buf.extend_from_slice(info.as_bytes());
    buf.extend_from_slice(&pieces);
    buf.extend_from_slice(b"ee");

    let metainfo = MetaInfo::from_bytes(&buf).unwrap();
    (metainfo, whole)
}

// Writing the boundary-crossing piece should leave each file holding
// exactly its own slice of the data, split at the file boundary rather
// than the piece boundary.
#[tokio::test]
async fn write_piece_splits_across_file_boundary() {
    let (metainfo, whole) = two_file_torrent();
    let temp_dir = tempfile::tempdir().unwrap();
    let info = StoreInfo::new(&metainfo, temp_dir.path().into());

    let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
    let (_handle, disk_tx, _have) = spawn(info.clone(), metainfo.piece_hashes(), scheduler_tx)
        .await
        .unwrap();

    // Piece 1 covers bytes [8, 16) of the whole torrent.
    let piece_data = whole[8..16].to_vec();
    disk_tx
        .send(CommandToDisk::WritePiece { idx: 1, data: piece_data })
        .unwrap();

    match scheduler_rx.recv().await {
        Some(SchedulerCommand::PieceFlushed { idx, ok }) => {
            assert_eq!(idx, 1);
            assert!(ok);
        }
        other => panic!("unexpected command: {}", matches_desc(&other)),
    }

    let file_a = std::fs::read(temp_dir.path().join("multi").join("a")).unwrap();
    let file_b = std::fs::read(temp_dir.path().join("multi").join("b")).unwrap();
    assert_eq!(file_a, whole[0..10]);
    assert_eq!(file_b, whole[10..16]);
}

// A piece written with data that doesn't match its declared hash should
// still land on disk (storage doesn't re-verify), but scan_resume on a
// fresh Disk must not mark it as present.
#[tokio::test]
async fn scan_resume_rejects_mismatched_piece() {
    let (metainfo, _whole) = two_file_torrent();
    let temp_dir = tempfile::tempdir().unwrap();
    let info = StoreInfo::new(&metainfo, temp_dir.path().into());

    let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
    let (_handle, disk_tx, have) = spawn(info.clone(), metainfo.piece_hashes(), scheduler_tx)
        .await
        .unwrap();
    assert!(!have.any(), "nothing written yet, resume scan should be empty");

    let corrupt = vec![0u8; info.piece_length(0)];
    disk_tx
        .send(CommandToDisk::WritePiece { idx: 0, data: corrupt })
        .unwrap();
    scheduler_rx.recv().await;

    // Re-open the same directory: the resume scan must hash what's on disk
    // and reject the piece rather than trust that something was written.
    let (scheduler_tx2, _scheduler_rx2) = mpsc::unbounded_channel();
    let (_handle2, _disk_tx2, have2) = spawn(info, metainfo.piece_hashes(), scheduler_tx2)
        .await
        .unwrap();
    assert!(!have2[0], "corrupted piece must not be reported as resumed");
}

// Reading back a block after its piece has been written should return
// exactly the bytes that were written, whether served from cache or disk.
#[tokio::test]
async fn read_block_returns_written_data() {
    let (metainfo, whole) = two_file_torrent();
    let temp_dir = tempfile::tempdir().unwrap();
    let info = StoreInfo::new(&metainfo, temp_dir.path().into());

    let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
    let (_handle, disk_tx, _have) = spawn(info.clone(), metainfo.piece_hashes(), scheduler_tx)
        .await
        .unwrap();

    disk_tx
        .send(CommandToDisk::WritePiece { idx: 0, data: whole[0..8].to_vec() })
        .unwrap();
    scheduler_rx.recv().await;

    let (peer_tx, mut peer_rx) = mpsc::channel(4);
    disk_tx
        .send(CommandToDisk::ReadBlock {
            block: BlockInfo { piece_idx: 0, offset: 0, len: 8 },
            tx: peer_tx,
        })
        .unwrap();

    match peer_rx.recv().await {
        Some(PeerCommand::BlockRead(Block { piece_idx, offset, data })) => {
            assert_eq!(piece_idx, 0);
            assert_eq!(offset, 0);
            assert_eq!(&*data, &whole[0..8]);
        }
        _ => panic!("expected a BlockRead command"),
    }
}

fn matches_desc(cmd: &Option<SchedulerCommand>) -> &'static str {
    match cmd {
        Some(SchedulerCommand::PieceFlushed { .. }) => "PieceFlushed",
        Some(_) => "other",
        None => "channel closed",
    }
}
