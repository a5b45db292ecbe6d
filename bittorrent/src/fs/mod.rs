use std::{
    collections::HashMap,
    io::{Read, Seek, Write},
    sync::{Arc, Mutex, RwLock},
};
use tokio::{sync::mpsc, task};
use crate::{
    block::{Block, BlockInfo},
    scheduler::{SchedulerCommand, SchedulerTx},
    store::{FileInfo, StoreInfo},
    p2p::{PeerCommand, PeerTx},
    ID,
};

#[cfg(test)]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::ChannelError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

/// Default bound on the shared piece read cache (distinct from any
/// file-handle bookkeeping; all files are opened once at startup and kept
/// open for the torrent's lifetime).
const READ_CACHE_SIZE: usize = 500;

pub enum CommandToDisk {

    // A verified whole piece, ready to be written across its spanning files.
    WritePiece {
        idx: usize,
        data: Vec<u8>,
    },

    // Block has been requested, needs to be read from disk.
    ReadBlock {
        block: BlockInfo,
        tx: PeerTx,
    },

    // Shutdown the disk task.
    Shutdown,

}

#[derive(Debug)]
pub struct Disk {

    // Storage information we need for writing to disk.
    info: StoreInfo,

    // Piece hashes, used only for the startup resume scan.
    piece_hashes: Vec<ID>,

    // Channel to receive commands from other tasks.
    disk_rx: DiskRx,

    // Context shared with blocking IO tasks.
    ctx: Arc<Ctx>,

}

// Ctx involves data needed for the IO threads.
#[derive(Debug)]
struct Ctx {

    // Files to write to.
    pub files: Vec<RwLock<TorrentFile>>,

    // Channel to report piece write results back to the scheduler.
    pub scheduler_tx: SchedulerTx,

    // Cached pieces, split into blocks, to limit disk access on repeated requests.
    pub read_cache: Mutex<lru::LruCache<usize, Vec<Arc<Vec<u8>>>>>,

}

#[derive(Debug)]
pub struct TorrentFile {

    // Information about the file.
    pub info: FileInfo,

    // File handle for access.
    pub handle: std::fs::File,

}

impl TorrentFile {
    pub fn new(dir: &std::path::Path, info: FileInfo) -> Result<Self> {

        let path = dir.join(&info.path);
        tracing::info!("opening file: {:?}", &path);

        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self { info, handle })
    }

    // Grows the file to its declared length if it isn't already that size.
    // Sparse on platforms that support it; idempotent across runs.
    fn preallocate(&self) -> Result<()> {
        let current_len = self.handle.metadata()?.len();
        if current_len != self.info.length as u64 {
            self.handle.set_len(self.info.length as u64)?;
        }
        Ok(())
    }
}

// Sets up the output directory and file handles, then spawns the disk task.
pub async fn spawn(
    info: StoreInfo,
    piece_hashes: Vec<ID>,
    scheduler_tx: SchedulerTx,
) -> Result<(task::JoinHandle<Result<()>>, DiskTx, crate::Bitfield)> {
    tracing::info!("spawning disk task");
    let (mut disk, disk_tx) = Disk::new(info, piece_hashes, scheduler_tx)?;
    disk.preallocate()?;
    let have = disk.scan_resume()?;
    let handle = tokio::task::spawn(async move { disk.run().await });
    tracing::info!("disk task spawned, {} pieces already verified", have.count_ones());
    Ok((handle, disk_tx, have))
}

impl Disk {

    pub fn new(info: StoreInfo, piece_hashes: Vec<ID>, scheduler_tx: SchedulerTx) -> Result<(Self, DiskTx)> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            files.push(RwLock::new(TorrentFile::new(&info.output_dir, file.clone())?));
        }

        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let read_cache = Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(READ_CACHE_SIZE).unwrap()));
        Ok((
            Self {
                info,
                piece_hashes,
                disk_rx,
                ctx: Arc::new(Ctx { files, scheduler_tx, read_cache }),
            },
            disk_tx,
        ))
    }

    // Create/extend every file to its declared length. Idempotent.
    fn preallocate(&self) -> Result<()> {
        for file in self.ctx.files.iter() {
            file.read()?.preallocate()?;
        }
        Ok(())
    }

    // Hashes every piece against its expected hash and returns a bitfield of
    // the ones already present on disk. This is the sole resume mechanism;
    // there is no sidecar state file.
    fn scan_resume(&self) -> Result<crate::Bitfield> {
        let mut have = crate::Bitfield::repeat(false, self.info.num_pieces as usize);
        for idx in 0..self.info.num_pieces as usize {
            let file_range = self.info.piece_file_intersections(idx);
            let offset = self.info.piece_byte_offset(idx);
            let len = self.info.piece_length(idx);
            let data = read_piece_bytes(offset, len, file_range, &self.ctx.files)?;
            if sha1_20(&data) == self.piece_hashes[idx] {
                have.set(idx, true);
            }
        }
        Ok(have)
    }

    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting disk");
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {
                CommandToDisk::WritePiece { idx, data } => self.write_piece(idx, data),
                CommandToDisk::ReadBlock { block, tx } => self.read_block(block, tx)?,
                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                }
            }
        }
        Ok(())
    }

    // Writes a whole, already hash-verified piece across its spanning files.
    fn write_piece(&mut self, idx: usize, data: Vec<u8>) {
        let file_range = self.info.piece_file_intersections(idx);
        let offset = self.info.piece_byte_offset(idx);
        let ctx = Arc::clone(&self.ctx);

        tokio::task::spawn_blocking(move || {
            let result = write_piece_bytes(offset, &data, file_range, &ctx.files);
            if let Err(e) = &result {
                tracing::error!("failed to write piece {}: {}", idx, e);
            }
            ctx.scheduler_tx.send(SchedulerCommand::PieceFlushed {
                idx,
                ok: result.is_ok(),
            }).map_err(|e| tracing::error!("disk -> scheduler channel closed: {}", e)).ok();
        });
    }

    // Reads a block from disk and sends it to the peer that requested it.
    fn read_block(&self, block_info: BlockInfo, peer_tx: PeerTx) -> Result<()> {

        let block_idx = block_info.idx_in_piece();

        if let Some(cached) = self.ctx.read_cache.lock()?.get(&block_info.piece_idx) {
            tracing::trace!("cache hit for piece {}", block_info.piece_idx);

            let Some(block_data) = cached.get(block_idx) else {
                tracing::warn!("block index {} out of range for piece {}", block_idx, block_info.piece_idx);
                return Ok(());
            };

            peer_tx.send(PeerCommand::BlockRead(Block {
                piece_idx: block_info.piece_idx,
                offset: block_info.offset,
                data: Arc::clone(block_data),
            })).ok();

        } else {
            let file_range = self.info.piece_file_intersections(block_info.piece_idx);
            let piece_offset = self.info.piece_byte_offset(block_info.piece_idx);
            let piece_len = self.info.piece_length(block_info.piece_idx);
            let ctx = Arc::clone(&self.ctx);

            tokio::task::spawn_blocking(move || {
                let data = match read_piece_bytes(piece_offset, piece_len, file_range, &ctx.files) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::error!("failed to read piece {}: {}", block_info.piece_idx, e);
                        return;
                    }
                };
                let blocks: Vec<Arc<Vec<u8>>> = data
                    .chunks(crate::BLOCK_SIZE)
                    .map(|chunk| Arc::new(chunk.to_vec()))
                    .collect();
                let Some(block_data) = blocks.get(block_idx).cloned() else {
                    tracing::warn!("block index {} out of range for piece {}", block_idx, block_info.piece_idx);
                    return;
                };
                ctx.read_cache.lock().unwrap().put(block_info.piece_idx, blocks);

                peer_tx.send(PeerCommand::BlockRead(Block {
                    piece_idx: block_info.piece_idx,
                    offset: block_info.offset,
                    data: block_data,
                })).ok();
            });
        }

        Ok(())
    }
}

fn sha1_20(data: &[u8]) -> ID {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

// Walks the files spanning a piece starting at `piece_offset`, writing
// `data` across them as a sequence of cumulative-offset segments. Simpler
// than tracking an explicit "overflow block": each file just consumes as
// much of the remaining data as fits before its own end.
fn write_piece_bytes(
    piece_offset: usize,
    data: &[u8],
    file_range: std::ops::Range<usize>,
    files: &[RwLock<TorrentFile>],
) -> Result<()> {
    let mut written = 0;
    let mut total_offset = piece_offset;

    for file in &files[file_range] {
        let mut f = file.write()?;
        let byte_range = f.info.byte_range();
        let file_offset = total_offset - byte_range.start;
        let piece_remaining = data.len() - written;
        let file_remaining = byte_range.end - total_offset;
        let n = piece_remaining.min(file_remaining);

        f.handle.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        f.handle.write_all(&data[written..written + n])?;

        written += n;
        total_offset += n;
    }
    debug_assert_eq!(written, data.len());
    Ok(())
}

fn read_piece_bytes(
    piece_offset: usize,
    piece_len: usize,
    file_range: std::ops::Range<usize>,
    files: &[RwLock<TorrentFile>],
) -> Result<Vec<u8>> {
    let mut bytes_read = 0;
    let mut total_offset = piece_offset;
    let mut buf = vec![0; piece_len];

    for file in &files[file_range] {
        let mut f = file.write()?;
        let byte_range = f.info.byte_range();
        let file_offset = total_offset - byte_range.start;
        let piece_remaining = piece_len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let n_expected = piece_remaining.min(file_remaining);

        f.handle.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        let n = f.handle.read(&mut buf[bytes_read..bytes_read + n_expected])?;

        bytes_read += n;
        total_offset += n;

        // A short read (file shorter than expected, e.g. not yet written)
        // leaves the remainder as zeros; resume hashing will simply fail to
        // match and the piece stays marked missing.
        if n < n_expected {
            break;
        }
    }

    Ok(buf)
}
