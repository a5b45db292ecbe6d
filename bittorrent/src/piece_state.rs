use std::{collections::HashSet, net::SocketAddr, time::Instant};
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockStatus {
    Missing,
    Requested { at: Instant },
    Received,
}

/// Owns everything there is to know about one piece that is currently being
/// downloaded: its block bookkeeping, its byte buffer, and hash
/// verification, all as a single entity so the scheduler is the sole owner
/// of piece state — no data is shared behind a lock.
#[derive(Debug)]
pub struct PieceState {
    pub idx: usize,
    len: usize,
    hash: ID,
    buf: Vec<u8>,
    blocks: Vec<BlockStatus>,
    // Peers that contributed at least one block to this piece. Blamed in
    // full if the assembled piece fails verification.
    contributors: HashSet<SocketAddr>,
}

impl PieceState {

    pub fn new(idx: usize, len: usize, hash: ID) -> Self {
        Self {
            idx,
            len,
            hash,
            buf: vec![0; len],
            blocks: vec![BlockStatus::Missing; num_blocks(len) as usize],
            contributors: HashSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| *b == BlockStatus::Received)
    }

    // Called once every block has been received. Verifies the assembled
    // buffer against the expected hash. On a match the piece is done and
    // its bytes are handed back for storage; on a mismatch the piece is
    // reset in place (blocks back to `Missing`, buffer re-zeroed) so it can
    // be retried, and every peer that contributed a block is returned for
    // blame. Returns `Incomplete` if some block is still outstanding.
    pub fn maybe_complete(&mut self) -> PieceOutcome {
        if !self.is_complete() {
            return PieceOutcome::Incomplete;
        }
        let contributors = std::mem::take(&mut self.contributors);
        if sha1_20(&self.buf) == self.hash {
            let buf = std::mem::replace(&mut self.buf, Vec::new());
            PieceOutcome::Complete(buf, contributors)
        } else {
            self.buf = vec![0; self.len];
            self.blocks.iter_mut().for_each(|b| *b = BlockStatus::Missing);
            PieceOutcome::Corrupt(contributors)
        }
    }

    // Blocks not yet requested (or whose request has timed out), up to `n`.
    pub fn next_missing_blocks(&mut self, n: usize, now: Instant, timeout: std::time::Duration) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(n);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked.len() == n {
                break;
            }
            let stale = matches!(*block, BlockStatus::Requested { at } if now.duration_since(at) >= timeout);
            if *block == BlockStatus::Missing || stale {
                *block = BlockStatus::Requested { at: now };
                picked.push(BlockInfo {
                    piece_idx: self.idx,
                    offset: i * crate::BLOCK_SIZE,
                    len: block_len(self.len, i),
                });
            }
        }
        picked
    }

    pub fn mark_received(&mut self, block: BlockInfo, data: Vec<u8>, from: SocketAddr) {
        debug_assert_eq!(block.piece_idx, self.idx);
        let i = block.idx_in_piece();
        if self.blocks[i] == BlockStatus::Received {
            return;
        }
        self.buf[block.offset..block.offset + data.len()].copy_from_slice(&data);
        self.blocks[i] = BlockStatus::Received;
        self.contributors.insert(from);
    }

    pub fn free_block(&mut self, block: BlockInfo) {
        let i = block.idx_in_piece();
        if self.blocks[i] != BlockStatus::Received {
            self.blocks[i] = BlockStatus::Missing;
        }
    }

}

/// Result of asking a piece whether it's done, per [`PieceState::maybe_complete`].
#[derive(Debug)]
pub enum PieceOutcome {
    Incomplete,
    Complete(Vec<u8>, HashSet<SocketAddr>),
    Corrupt(HashSet<SocketAddr>),
}

fn sha1_20(data: &[u8]) -> ID {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn completes_and_verifies_when_all_blocks_received() {
        let data = vec![7u8; crate::BLOCK_SIZE];
        let hash = sha1_20(&data);
        let mut piece = PieceState::new(0, data.len(), hash);

        assert!(!piece.is_complete());
        let blocks = piece.next_missing_blocks(4, Instant::now(), Duration::from_secs(30));
        assert_eq!(blocks.len(), 1);

        piece.mark_received(blocks[0], data.clone(), addr(1));
        assert!(piece.is_complete());

        match piece.maybe_complete() {
            PieceOutcome::Complete(buf, contributors) => {
                assert_eq!(buf, data);
                assert_eq!(contributors.len(), 1);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_piece_is_reset_and_retryable() {
        let hash = sha1_20(&vec![1u8; 16]);
        let mut piece = PieceState::new(0, 16, hash);
        let blocks = piece.next_missing_blocks(1, Instant::now(), Duration::from_secs(30));
        piece.mark_received(blocks[0], vec![2u8; 16], addr(1));

        match piece.maybe_complete() {
            PieceOutcome::Corrupt(contributors) => assert_eq!(contributors.len(), 1),
            other => panic!("expected Corrupt, got {other:?}"),
        }

        // The piece is retryable: blocks are missing again and a fresh
        // attempt with the right bytes now verifies.
        assert!(!piece.is_complete());
        let blocks = piece.next_missing_blocks(1, Instant::now(), Duration::from_secs(30));
        piece.mark_received(blocks[0], vec![1u8; 16], addr(2));
        match piece.maybe_complete() {
            PieceOutcome::Complete(_, contributors) => assert_eq!(contributors.len(), 1),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn stale_requests_are_reissued() {
        let mut piece = PieceState::new(0, 16, [0; 20]);
        let t0 = Instant::now();
        let first = piece.next_missing_blocks(1, t0, Duration::from_secs(30));
        assert_eq!(first.len(), 1);

        // Not yet stale: nothing new to pick.
        let none = piece.next_missing_blocks(1, t0, Duration::from_secs(30));
        assert!(none.is_empty());

        // Past the timeout: the same block is offered again.
        let again = piece.next_missing_blocks(1, t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(again, first);
    }
}
