use rand::seq::IteratorRandom;
use crate::Bitfield;

/*
Pieces are downloaded in rarest-first order: the client keeps a running
frequency count of every piece across all peer bitfields/have messages, and
picks the piece with the lowest frequency among pieces a candidate peer
actually has and we don't. Ties are broken by lowest index. Per BEP
recommendation, rarest-first is relaxed to uniform random selection while we
have fewer than `RANDOM_UNTIL` pieces, since frequency data is too sparse
early on to be meaningful and randomizing avoids every new peer racing for
the exact same first piece.
*/

const RANDOM_UNTIL: usize = 4;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of connected peers that have this piece.
    frequency: usize,
    // Currently being downloaded (picked, not yet complete).
    in_flight: bool,
}

#[derive(Debug)]
pub struct Pieces {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl Pieces {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have: Bitfield::repeat(false, num_pieces),
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn num_completed(&self) -> usize {
        self.have.count_ones()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    // Returns true if the piece is one we don't have (used to decide whether
    // a `have`/bitfield update makes us interested in a peer).
    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    // Peer disconnected or lost the piece; availability must fall back down
    // so it continues to reflect only currently-connected peers.
    pub fn decrement_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency = self.pieces[idx].frequency.saturating_sub(1);
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].in_flight = false;
    }

    // Piece failed verification; make it eligible to be picked again.
    pub fn release_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].in_flight = false;
    }

    // Applies a peer's full bitfield, returns true if they have at least one
    // piece we're missing (i.e. whether we should be interested in them).
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        for (i, has) in bf.iter().by_vals().enumerate() {
            if has {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
            }
        }
        interested
    }

    pub fn pick_piece(&mut self, peer_bf: &Bitfield) -> Option<usize> {
        debug_assert_eq!(peer_bf.len(), self.have.len());

        let eligible = || (0..self.have.len())
            .filter(|&i| !self.have[i] && !self.pieces[i].in_flight && peer_bf[i]);

        let idx = if self.num_completed() < RANDOM_UNTIL {
            eligible().choose(&mut rand::thread_rng())
        } else {
            eligible().min_by_key(|&i| self.pieces[i].frequency)
        };

        if let Some(idx) = idx {
            self.pieces[idx].in_flight = true;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn rarest_first_breaks_ties_by_lowest_index() {
        let mut pieces = Pieces::new(4);
        // Drive num_completed above the randomization threshold so
        // rarest-first selection kicks in.
        pieces.have = bitvec![u8, Msb0; 1, 1, 1, 1, 1, 1];
        pieces.have.resize(4, true);

        let bf = BitVec::repeat(true, 4);
        // Piece 2 is rarer than the rest.
        pieces.pieces[0].frequency = 5;
        pieces.pieces[1].frequency = 5;
        pieces.pieces[2].frequency = 1;
        pieces.pieces[3].frequency = 5;
        pieces.have = BitVec::repeat(false, 4);

        assert_eq!(pieces.pick_piece(&bf), Some(2));
    }

    #[test]
    fn wont_pick_pieces_peer_lacks_or_already_have() {
        let mut pieces = Pieces::new(3);
        pieces.pieces.iter_mut().for_each(|p| p.frequency = 10);
        pieces.have.set(0, true);

        let mut peer_bf = BitVec::repeat(false, 3);
        peer_bf.set(1, true);

        assert_eq!(pieces.pick_piece(&peer_bf), Some(1));
    }

    #[test]
    fn decrement_lowers_frequency_without_underflow() {
        let mut pieces = Pieces::new(1);
        pieces.decrement_piece(0);
        assert_eq!(pieces.pieces[0].frequency, 0);
        pieces.increment_piece(0);
        pieces.decrement_piece(0);
        assert_eq!(pieces.pieces[0].frequency, 0);
    }

    #[test]
    fn in_flight_pieces_are_not_picked_twice() {
        let mut pieces = Pieces::new(2);
        pieces.pieces.iter_mut().for_each(|p| p.frequency = 1);
        let bf = BitVec::repeat(true, 2);
        let first = pieces.pick_piece(&bf);
        assert!(first.is_some());
        let second = pieces.pick_piece(&bf);
        assert_ne!(first, second);
    }
}
