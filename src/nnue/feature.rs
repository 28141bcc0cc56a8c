//! The two feature sets feeding the transformer.
//!
//! The piece-square block is king-bucketed and horizontally mirrored;
//! each move changes at most two of its features per side. The threat
//! block describes pieces standing on attacked squares and can churn
//! arbitrarily in one ply, so its diffs are lists, not pairs.

use arrayvec::ArrayVec;

use crate::chess::{
    board::Board,
    piece::{Colour, PieceType},
    types::{DirtyPiece, FeatureUpdate, File, Square, ThreatList},
};

use super::{KING_BUCKETS, PSQ_DIMS, THREAT_DIMS};

/// Feature index lists: a full refresh activates one feature per piece,
/// and threat diffs are bounded by two full threat lists.
pub const MAX_ACTIVE: usize = 64;
pub type IndexList = ArrayVec<usize, MAX_ACTIVE>;

/// Wrapper proving the index was range-checked at construction, so the
/// weight matrix can be indexed without further bounds checks.
#[derive(Clone, Copy, Debug)]
pub struct FeatureIndex(usize);

impl FeatureIndex {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// How a king square maps to a feature bucket. Buckets are coarse: the
/// castled corners get their own, the centre files share.
#[rustfmt::skip]
const HALF_KING_BUCKET_MAP: [usize; 32] = [
    0, 0, 1, 1,
    0, 0, 1, 1,
    2, 2, 2, 2,
    2, 2, 2, 2,
    3, 3, 3, 3,
    3, 3, 3, 3,
    3, 3, 3, 3,
    3, 3, 3, 3,
];

const _BUCKETS_COVERED: () = {
    let mut max = 0;
    let mut i = 0;
    while i < 32 {
        if HALF_KING_BUCKET_MAP[i] > max {
            max = HALF_KING_BUCKET_MAP[i];
        }
        i += 1;
    }
    assert!(max + 1 == KING_BUCKETS);
};

pub mod psq {
    use super::*;

    pub const DIMS: usize = PSQ_DIMS;

    /// The orientation of a perspective's features: which king bucket is
    /// active, and whether the board is mirrored left-right.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Orientation {
        pub bucket: usize,
        pub mirror: bool,
    }

    pub fn orientation(perspective: Colour, king: Square) -> Orientation {
        let mirror = king.file() >= File::E;
        let king_rel = if mirror { king.flip_file() } else { king }.relative_to(perspective);
        let half_index = king_rel.rank() as usize * 4 + king_rel.file() as usize;
        Orientation {
            bucket: HALF_KING_BUCKET_MAP[half_index],
            mirror,
        }
    }

    /// Index of one (piece, square) feature from one perspective.
    pub fn make_index(perspective: Colour, king: Square, f: FeatureUpdate) -> FeatureIndex {
        const COLOUR_STRIDE: usize = 64 * 6;
        const PIECE_STRIDE: usize = 64;

        let o = orientation(perspective, king);
        let sq = if o.mirror { f.sq.flip_file() } else { f.sq }.relative_to(perspective);
        let colour = usize::from(f.piece.colour() != perspective);
        let piece_type = f.piece.piece_type().index();

        let idx = o.bucket * 768 + colour * COLOUR_STRIDE + piece_type * PIECE_STRIDE + sq.index();
        assert!(idx < DIMS, "attempt to construct illegal FeatureIndex");
        FeatureIndex(idx)
    }

    /// The complete feature list of a position, for refreshes from
    /// scratch and for cross-checking the incremental path.
    pub fn append_active(board: &Board, perspective: Colour, out: &mut IndexList) {
        let king = board.king_sq(perspective);
        board.state().bbs.visit_pieces(|sq, piece| {
            out.push(make_index(perspective, king, FeatureUpdate { sq, piece }).index());
        });
    }

    /// The index changes of one ply's square diff, appended to the
    /// caller's lists. The king must be the perspective's current king.
    pub fn append_changed(
        perspective: Colour,
        king: Square,
        diff: &DirtyPiece,
        added: &mut IndexList,
        removed: &mut IndexList,
    ) {
        for &f in &diff.adds {
            added.push(make_index(perspective, king, f).index());
        }
        for &f in &diff.subs {
            removed.push(make_index(perspective, king, f).index());
        }
    }

    /// True when this diff breaks the incremental chain for
    /// `perspective`: its king moved across a bucket boundary or flipped
    /// the mirror. A pure function of the diff, so a cached judgement is
    /// valid for every thread.
    pub fn requires_refresh(diff: &DirtyPiece, perspective: Colour) -> bool {
        let moved_king = diff
            .subs
            .iter()
            .find(|f| {
                f.piece.piece_type() == PieceType::King && f.piece.colour() == perspective
            })
            .map(|f| f.sq);
        let Some(from) = moved_king else {
            return false;
        };
        let to = diff
            .adds
            .iter()
            .find(|f| {
                f.piece.piece_type() == PieceType::King && f.piece.colour() == perspective
            })
            .map(|f| f.sq)
            .expect("king removed but not re-added");
        orientation(perspective, from) != orientation(perspective, to)
    }
}

pub mod threat {
    use super::*;

    pub const DIMS: usize = THREAT_DIMS;

    /// Index of one threatened-piece feature from one perspective.
    pub fn make_index(perspective: Colour, f: FeatureUpdate) -> FeatureIndex {
        const COLOUR_STRIDE: usize = 64 * 6;
        const PIECE_STRIDE: usize = 64;

        let sq = f.sq.relative_to(perspective);
        let colour = usize::from(f.piece.colour() != perspective);
        let piece_type = f.piece.piece_type().index();

        let idx = colour * COLOUR_STRIDE + piece_type * PIECE_STRIDE + sq.index();
        assert!(idx < DIMS, "attempt to construct illegal FeatureIndex");
        FeatureIndex(idx)
    }

    /// The active threat features of a position: every piece standing on
    /// a square its opponent attacks.
    pub fn append_active(threatened: &ThreatList, perspective: Colour, out: &mut IndexList) {
        for &f in threatened {
            out.push(make_index(perspective, f).index());
        }
    }

    /// The index changes between two consecutive threat lists. The
    /// symmetric difference is computed on the raw records, so fusing
    /// plies cannot change the outcome.
    pub fn append_changed(
        perspective: Colour,
        prev: &ThreatList,
        cur: &ThreatList,
        added: &mut IndexList,
        removed: &mut IndexList,
    ) {
        for &f in cur {
            if !prev.contains(&f) {
                added.push(make_index(perspective, f).index());
            }
        }
        for &f in prev {
            if !cur.contains(&f) {
                removed.push(make_index(perspective, f).index());
            }
        }
    }

    /// Threat features carry no king dependence, so the chain never
    /// breaks.
    pub const fn requires_refresh(_diff: &DirtyPiece, _perspective: Colour) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::piece::Piece;

    #[test]
    fn psq_indices_are_in_range_for_all_inputs() {
        for perspective in Colour::all() {
            for king in Square::all() {
                for piece in Piece::all() {
                    for sq in Square::all() {
                        let idx =
                            psq::make_index(perspective, king, FeatureUpdate { sq, piece });
                        assert!(idx.index() < psq::DIMS);
                    }
                }
            }
        }
    }

    #[test]
    fn threat_indices_are_in_range_and_perspective_symmetric() {
        for perspective in Colour::all() {
            for piece in Piece::all() {
                for sq in Square::all() {
                    let idx = threat::make_index(perspective, FeatureUpdate { sq, piece });
                    assert!(idx.index() < threat::DIMS);
                }
            }
        }
        // a white piece from white's view indexes like the mirrored
        // black piece from black's view
        let white_view = threat::make_index(
            Colour::White,
            FeatureUpdate {
                sq: Square::E4,
                piece: Piece::WN,
            },
        );
        let black_view = threat::make_index(
            Colour::Black,
            FeatureUpdate {
                sq: Square::E5,
                piece: Piece::BN,
            },
        );
        assert_eq!(white_view.index(), black_view.index());
    }

    #[test]
    fn king_bucket_refresh_triggers_on_bucket_crossing() {
        let mut diff = DirtyPiece::default();
        diff.move_piece(Square::E1, Square::G1, Piece::WK);
        // e1 sits in the mirrored half, g1 does not: refresh needed
        assert!(psq::requires_refresh(&diff, Colour::White));
        // black's king did not move
        assert!(!psq::requires_refresh(&diff, Colour::Black));

        let mut diff = DirtyPiece::default();
        diff.move_piece(Square::B1, Square::A1, Piece::WK);
        // both squares share bucket 0, unmirrored
        assert!(!psq::requires_refresh(&diff, Colour::White));
    }
}
