#![allow(dead_code)]

use crate::{
    chess::{
        board::Board,
        piece::{Colour, Piece, PieceType},
        squareset::SquareSet,
        types::Rank,
    },
    lookups::{CASTLE_KEYS, EP_KEYS, NO_PAWNS_KEY, PIECE_KEYS, SIDE_KEY},
};

impl Board {
    /// Checks every invariant the position promises to maintain. Only
    /// compiled into debug builds; release behaves as if absent.
    #[cfg(debug_assertions)]
    pub fn check_validity(&self) {
        let bbs = &self.state.bbs;

        // the colour sets partition the occupancy
        debug_assert_eq!(
            bbs.occupied(),
            bbs.colours[Colour::White] | bbs.colours[Colour::Black],
        );
        debug_assert_eq!(
            bbs.colours[Colour::White] & bbs.colours[Colour::Black],
            SquareSet::EMPTY,
        );

        // the piece-kind sets partition the occupancy
        let mut union = SquareSet::EMPTY;
        for pt in PieceType::all() {
            debug_assert_eq!(union & bbs.pieces[pt], SquareSet::EMPTY);
            union |= bbs.pieces[pt];
        }
        debug_assert_eq!(union, bbs.occupied());

        // exactly one king per side
        for colour in Colour::all() {
            debug_assert!((bbs.pieces[PieceType::King] & bbs.colours[colour]).one());
        }

        // the mailbox mirrors the square-sets
        for sq in crate::chess::types::Square::all() {
            debug_assert_eq!(self.state.mailbox[sq], bbs.piece_at(sq));
        }

        // piece counts match the sets
        for piece in Piece::all() {
            debug_assert_eq!(
                u32::from(self.state.piece_count[piece]),
                bbs.piece_bb(piece).count(),
            );
        }

        // a set en-passant square sits on the relative sixth rank
        if let Some(ep_sq) = self.state.ep_square {
            debug_assert_eq!(ep_sq.rank(), Rank::Six.relative_to(self.turn()));
        }

        // every incremental key equals its from-scratch recomputation
        let mut zobrist = 0;
        let mut pawn = NO_PAWNS_KEY;
        let mut material = 0;
        let mut non_pawn = [0u64; 2];
        bbs.visit_pieces(|sq, piece| {
            let key = PIECE_KEYS[piece][sq];
            zobrist ^= key;
            if piece.piece_type() == PieceType::Pawn {
                pawn ^= key;
            } else {
                non_pawn[piece.colour()] ^= key;
            }
        });
        for piece in Piece::all() {
            for n in 0..self.state.piece_count[piece] {
                material ^= PIECE_KEYS[piece][n as usize];
            }
        }
        zobrist ^= CASTLE_KEYS[self.state.castle_perm.hashkey_index()];
        if let Some(ep_sq) = self.state.ep_square {
            zobrist ^= EP_KEYS[ep_sq.file()];
        }
        if self.turn() == Colour::Black {
            zobrist ^= SIDE_KEY;
        }
        debug_assert_eq!(self.state.keys.zobrist, zobrist);
        debug_assert_eq!(self.state.keys.pawn, pawn);
        debug_assert_eq!(self.state.keys.material, material);
        debug_assert_eq!(self.state.keys.non_pawn, non_pawn);

        // the recorded checkers are exactly the attackers of our king
        let king_sq = bbs.king_sq(self.turn());
        debug_assert_eq!(
            self.state.checkers,
            self.attackers_to(king_sq, bbs.occupied()) & bbs.colours[!self.turn()],
        );
    }
}
