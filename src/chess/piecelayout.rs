use std::fmt::Display;

use crate::chess::{
    board::movegen::{bishop_attacks, king_attacks, knight_attacks, pawn_attacks, rook_attacks},
    piece::{Black, Col, Colour, Piece, PieceType, White},
    squareset::SquareSet,
    types::{File, Rank, Square},
};

/// The square-sets of all the pieces on the board: one set per piece
/// kind, one per colour; the full occupancy is their union.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PieceLayout {
    pub pieces: [SquareSet; 6],
    pub colours: [SquareSet; 2],
}

impl PieceLayout {
    pub fn occupied(&self) -> SquareSet {
        self.colours[Colour::White] | self.colours[Colour::Black]
    }

    pub fn occupied_co(&self, colour: Colour) -> SquareSet {
        self.colours[colour]
    }

    pub fn of_type(&self, piece_type: PieceType) -> SquareSet {
        self.pieces[piece_type]
    }

    pub fn piece_bb(&self, piece: Piece) -> SquareSet {
        self.pieces[piece.piece_type()] & self.colours[piece.colour()]
    }

    pub fn pawns(&self, colour: Colour) -> SquareSet {
        self.pieces[PieceType::Pawn] & self.colours[colour]
    }

    pub fn king_sq(&self, colour: Colour) -> Square {
        debug_assert!((self.pieces[PieceType::King] & self.colours[colour]).one());
        (self.pieces[PieceType::King] & self.colours[colour])
            .first()
            .expect("no king on the board")
    }

    pub fn diag_sliders(&self, colour: Colour) -> SquareSet {
        (self.pieces[PieceType::Bishop] | self.pieces[PieceType::Queen]) & self.colours[colour]
    }

    pub fn orth_sliders(&self, colour: Colour) -> SquareSet {
        (self.pieces[PieceType::Rook] | self.pieces[PieceType::Queen]) & self.colours[colour]
    }

    pub fn set_piece_at(&mut self, sq: Square, piece: Piece) {
        let sq_bb = sq.as_set();
        self.pieces[piece.piece_type()] |= sq_bb;
        self.colours[piece.colour()] |= sq_bb;
    }

    pub fn clear_piece_at(&mut self, sq: Square, piece: Piece) {
        let sq_bb = sq.as_set();
        self.pieces[piece.piece_type()] &= !sq_bb;
        self.colours[piece.colour()] &= !sq_bb;
    }

    pub fn move_piece(&mut self, from: Square, to: Square, piece: Piece) {
        let from_to_bb = from.as_set() | to.as_set();
        self.pieces[piece.piece_type()] ^= from_to_bb;
        self.colours[piece.colour()] ^= from_to_bb;
    }

    /// The set of pieces of either colour whose moves target `sq`,
    /// through the given occupancy.
    pub fn all_attackers_to_sq(&self, sq: Square, occupied: SquareSet) -> SquareSet {
        let sq_bb = sq.as_set();
        let black_pawn_attackers = pawn_attacks::<White>(sq_bb) & self.pawns(Colour::Black);
        let white_pawn_attackers = pawn_attacks::<Black>(sq_bb) & self.pawns(Colour::White);
        let knight_attackers = knight_attacks(sq) & self.pieces[PieceType::Knight];
        let diag_attackers = bishop_attacks(sq, occupied)
            & (self.pieces[PieceType::Bishop] | self.pieces[PieceType::Queen]);
        let orth_attackers = rook_attacks(sq, occupied)
            & (self.pieces[PieceType::Rook] | self.pieces[PieceType::Queen]);
        let king_attackers = king_attacks(sq) & self.pieces[PieceType::King];
        black_pawn_attackers
            | white_pawn_attackers
            | knight_attackers
            | diag_attackers
            | orth_attackers
            | king_attackers
    }

    /// Every square attacked by `colour`, through the full occupancy.
    pub fn attacks_by(&self, colour: Colour) -> SquareSet {
        let mut threats = SquareSet::EMPTY;
        let occupied = self.occupied();
        let us = self.colours[colour];

        threats |= match colour {
            Colour::White => pawn_attacks::<White>(self.pawns(colour)),
            Colour::Black => pawn_attacks::<Black>(self.pawns(colour)),
        };
        for sq in self.pieces[PieceType::Knight] & us {
            threats |= knight_attacks(sq);
        }
        for sq in (self.pieces[PieceType::Bishop] | self.pieces[PieceType::Queen]) & us {
            threats |= bishop_attacks(sq, occupied);
        }
        for sq in (self.pieces[PieceType::Rook] | self.pieces[PieceType::Queen]) & us {
            threats |= rook_attacks(sq, occupied);
        }
        threats |= king_attacks(self.king_sq(colour));

        threats
    }

    pub fn piece_at(&self, sq: Square) -> Option<Piece> {
        let sq_bb = sq.as_set();
        let colour = if (self.colours[Colour::White] & sq_bb) != SquareSet::EMPTY {
            Colour::White
        } else if (self.colours[Colour::Black] & sq_bb) != SquareSet::EMPTY {
            Colour::Black
        } else {
            return None;
        };
        for piece_type in PieceType::all() {
            if (self.pieces[piece_type] & sq_bb) != SquareSet::EMPTY {
                return Some(Piece::new(colour, piece_type));
            }
        }
        panic!("bit set in colour square-set for {colour:?} but not in any piece square-set, square {sq}");
    }

    /// Calls `callback` for each piece added or removed going from `self`
    /// to `target`. Drives the king-bucket refresh cache.
    pub fn update_iter(&self, target: Self, mut callback: impl FnMut(Square, Piece, bool)) {
        for colour in Colour::all() {
            for piece_type in PieceType::all() {
                let piece = Piece::new(colour, piece_type);
                let source_bb = self.pieces[piece_type] & self.colours[colour];
                let target_bb = target.pieces[piece_type] & target.colours[colour];
                for sq in target_bb & !source_bb {
                    callback(sq, piece, true);
                }
                for sq in source_bb & !target_bb {
                    callback(sq, piece, false);
                }
            }
        }
    }

    pub fn visit_pieces(&self, mut callback: impl FnMut(Square, Piece)) {
        for colour in Colour::all() {
            for piece_type in PieceType::all() {
                let piece = Piece::new(colour, piece_type);
                for sq in self.pieces[piece_type] & self.colours[colour] {
                    callback(sq, piece);
                }
            }
        }
    }

    pub fn any_bbs_overlapping(&self) -> bool {
        if (self.colours[0] & self.colours[1]) != SquareSet::EMPTY {
            return true;
        }
        for i in 0..self.pieces.len() {
            for j in i + 1..self.pieces.len() {
                if (self.pieces[i] & self.pieces[j]) != SquareSet::EMPTY {
                    return true;
                }
            }
        }
        false
    }
}

impl Display for PieceLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for rank in Rank::all().rev() {
            for file in File::all() {
                let sq = Square::from_rank_file(rank, file);
                if let Some(piece) = self.piece_at(sq) {
                    write!(f, " {}", piece.char())?;
                } else {
                    write!(f, " .")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::board::{movegen::attacks_by_type, Board};

    /// For every piece on the board, the squares it attacks are exactly
    /// the squares whose attacker set contains it.
    #[test]
    fn attackers_to_is_the_inverse_of_attacks_from() {
        for fen in [
            Board::STARTING_FEN,
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
        ] {
            let board = Board::from_fen(fen).unwrap();
            let bbs = &board.state().bbs;
            let occupied = bbs.occupied();

            bbs.visit_pieces(|from, piece| {
                let attacks = match (piece.piece_type(), piece.colour()) {
                    (PieceType::Pawn, Colour::White) => pawn_attacks::<White>(from.as_set()),
                    (PieceType::Pawn, Colour::Black) => pawn_attacks::<Black>(from.as_set()),
                    (pt, _) => attacks_by_type(pt, from, occupied),
                };
                for sq in Square::all() {
                    assert_eq!(
                        attacks.contains_square(sq),
                        bbs.all_attackers_to_sq(sq, occupied).contains_square(from),
                        "asymmetry between {piece} on {from} and {sq} in {fen}",
                    );
                }
            });
        }
    }
}
