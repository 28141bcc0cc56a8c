use std::{
    fmt::{Display, Formatter},
    ops::{Deref, DerefMut},
};

use arrayvec::ArrayVec;

use crate::{
    cfor,
    chess::{
        board::Board,
        chessmove::{Move, MoveKind},
        magic::{
            bishop_attacks_on_the_fly, magic_index, rook_attacks_on_the_fly, BISHOP_ATTACKS,
            BISHOP_REL_BITS, BISHOP_TABLE, ROOK_ATTACKS, ROOK_REL_BITS, ROOK_TABLE,
        },
        piece::{Black, Col, Colour, PieceType, White},
        squareset::SquareSet,
        types::{Rank, Square},
    },
    util::MAX_MOVES,
};

/// What a generation pass should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenKind {
    Captures,
    Quiets,
    Evasions,
    NonEvasions,
    Legal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveListEntry {
    pub mov: Move,
    pub score: i32,
}

/// A caller-provided move buffer with room for 256 moves, comfortably
/// above the 218 any legal position can reach.
#[derive(Clone, Debug, Default)]
pub struct MoveList {
    inner: ArrayVec<MoveListEntry, MAX_MOVES>,
}

impl MoveList {
    pub fn new() -> Self {
        Self {
            inner: ArrayVec::new(),
        }
    }

    pub fn push(&mut self, mov: Move) {
        self.inner.push(MoveListEntry { mov, score: 0 });
    }

    pub fn iter_moves(&self) -> impl Iterator<Item = &Move> {
        self.inner.iter().map(|e| &e.mov)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl Deref for MoveList {
    type Target = [MoveListEntry];

    fn deref(&self) -> &[MoveListEntry] {
        &self.inner
    }
}

impl DerefMut for MoveList {
    fn deref_mut(&mut self) -> &mut [MoveListEntry] {
        &mut self.inner
    }
}

impl Display for MoveList {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        if self.inner.is_empty() {
            return write!(f, "MoveList: (0) []");
        }
        writeln!(f, "MoveList: ({}) [", self.inner.len())?;
        for e in &self.inner {
            writeln!(f, "  {} ${},", e.mov.display(false), e.score)?;
        }
        write!(f, "]")
    }
}

const fn in_between(sq1: Square, sq2: Square) -> SquareSet {
    const M1: u64 = 0xFFFF_FFFF_FFFF_FFFF;
    const A2A7: u64 = 0x0001_0101_0101_0100;
    const B2G7: u64 = 0x0040_2010_0804_0200;
    const H1B7: u64 = 0x0002_0408_1020_4080;
    let sq1 = sq1.index();
    let sq2 = sq2.index();
    let btwn = (M1 << sq1) ^ (M1 << sq2);
    let file = ((sq2 & 7).wrapping_add((sq1 & 7).wrapping_neg())) as u64;
    let rank = (((sq2 | 7).wrapping_sub(sq1)) >> 3) as u64;
    let mut line = ((file & 7).wrapping_sub(1)) & A2A7;
    line += 2 * ((rank & 7).wrapping_sub(1) >> 58);
    line += ((rank.wrapping_sub(file) & 15).wrapping_sub(1)) & B2G7;
    line += ((rank.wrapping_add(file) & 15).wrapping_sub(1)) & H1B7;
    line = line.wrapping_mul(btwn & btwn.wrapping_neg());
    SquareSet::from_inner(line & btwn)
}

/// The squares strictly between two squares, when collinear.
pub static RAY_BETWEEN: [[SquareSet; 64]; 64] = {
    let mut res = [[SquareSet::EMPTY; 64]; 64];
    cfor!(let mut from = 0; from < 64; from += 1; {
        cfor!(let mut to = 0; to < 64; to += 1; {
            res[from][to] = in_between(
                Square::new_clamped(from as u8),
                Square::new_clamped(to as u8),
            );
        });
    });
    res
};

/// The full line through two squares (empty when not collinear),
/// including both endpoints.
pub static RAY_FULL: [[SquareSet; 64]; 64] = {
    let mut rook_rays = [SquareSet::EMPTY; 64];
    let mut bishop_rays = [SquareSet::EMPTY; 64];
    cfor!(let mut sq = 0; sq < 64; sq += 1; {
        rook_rays[sq] = rook_attacks_on_the_fly(Square::new_clamped(sq as u8), SquareSet::EMPTY);
        bishop_rays[sq] = bishop_attacks_on_the_fly(Square::new_clamped(sq as u8), SquareSet::EMPTY);
    });

    let mut res = [[SquareSet::EMPTY; 64]; 64];
    cfor!(let mut from = 0; from < 64; from += 1; {
        let from_mask = SquareSet::from_inner(1 << from);
        cfor!(let mut to = 0; to < 64; to += 1; {
            let to_mask = SquareSet::from_inner(1 << to);
            if from != to {
                if rook_rays[from].contains_square(Square::new_clamped(to as u8)) {
                    res[from][to] = SquareSet::intersection(
                        rook_rays[from].union(from_mask),
                        rook_rays[to].union(to_mask),
                    );
                } else if bishop_rays[from].contains_square(Square::new_clamped(to as u8)) {
                    res[from][to] = SquareSet::intersection(
                        bishop_rays[from].union(from_mask),
                        bishop_rays[to].union(to_mask),
                    );
                }
            }
        });
    });
    res
};

const fn init_jumping_attacks<const IS_KNIGHT: bool>() -> [SquareSet; 64] {
    let mut attacks = [SquareSet::EMPTY; 64];
    let deltas: &[i8] = if IS_KNIGHT {
        &[17, 15, 10, 6, -17, -15, -10, -6]
    } else {
        &[9, 8, 7, 1, -9, -8, -7, -1]
    };

    cfor!(let mut sq = 0; sq < 64; sq += 1; {
        let square = Square::new_clamped(sq as u8);
        let mut attacks_bb = 0u64;
        cfor!(let mut idx = 0; idx < 8; idx += 1; {
            let attacked = square.signed_inner() + deltas[idx];
            #[allow(clippy::cast_sign_loss)]
            if 0 <= attacked
                && attacked < 64
                && Square::distance(square, Square::new_clamped(attacked as u8)) <= 2
            {
                attacks_bb |= 1 << attacked;
            }
        });
        attacks[sq] = SquareSet::from_inner(attacks_bb);
    });

    attacks
}

pub fn bishop_attacks(sq: Square, blockers: SquareSet) -> SquareSet {
    let entry = &BISHOP_TABLE[sq.index()];
    BISHOP_ATTACKS[sq.index()][magic_index(blockers & entry.mask, entry.magic, BISHOP_REL_BITS)]
}

pub fn rook_attacks(sq: Square, blockers: SquareSet) -> SquareSet {
    let entry = &ROOK_TABLE[sq.index()];
    ROOK_ATTACKS[sq.index()][magic_index(blockers & entry.mask, entry.magic, ROOK_REL_BITS)]
}

pub fn queen_attacks(sq: Square, blockers: SquareSet) -> SquareSet {
    bishop_attacks(sq, blockers) | rook_attacks(sq, blockers)
}

pub fn knight_attacks(sq: Square) -> SquareSet {
    static KNIGHT_ATTACKS: [SquareSet; 64] = init_jumping_attacks::<true>();
    KNIGHT_ATTACKS[sq.index()]
}

pub fn king_attacks(sq: Square) -> SquareSet {
    static KING_ATTACKS: [SquareSet; 64] = init_jumping_attacks::<false>();
    KING_ATTACKS[sq.index()]
}

/// The squares attacked by pawns of colour `C` standing on `pawns`.
pub fn pawn_attacks<C: Col>(pawns: SquareSet) -> SquareSet {
    if C::WHITE {
        pawns.north_east_one() | pawns.north_west_one()
    } else {
        pawns.south_east_one() | pawns.south_west_one()
    }
}

/// The squares from which pawns of colour `side` attack `targets`.
pub fn pawn_attacks_by(targets: SquareSet, side: Colour) -> SquareSet {
    match side {
        Colour::White => pawn_attacks::<White>(targets),
        Colour::Black => pawn_attacks::<Black>(targets),
    }
}

pub fn attacks_by_type(pt: PieceType, sq: Square, blockers: SquareSet) -> SquareSet {
    match pt {
        PieceType::Knight => knight_attacks(sq),
        PieceType::Bishop => bishop_attacks(sq, blockers),
        PieceType::Rook => rook_attacks(sq, blockers),
        PieceType::Queen => queen_attacks(sq, blockers),
        PieceType::King => king_attacks(sq),
        PieceType::Pawn => panic!("pawn attacks are colour-dependent"),
    }
}

impl Board {
    /// Generates pseudo-legal moves of the requested kind into `out`.
    /// `Legal` additionally filters through `Board::legal`. Output order
    /// is deterministic for a given position.
    pub fn generate(&self, kind: GenKind, out: &mut MoveList) {
        out.clear();
        match kind {
            GenKind::Captures => self.generate_dispatch(false, true, out),
            GenKind::Quiets => self.generate_dispatch(true, false, out),
            GenKind::NonEvasions | GenKind::Evasions => {
                self.generate_dispatch(true, true, out);
            }
            GenKind::Legal => {
                self.generate_dispatch(true, true, out);
                out.inner.retain(|e| self.legal(e.mov));
            }
        }
    }

    fn generate_dispatch(&self, quiets: bool, captures: bool, out: &mut MoveList) {
        match self.turn() {
            Colour::White => self.generate_for::<White>(quiets, captures, out),
            Colour::Black => self.generate_for::<Black>(quiets, captures, out),
        }
    }

    fn generate_for<C: Col>(&self, quiets: bool, captures: bool, out: &mut MoveList) {
        let bbs = &self.state.bbs;
        let us = bbs.colours[C::COLOUR];
        let them = bbs.colours[C::Opposite::COLOUR];
        let occupied = bbs.occupied();
        let king_sq = bbs.king_sq(C::COLOUR);
        let checkers = self.state.checkers;
        let in_check = checkers != SquareSet::EMPTY;
        let enemy_threats = self.state.threats[C::Opposite::COLOUR];

        // when exactly one piece gives check, non-king moves must land
        // on the checker or between it and the king.
        let evasion_mask = if in_check {
            if checkers.many() {
                SquareSet::EMPTY
            } else {
                let checker = checkers.first().unwrap();
                checkers | RAY_BETWEEN[king_sq.index()][checker.index()]
            }
        } else {
            SquareSet::FULL
        };

        self.generate_pawn_moves::<C>(quiets, captures, evasion_mask, out);

        if evasion_mask != SquareSet::EMPTY {
            let mut target = SquareSet::EMPTY;
            if quiets {
                target |= !occupied;
            }
            if captures {
                target |= them;
            }
            target &= evasion_mask;

            for from in bbs.pieces[PieceType::Knight] & us {
                for to in knight_attacks(from) & target {
                    out.push(Move::new(from, to));
                }
            }
            for from in (bbs.pieces[PieceType::Bishop] | bbs.pieces[PieceType::Queen]) & us {
                for to in bishop_attacks(from, occupied) & target {
                    out.push(Move::new(from, to));
                }
            }
            for from in (bbs.pieces[PieceType::Rook] | bbs.pieces[PieceType::Queen]) & us {
                for to in rook_attacks(from, occupied) & target {
                    out.push(Move::new(from, to));
                }
            }
        }

        // king moves ignore the evasion mask; stepping onto an attacked
        // square is rejected here, and sliders that would see through the
        // king are handled in `legal`.
        let mut king_target = SquareSet::EMPTY;
        if quiets {
            king_target |= !occupied;
        }
        if captures {
            king_target |= them;
        }
        for to in king_attacks(king_sq) & king_target & !enemy_threats {
            out.push(Move::new(king_sq, to));
        }

        if quiets && !in_check {
            self.generate_castling::<C>(out);
        }
    }

    fn generate_pawn_moves<C: Col>(
        &self,
        quiets: bool,
        captures: bool,
        evasion_mask: SquareSet,
        out: &mut MoveList,
    ) {
        #![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
        let bbs = &self.state.bbs;
        let us = bbs.colours[C::COLOUR];
        let them = bbs.colours[C::Opposite::COLOUR];
        let occupied = bbs.occupied();
        let our_pawns = bbs.pieces[PieceType::Pawn] & us;

        let promo_rank = if C::WHITE {
            SquareSet::RANK_8
        } else {
            SquareSet::RANK_1
        };
        let double_rank = if C::WHITE {
            SquareSet::RANK_4
        } else {
            SquareSet::RANK_5
        };

        let shifted = |set: SquareSet, offset: i8| -> SquareSet {
            if offset >= 0 {
                set << offset as u8
            } else {
                set >> (-offset) as u8
            }
        };
        let from_of = |to: Square, offset: i8| -> Square {
            // SAFETY: the shifted sets only contain squares whose
            // pre-image is on the board.
            unsafe { Square::new_unchecked((to.signed_inner() - offset) as u8) }
        };

        if quiets {
            let pushes = shifted(our_pawns, C::PAWN_FWD_OFFSET) & !occupied;
            let doubles = shifted(pushes, C::PAWN_FWD_OFFSET) & !occupied & double_rank;
            for to in pushes & !promo_rank & evasion_mask {
                out.push(Move::new(from_of(to, C::PAWN_FWD_OFFSET), to));
            }
            for to in doubles & evasion_mask {
                out.push(Move::new(from_of(to, C::PAWN_DOUBLE_OFFSET), to));
            }
            // quiet underpromotions; the queen rides with the captures
            for to in pushes & promo_rank & evasion_mask {
                let from = from_of(to, C::PAWN_FWD_OFFSET);
                for promo in [PieceType::Knight, PieceType::Bishop, PieceType::Rook] {
                    out.push(Move::new_promotion(from, to, promo));
                }
            }
        }

        if captures {
            let west = shifted(our_pawns & !SquareSet::FILE_A, C::PAWN_LEFT_OFFSET) & them;
            let east = shifted(our_pawns & !SquareSet::FILE_H, C::PAWN_RIGHT_OFFSET) & them;
            for (targets, offset) in [(west, C::PAWN_LEFT_OFFSET), (east, C::PAWN_RIGHT_OFFSET)] {
                for to in targets & !promo_rank & evasion_mask {
                    out.push(Move::new(from_of(to, offset), to));
                }
                for to in targets & promo_rank & evasion_mask {
                    let from = from_of(to, offset);
                    out.push(Move::new_promotion(from, to, PieceType::Queen));
                    for promo in [PieceType::Knight, PieceType::Bishop, PieceType::Rook] {
                        out.push(Move::new_promotion(from, to, promo));
                    }
                }
            }

            // queen push-promotions count as tactical
            let pushes = shifted(our_pawns, C::PAWN_FWD_OFFSET) & !occupied;
            for to in pushes & promo_rank & evasion_mask {
                out.push(Move::new_promotion(
                    from_of(to, C::PAWN_FWD_OFFSET),
                    to,
                    PieceType::Queen,
                ));
            }

            if let Some(ep_sq) = self.state.ep_square {
                // the ep capture can also evade by removing the checking pawn
                let capture_sq = ep_sq.pawn_push(C::Opposite::COLOUR).unwrap();
                if evasion_mask.contains_square(ep_sq)
                    || self.state.checkers.contains_square(capture_sq)
                {
                    let sources = pawn_attacks_by(ep_sq.as_set(), C::Opposite::COLOUR) & our_pawns;
                    for from in sources {
                        out.push(Move::new_with_kind(from, ep_sq, MoveKind::EnPassant));
                    }
                }
            }
        }
    }

    fn generate_castling<C: Col>(&self, out: &mut MoveList) {
        let bbs = &self.state.bbs;
        let occupied = bbs.occupied();
        let king_sq = bbs.king_sq(C::COLOUR);
        let home_rank = Rank::One.relative_to(C::COLOUR);
        let enemy_threats = self.state.threats[C::Opposite::COLOUR];

        let sides = [
            (self.state.castle_perm.kingside(C::COLOUR), Square::G1),
            (self.state.castle_perm.queenside(C::COLOUR), Square::C1),
        ];
        for (rook_file, king_dst_base) in sides {
            let Some(rook_file) = rook_file else {
                continue;
            };
            let rook_sq = Square::from_rank_file(home_rank, rook_file);
            let king_dst = king_dst_base.relative_to(C::COLOUR);
            let rook_dst = if king_dst_base == Square::G1 {
                Square::F1.relative_to(C::COLOUR)
            } else {
                Square::D1.relative_to(C::COLOUR)
            };

            // the squares both pieces cross must be empty, not counting
            // the king and the rook themselves.
            let king_path = RAY_BETWEEN[king_sq.index()][king_dst.index()];
            let rook_path = RAY_BETWEEN[rook_sq.index()][rook_dst.index()];
            let castle_occ = occupied ^ king_sq.as_set() ^ rook_sq.as_set();
            if castle_occ
                & (king_path | rook_path | king_dst.as_set() | rook_dst.as_set())
                != SquareSet::EMPTY
            {
                continue;
            }

            // the king may not cross an attacked square; its destination
            // is re-checked in `legal`.
            if king_path & enemy_threats != SquareSet::EMPTY {
                continue;
            }

            out.push(Move::new_with_kind(king_sq, rook_sq, MoveKind::Castle));
        }
    }

    /// All strictly-legal moves, generated and filtered.
    pub fn legal_moves(&self) -> ArrayVec<Move, MAX_MOVES> {
        let mut list = MoveList::new();
        self.generate(GenKind::Legal, &mut list);
        list.iter_moves().copied().collect()
    }

    pub fn has_legal_moves(&self) -> bool {
        let mut list = MoveList::new();
        self.generate(GenKind::NonEvasions, &mut list);
        let result = list.iter_moves().any(|&m| self.legal(m));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_between_is_symmetric_and_empty_for_knight_pairs() {
        assert_eq!(
            RAY_BETWEEN[Square::A1.index()][Square::H8.index()],
            RAY_BETWEEN[Square::H8.index()][Square::A1.index()],
        );
        assert_eq!(
            RAY_BETWEEN[Square::A1.index()][Square::B3.index()],
            SquareSet::EMPTY,
        );
        assert_eq!(
            RAY_BETWEEN[Square::A1.index()][Square::A8.index()].count(),
            6,
        );
    }

    #[test]
    fn jumping_attack_tables_match_reference_counts() {
        // counts validated against the python-chess tables
        assert_eq!(knight_attacks(Square::A1).inner(), 132_096);
        assert_eq!(knight_attacks(Square::H8).inner(), 9_077_567_998_918_656);
        assert_eq!(king_attacks(Square::A1).inner(), 770);
        assert_eq!(king_attacks(Square::H8).inner(), 4_665_729_213_955_833_856);
    }

    #[test]
    fn startpos_has_twenty_legal_moves() {
        let board = Board::default();
        assert_eq!(board.legal_moves().len(), 20);
    }

    #[test]
    fn legal_is_a_subset_of_pseudolegal() {
        let board = Board::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();
        let mut pseudo = MoveList::new();
        board.generate(GenKind::NonEvasions, &mut pseudo);
        let pseudo: Vec<_> = pseudo.iter_moves().copied().collect();
        for m in board.legal_moves() {
            assert!(pseudo.contains(&m));
            assert!(board.legal(m));
        }
    }
}
