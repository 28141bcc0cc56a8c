pub mod movegen;
pub mod validation;

use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::atomic::Ordering,
};

use movegen::{
    attacks_by_type, bishop_attacks, pawn_attacks_by, rook_attacks, RAY_BETWEEN, RAY_FULL,
};

use crate::{
    chess::{
        chessmove::{Move, MoveKind},
        fen::Fen,
        piece::{Black, Colour, Piece, PieceType, White},
        squareset::SquareSet,
        types::{CastlingRights, FeatureUpdate, File, Rank, Square, State},
        CHESS960,
    },
    cuckoo,
    errors::{FenParseError, MoveParseError},
    lookups::{CASTLE_KEYS, EP_KEYS, NO_PAWNS_KEY, PIECE_KEYS, SIDE_KEY},
};

/// Midgame piece values, used for the non-pawn-material tally that gates
/// null-move pruning.
pub const PIECE_VALUES: [i32; 6] = [126, 781, 825, 1276, 2538, 0];

/// A chess position, plus the stack of per-ply states that makes
/// unmaking a move a single pop.
#[derive(PartialEq, Eq, Clone)]
pub struct Board {
    pub(crate) state: State,
    /// The side to move.
    side: Colour,
    /// Halfmoves since the start of the game.
    ply: usize,
    /// Distance from the search root.
    height: usize,
    history: Vec<State>,
}

impl Board {
    pub const STARTING_FEN: &'static str =
        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    pub const STARTING_FEN_960: &'static str =
        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w HAha - 0 1";

    pub fn empty() -> Self {
        Self {
            state: State::default(),
            side: Colour::White,
            ply: 0,
            height: 0,
            history: Vec::new(),
        }
    }

    pub const fn turn(&self) -> Colour {
        self.side
    }

    pub const fn ply(&self) -> usize {
        self.ply
    }

    pub const fn height(&self) -> usize {
        self.height
    }

    pub fn zero_height(&mut self) {
        self.height = 0;
    }

    pub const fn ep_sq(&self) -> Option<Square> {
        self.state.ep_square
    }

    pub const fn rule50(&self) -> u8 {
        self.state.rule50
    }

    pub fn in_check(&self) -> bool {
        self.state.checkers != SquareSet::EMPTY
    }

    pub const fn checkers(&self) -> SquareSet {
        self.state.checkers
    }

    pub fn zobrist_key(&self) -> u64 {
        self.state.keys.zobrist
    }

    pub fn pawn_key(&self) -> u64 {
        self.state.keys.pawn
    }

    pub fn material_key(&self) -> u64 {
        self.state.keys.material
    }

    pub fn piece_at(&self, sq: Square) -> Option<Piece> {
        self.state.mailbox[sq]
    }

    pub fn piece_count(&self, piece: Piece) -> u8 {
        self.state.piece_count[piece]
    }

    pub fn occupied(&self) -> SquareSet {
        self.state.bbs.occupied()
    }

    pub fn king_sq(&self, colour: Colour) -> Square {
        self.state.bbs.king_sq(colour)
    }

    pub fn threats(&self, by: Colour) -> SquareSet {
        self.state.threats[by]
    }

    pub const fn castling_rights(&self) -> CastlingRights {
        self.state.castle_perm
    }

    pub fn non_pawn_material(&self, colour: Colour) -> i32 {
        self.state.non_pawn_material[colour]
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.state = State::default();
        self.side = Colour::White;
        self.ply = 0;
        self.height = 0;
        self.history.clear();
    }

    /// The set of pieces of either colour attacking `sq` through `occ`.
    pub fn attackers_to(&self, sq: Square, occ: SquareSet) -> SquareSet {
        self.state.bbs.all_attackers_to_sq(sq, occ)
    }

    pub fn sq_attacked(&self, sq: Square, by: Colour) -> bool {
        self.attackers_to(sq, self.occupied()) & self.state.bbs.colours[by] != SquareSet::EMPTY
    }

    // ------------------------------------------------------------------
    // position setup

    pub fn set_from_fen(&mut self, fen: &Fen) {
        self.reset();

        self.state.bbs = fen.board;
        for sq in Square::all() {
            self.state.mailbox[sq] = fen.board.piece_at(sq);
        }
        for (piece, count) in self.state.piece_count.iter_mut().enumerate() {
            let piece = Piece::from_index(piece as u8).unwrap();
            *count = self.state.bbs.piece_bb(piece).count() as u8;
        }

        self.side = fen.turn;
        self.state.castle_perm = fen.castling;
        self.state.ep_square = fen.ep;
        self.state.rule50 = fen.halfmove;
        self.ply = (fen.fullmove - 1) * 2 + usize::from(self.side == Colour::Black);

        self.regenerate_keys();
        self.state.non_pawn_material = self.compute_non_pawn_material();
        self.update_derived_state();

        // only keep a legally-capturable en-passant square
        if !self.ep_square_is_capturable() {
            self.state.ep_square = None;
            self.regenerate_keys();
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self, FenParseError> {
        let parsed = Fen::parse(fen)?;
        let mut out = Self::empty();
        out.set_from_fen(&parsed);
        Ok(out)
    }

    pub fn set_startpos(&mut self) {
        let starting_fen = if CHESS960.load(Ordering::SeqCst) {
            Self::STARTING_FEN_960
        } else {
            Self::STARTING_FEN
        };
        let fen = Fen::parse(starting_fen).expect("STARTING_FEN is broken");
        self.set_from_fen(&fen);
    }

    /// Sets up Fischer-random start position number `scharnagl`.
    pub fn set_frc_idx(&mut self, scharnagl: usize) {
        assert!(scharnagl < 960, "scharnagl index out of range");
        let backrank = Self::scharnagl_backrank(scharnagl);
        self.set_from_backranks(&backrank, &backrank);
    }

    /// Sets up a double-Fischer-random start position, with independent
    /// back ranks for the two sides.
    pub fn set_dfrc_idx(&mut self, scharnagl: usize) {
        assert!(scharnagl < 960 * 960, "double scharnagl index out of range");
        let white = Self::scharnagl_backrank(scharnagl % 960);
        let black = Self::scharnagl_backrank(scharnagl / 960);
        self.set_from_backranks(&white, &black);
    }

    fn set_from_backranks(&mut self, white: &[PieceType; 8], black: &[PieceType; 8]) {
        self.reset();
        for (rank, backrank, colour) in [
            (Rank::One, white, Colour::White),
            (Rank::Eight, black, Colour::Black),
        ] {
            for (&piece_type, file) in backrank.iter().zip(File::all()) {
                let sq = Square::from_rank_file(rank, file);
                let piece = Piece::new(colour, piece_type);
                self.state.bbs.set_piece_at(sq, piece);
                self.state.mailbox[sq] = Some(piece);
            }
            let pawn_rank = Rank::Two.relative_to(colour);
            for file in File::all() {
                let sq = Square::from_rank_file(pawn_rank, file);
                let pawn = Piece::new(colour, PieceType::Pawn);
                self.state.bbs.set_piece_at(sq, pawn);
                self.state.mailbox[sq] = Some(pawn);
            }
        }
        for (piece, count) in self.state.piece_count.iter_mut().enumerate() {
            let piece = Piece::from_index(piece as u8).unwrap();
            *count = self.state.bbs.piece_bb(piece).count() as u8;
        }

        let rook_files = |backrank: &[PieceType; 8]| {
            let mut rooks = backrank
                .iter()
                .enumerate()
                .filter(|&(_, &pt)| pt == PieceType::Rook)
                .map(|(i, _)| File::from_index(i as u8).unwrap());
            let queenside = rooks.next().unwrap();
            let kingside = rooks.next().unwrap();
            (kingside, queenside)
        };
        let (wk, wq) = rook_files(white);
        let (bk, bq) = rook_files(black);
        self.state.castle_perm = CastlingRights::new(Some(wk), Some(wq), Some(bk), Some(bq));

        self.regenerate_keys();
        self.state.non_pawn_material = self.compute_non_pawn_material();
        self.update_derived_state();
    }

    /// Derives a Scharnagl back rank from its number, 0..960.
    fn scharnagl_backrank(scharnagl: usize) -> [PieceType; 8] {
        // bishops on the bright and dark squares given by the low crumbs,
        // then the queen, then the knights into the remaining gaps
        let mut out = [None; 8];
        let n = scharnagl;
        let (n2, b1) = (n / 4, n % 4);
        out[b1 * 2 + 1] = Some(PieceType::Bishop);
        let (n3, b2) = (n2 / 4, n2 % 4);
        out[b2 * 2] = Some(PieceType::Bishop);
        let (n4, mut q) = (n3 / 6, n3 % 6);
        for slot in out.iter_mut() {
            if slot.is_none() {
                if q == 0 {
                    *slot = Some(PieceType::Queen);
                    break;
                }
                q -= 1;
            }
        }
        let selection = match n4 {
            0 => [0, 1],
            1 => [0, 2],
            2 => [0, 3],
            3 => [0, 4],
            4 => [1, 2],
            5 => [1, 3],
            6 => [1, 4],
            7 => [2, 3],
            8 => [2, 4],
            9 => [3, 4],
            _ => unreachable!(),
        };
        for (i, slot) in out.iter_mut().filter(|s| s.is_none()).enumerate() {
            if i == selection[0] || i == selection[1] {
                *slot = Some(PieceType::Knight);
            }
        }
        out.iter_mut()
            .filter(|s| s.is_none())
            .zip([PieceType::Rook, PieceType::King, PieceType::Rook])
            .for_each(|(slot, piece)| *slot = Some(piece));

        out.map(Option::unwrap)
    }

    /// Whether the en-passant square is actually usable: one of our pawns
    /// attacks it, the enemy pawn is on the push square, the ep square
    /// and the one behind it are empty, and at least one capture is legal.
    fn ep_square_is_capturable(&self) -> bool {
        let Some(ep_sq) = self.state.ep_square else {
            return false;
        };
        let us = self.side;
        let them = !us;
        let capture_sq = match ep_sq.pawn_push(them) {
            Some(sq) => sq,
            None => return false,
        };
        let enemy_pawn_present = self
            .state
            .bbs
            .pawns(them)
            .contains_square(capture_sq);
        let behind_empty = ep_sq
            .pawn_push(us)
            .is_some_and(|behind| self.state.mailbox[behind].is_none());
        if !enemy_pawn_present || !behind_empty || self.state.mailbox[ep_sq].is_some() {
            return false;
        }
        let sources = pawn_attacks_by(ep_sq.as_set(), them) & self.state.bbs.pawns(us);
        sources
            .into_iter()
            .map(|from| Move::new_with_kind(from, ep_sq, MoveKind::EnPassant))
            .any(|m| self.legal(m))
    }

    fn regenerate_keys(&mut self) {
        let mut zobrist = 0;
        let mut pawn = NO_PAWNS_KEY;
        let mut material = 0;
        let mut non_pawn = [0; 2];

        self.state.bbs.visit_pieces(|sq, piece| {
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
        if self.side == Colour::Black {
            zobrist ^= SIDE_KEY;
        }

        self.state.keys.zobrist = zobrist;
        self.state.keys.pawn = pawn;
        self.state.keys.material = material;
        self.state.keys.non_pawn = non_pawn;
    }

    fn compute_non_pawn_material(&self) -> [i32; 2] {
        let mut npm = [0; 2];
        self.state.bbs.visit_pieces(|_, piece| {
            if piece.piece_type() != PieceType::Pawn {
                npm[piece.colour()] += PIECE_VALUES[piece.piece_type()];
            }
        });
        npm
    }

    /// Recomputes everything that depends on the whole position: threat
    /// sets, checkers, slider blockers, check squares, and the list of
    /// threatened pieces consumed by the NNUE threat features.
    fn update_derived_state(&mut self) {
        let bbs = self.state.bbs;
        self.state.threats = [bbs.attacks_by(Colour::White), bbs.attacks_by(Colour::Black)];

        let king_sq = bbs.king_sq(self.side);
        self.state.checkers =
            self.attackers_to(king_sq, bbs.occupied()) & bbs.colours[!self.side];

        for colour in Colour::all() {
            self.update_slider_blockers(colour);
        }

        // squares from which a piece of ours would give check
        let their_king = bbs.king_sq(!self.side);
        let occ = bbs.occupied();
        self.state.check_squares[PieceType::Pawn] =
            pawn_attacks_by(their_king.as_set(), !self.side);
        for pt in [
            PieceType::Knight,
            PieceType::Bishop,
            PieceType::Rook,
            PieceType::Queen,
        ] {
            self.state.check_squares[pt] = attacks_by_type(pt, their_king, occ);
        }
        self.state.check_squares[PieceType::King] = SquareSet::EMPTY;

        self.state.threatened.clear();
        let mut threatened_sqs = SquareSet::EMPTY;
        for colour in Colour::all() {
            let under_attack = bbs.colours[colour] & self.state.threats[!colour];
            threatened_sqs |= under_attack;
            for sq in under_attack {
                self.state.threatened.push(FeatureUpdate {
                    sq,
                    piece: self.state.mailbox[sq].unwrap(),
                });
            }
        }
        self.state.threatened_sqs = threatened_sqs;
    }

    /// Computes the pieces shielding the king of `c` from enemy sliders,
    /// and the sliders doing the pinning. A sniper whose ray to the king
    /// holds exactly one piece pins it; a pinner is recorded when the
    /// blocker belongs to `c`.
    fn update_slider_blockers(&mut self, c: Colour) {
        let bbs = &self.state.bbs;
        let king_sq = bbs.king_sq(c);
        let mut blockers = SquareSet::EMPTY;
        let mut pinners = SquareSet::EMPTY;

        let snipers = (rook_attacks(king_sq, SquareSet::EMPTY) & bbs.orth_sliders(!c))
            | (bishop_attacks(king_sq, SquareSet::EMPTY) & bbs.diag_sliders(!c));
        let occupancy = bbs.occupied() ^ snipers;

        for sniper in snipers {
            let between = RAY_BETWEEN[king_sq.index()][sniper.index()] & occupancy;
            if between != SquareSet::EMPTY && between.one() {
                blockers |= between;
                if between & bbs.colours[c] != SquareSet::EMPTY {
                    pinners |= sniper.as_set();
                }
            }
        }

        self.state.blockers_for_king[c] = blockers;
        self.state.pinners[c] = pinners;
    }

    // ------------------------------------------------------------------
    // legality

    /// Checks that a move is pseudo-legal in this position, which the
    /// transposition table needs before it can trust a stored move.
    pub fn is_pseudo_legal(&self, m: Move) -> bool {
        if m.is_castle() {
            return self.is_pseudo_legal_castling(m);
        }

        let from = m.from();
        let to = m.to();
        let Some(moved) = self.state.mailbox[from] else {
            return false;
        };
        if moved.colour() != self.side {
            return false;
        }
        let captured = self.state.mailbox[to];
        if captured.is_some_and(|p| p.colour() == self.side) {
            return false;
        }

        if moved.piece_type() == PieceType::Pawn {
            let should_promote =
                to.rank() == Rank::Eight.relative_to(self.side);
            if should_promote != m.is_promo() {
                return false;
            }
            if m.is_ep() {
                return Some(to) == self.state.ep_square
                    && pawn_attacks_by(to.as_set(), !self.side)
                        .contains_square(from);
            }
            if captured.is_none() {
                if Some(to) == from.pawn_push(self.side) {
                    return true;
                }
                // double push
                return from.rank() == Rank::Two.relative_to(self.side)
                    && from
                        .pawn_push(self.side)
                        .is_some_and(|mid| {
                            self.state.mailbox[mid].is_none()
                                && Some(to) == mid.pawn_push(self.side)
                        });
            }
            return pawn_attacks_by(to.as_set(), !self.side).contains_square(from);
        }

        if m.is_ep() || m.is_promo() {
            return false;
        }

        if moved.piece_type() == PieceType::King
            && self.state.threats[!self.side].contains_square(to)
        {
            return false;
        }

        // evasion sanity: with multiple checkers only the king may move
        if self.state.checkers.many() && moved.piece_type() != PieceType::King {
            return false;
        }

        attacks_by_type(moved.piece_type(), from, self.occupied()).contains_square(to)
    }

    fn is_pseudo_legal_castling(&self, m: Move) -> bool {
        let Some(moved) = self.state.mailbox[m.from()] else {
            return false;
        };
        if moved.piece_type() != PieceType::King
            || moved.colour() != self.side
            || self.in_check()
        {
            return false;
        }
        let home_rank = SquareSet::RANKS[Rank::One.relative_to(self.side) as usize];
        if !home_rank.contains_square(m.from()) || !home_rank.contains_square(m.to()) {
            return false;
        }
        let (king_dst, rook_dst) = if m.to() > m.from() {
            if self.state.castle_perm.kingside(self.side) != Some(m.to().file()) {
                return false;
            }
            (
                Square::G1.relative_to(self.side),
                Square::F1.relative_to(self.side),
            )
        } else {
            if self.state.castle_perm.queenside(self.side) != Some(m.to().file()) {
                return false;
            }
            (
                Square::C1.relative_to(self.side),
                Square::D1.relative_to(self.side),
            )
        };

        let king_path = RAY_BETWEEN[m.from().index()][king_dst.index()];
        let rook_path = RAY_BETWEEN[m.from().index()][m.to().index()];
        let castle_occ = self.occupied() ^ m.from().as_set() ^ m.to().as_set();

        castle_occ & (king_path | rook_path | king_dst.as_set() | rook_dst.as_set())
            == SquareSet::EMPTY
            && king_path & self.state.threats[!self.side] == SquareSet::EMPTY
    }

    /// Whether a pseudo-legal move leaves our king out of check.
    pub fn legal(&self, m: Move) -> bool {
        debug_assert!(self.is_pseudo_legal(m));

        let turn = self.side;
        let bbs = &self.state.bbs;
        let from = m.from();
        let to = m.to();
        let king = bbs.king_sq(turn);
        let them = bbs.colours[!turn];
        let their_queens = bbs.pieces[PieceType::Queen] & them;
        let their_bishops = bbs.pieces[PieceType::Bishop] & them;
        let their_rooks = bbs.pieces[PieceType::Rook] & them;

        if m.is_castle() {
            // the path was scanned at generation; the destination and, in
            // Chess960, a rook shielding the king still need checking.
            let king_to = m.history_to_square();
            return !(self.state.threats[!turn].contains_square(king_to)
                || CHESS960.load(Ordering::Relaxed)
                    && (self.state.blockers_for_king[turn] & bbs.colours[turn])
                        .contains_square(to));
        } else if m.is_ep() {
            // simulate the occupancy after both pawns leave
            let capture_sq = to.pawn_push(!turn).unwrap();
            let occ_after =
                self.occupied() ^ from.as_set() ^ to.as_set() ^ capture_sq.as_set();
            return bishop_attacks(king, occ_after) & (their_queens | their_bishops)
                == SquareSet::EMPTY
                && rook_attacks(king, occ_after) & (their_queens | their_rooks)
                    == SquareSet::EMPTY;
        }

        let moved = self.state.mailbox[from].unwrap();

        if moved.piece_type() == PieceType::King {
            // sliders keep attacking through the square the king vacated
            let without_king = self.occupied() ^ king.as_set();
            return bishop_attacks(to, without_king) & (their_queens | their_bishops)
                == SquareSet::EMPTY
                && rook_attacks(to, without_king) & (their_queens | their_rooks)
                    == SquareSet::EMPTY
                && self.attackers_to(to, without_king) & them
                    & !(their_queens | their_bishops | their_rooks)
                    == SquareSet::EMPTY;
        }

        if self.state.checkers.many() {
            return false;
        }

        if (self.state.blockers_for_king[turn] & bbs.colours[turn]).contains_square(from)
            && !RAY_FULL[from.index()][to.index()].contains_square(king)
        {
            return false;
        }

        if self.state.checkers == SquareSet::EMPTY {
            return true;
        }

        // a single checker must be captured or blocked
        let checker = self.state.checkers.first().unwrap();
        (RAY_BETWEEN[king.index()][checker.index()] | self.state.checkers).contains_square(to)
    }

    /// Whether this move gives check, decided without making it.
    pub fn gives_check(&self, m: Move) -> bool {
        let from = m.from();
        let to = m.to();
        let moved = self.state.mailbox[from].unwrap();
        let their_king = self.state.bbs.king_sq(!self.side);

        // direct check
        if moved.piece_type() != PieceType::King
            && !m.is_promo()
            && self.state.check_squares[moved.piece_type()].contains_square(to)
        {
            return true;
        }

        // discovered check: we move a blocker of their king off the ray
        if (self.state.blockers_for_king[!self.side] & self.state.bbs.colours[self.side])
            .contains_square(from)
            && !RAY_FULL[from.index()][to.index()].contains_square(their_king)
        {
            return true;
        }

        match m.kind() {
            MoveKind::Normal => false,
            MoveKind::Promotion => {
                let occ_after = self.occupied() ^ from.as_set();
                attacks_by_type(m.promotion_type().unwrap(), to, occ_after)
                    .contains_square(their_king)
            }
            MoveKind::EnPassant => {
                // the vanished pawn may open a slider onto the king
                let capture_sq = to.pawn_push(!self.side).unwrap();
                let occ_after =
                    (self.occupied() ^ from.as_set() ^ capture_sq.as_set()) | to.as_set();
                bishop_attacks(their_king, occ_after) & self.state.bbs.diag_sliders(self.side)
                    != SquareSet::EMPTY
                    || rook_attacks(their_king, occ_after) & self.state.bbs.orth_sliders(self.side)
                        != SquareSet::EMPTY
            }
            MoveKind::Castle => {
                let king_dst = m.history_to_square();
                let rook_dst = if to > from {
                    Square::F1.relative_to(self.side)
                } else {
                    Square::D1.relative_to(self.side)
                };
                let occ_after = (self.occupied() ^ from.as_set() ^ to.as_set())
                    | king_dst.as_set()
                    | rook_dst.as_set();
                rook_attacks(rook_dst, occ_after).contains_square(their_king)
            }
        }
    }

    // ------------------------------------------------------------------
    // making and unmaking moves

    /// Applies a legal move. The previous state is pushed onto the state
    /// stack, so `unmake_move` restores the position exactly.
    pub fn make_move(&mut self, m: Move) {
        #![allow(clippy::too_many_lines)]
        debug_assert!(self.is_pseudo_legal(m));
        debug_assert!(self.legal(m));
        #[cfg(debug_assertions)]
        self.check_validity();

        self.history.push(self.state.clone());

        let from = m.from();
        let mut to = m.to();
        let castle = m.is_castle();
        let side = self.side;
        let piece = self.state.mailbox[from].unwrap();
        let captured = if castle { None } else { self.state.mailbox[to] };
        let mut castling_perm = self.state.castle_perm;

        self.state.dirty.clear();
        self.state.captured = captured;

        if !castle {
            if m.is_promo() {
                // the pawn leaves; a different piece arrives below
                self.state.dirty.clear_piece(from, piece);
            } else {
                self.state.dirty.move_piece(from, to, piece);
            }
        }

        if m.is_ep() {
            let clear_at = to.pawn_push(!side).unwrap();
            let to_clear = Piece::new(!side, PieceType::Pawn);
            self.state.bbs.clear_piece_at(clear_at, to_clear);
            self.state.dirty.clear_piece(clear_at, to_clear);
            self.state.captured = Some(to_clear);
        } else if castle {
            // encoded king-takes-rook: move both pieces at once
            self.state.bbs.clear_piece_at(from, piece);
            let rook_from = to;
            let rook_to = if Some(to.file()) == castling_perm.kingside(side) {
                to = Square::G1.relative_to(side);
                Square::F1.relative_to(side)
            } else {
                to = Square::C1.relative_to(side);
                Square::D1.relative_to(side)
            };
            if from != to {
                self.state.dirty.move_piece(from, to, piece);
            }
            if rook_from != rook_to {
                let rook = Piece::new(side, PieceType::Rook);
                self.state.bbs.move_piece(rook_from, rook_to, rook);
                self.state.dirty.move_piece(rook_from, rook_to, rook);
            }
        }

        self.state.rule50 = self.state.rule50.saturating_add(1);
        self.state.plies_from_null += 1;

        if let Some(captured) = captured {
            self.state.rule50 = 0;
            self.state.bbs.clear_piece_at(to, captured);
            self.state.dirty.clear_piece(to, captured);
        }

        // retire the old en-passant file from the key, then maybe set a
        // new one if this was a double push next to an enemy pawn
        if let Some(ep_sq) = self.state.ep_square {
            self.state.keys.zobrist ^= EP_KEYS[ep_sq.file()];
        }
        self.state.ep_square = None;
        if piece.piece_type() == PieceType::Pawn {
            self.state.rule50 = 0;
            let is_double_push = from.rank().abs_diff(to.rank()) == 2;
            if is_double_push
                && (to.as_set().west_one() | to.as_set().east_one())
                    & self.state.bbs.pawns(!side)
                    != SquareSet::EMPTY
            {
                self.state.ep_square = from.pawn_push(side);
                debug_assert!(
                    self.state.ep_square.unwrap().rank() == Rank::Three.relative_to(side)
                );
            }
        }
        if let Some(ep_sq) = self.state.ep_square {
            self.state.keys.zobrist ^= EP_KEYS[ep_sq.file()];
        }

        if let Some(promo) = m.promotion_type() {
            let promo = Piece::new(side, promo);
            self.state.bbs.clear_piece_at(from, piece);
            self.state.bbs.set_piece_at(to, promo);
            self.state.dirty.add_piece(to, promo);
        } else if castle {
            self.state.bbs.set_piece_at(to, piece);
        } else {
            self.state.bbs.move_piece(from, to, piece);
        }

        self.side = !self.side;

        // castling rights: hash out, amend, hash back in
        self.state.keys.zobrist ^= CASTLE_KEYS[castling_perm.hashkey_index()];
        if piece == Piece::WR && from.rank() == Rank::One {
            castling_perm.remove::<White>(from.file());
        } else if piece == Piece::BR && from.rank() == Rank::Eight {
            castling_perm.remove::<Black>(from.file());
        } else if piece == Piece::WK {
            castling_perm.clear::<White>();
        } else if piece == Piece::BK {
            castling_perm.clear::<Black>();
        }
        if m.to().rank() == Rank::One {
            castling_perm.remove::<White>(m.to().file());
        } else if m.to().rank() == Rank::Eight {
            castling_perm.remove::<Black>(m.to().file());
        }
        self.state.keys.zobrist ^= CASTLE_KEYS[castling_perm.hashkey_index()];
        self.state.castle_perm = castling_perm;

        // apply the square changes to every incremental key
        self.state.keys.zobrist ^= SIDE_KEY;
        let dirty = self.state.dirty.clone();
        for &FeatureUpdate { sq, .. } in &dirty.subs {
            self.state.mailbox[sq] = None;
        }
        for &FeatureUpdate { sq, piece } in &dirty.adds {
            self.state.mailbox[sq] = Some(piece);
        }
        // pure arrivals/departures (captures, promotions) change the
        // material key and counts; piece slides don't
        for &FeatureUpdate { sq, piece } in &dirty.subs {
            let key = PIECE_KEYS[piece][sq];
            self.state.keys.zobrist ^= key;
            if piece.piece_type() == PieceType::Pawn {
                self.state.keys.pawn ^= key;
            } else {
                self.state.keys.non_pawn[piece.colour()] ^= key;
            }
            if !dirty.adds.iter().any(|a| a.piece == piece) {
                self.state.piece_count[piece] -= 1;
                self.state.keys.material ^=
                    PIECE_KEYS[piece][self.state.piece_count[piece] as usize];
                if piece.piece_type() != PieceType::Pawn {
                    self.state.non_pawn_material[piece.colour()] -=
                        PIECE_VALUES[piece.piece_type()];
                }
            }
        }
        for &FeatureUpdate { sq, piece } in &dirty.adds {
            let key = PIECE_KEYS[piece][sq];
            self.state.keys.zobrist ^= key;
            if piece.piece_type() == PieceType::Pawn {
                self.state.keys.pawn ^= key;
            } else {
                self.state.keys.non_pawn[piece.colour()] ^= key;
            }
            if !dirty.subs.iter().any(|s| s.piece == piece) {
                self.state.keys.material ^=
                    PIECE_KEYS[piece][self.state.piece_count[piece] as usize];
                self.state.piece_count[piece] += 1;
                if piece.piece_type() != PieceType::Pawn {
                    self.state.non_pawn_material[piece.colour()] +=
                        PIECE_VALUES[piece.piece_type()];
                }
            }
        }

        self.ply += 1;
        self.height += 1;

        self.update_derived_state();
        self.update_repetition();

        #[cfg(debug_assertions)]
        self.check_validity();
    }

    /// Walks back through the state stack looking for an earlier state
    /// with the same key. `repetition` becomes the ply distance to the
    /// first match, negated when that state itself already repeats.
    fn update_repetition(&mut self) {
        self.state.repetition = 0;
        let end = usize::min(
            self.state.rule50 as usize,
            self.state.plies_from_null as usize,
        );
        if end >= 4 {
            let len = self.history.len();
            let mut i = 4;
            while i <= end && i <= len {
                let prev = &self.history[len - i];
                if prev.keys.zobrist == self.state.keys.zobrist {
                    self.state.repetition = if prev.repetition != 0 {
                        -(i as i32)
                    } else {
                        i as i32
                    };
                    break;
                }
                i += 2;
            }
        }
    }

    pub fn unmake_move(&mut self) {
        self.height -= 1;
        self.ply -= 1;
        self.side = !self.side;
        self.state = self.history.pop().expect("no move to unmake");
    }

    pub fn make_nullmove(&mut self) {
        debug_assert!(!self.in_check());
        #[cfg(debug_assertions)]
        self.check_validity();

        self.history.push(self.state.clone());

        if let Some(ep_sq) = self.state.ep_square {
            self.state.keys.zobrist ^= EP_KEYS[ep_sq.file()];
        }
        self.state.keys.zobrist ^= SIDE_KEY;
        self.state.ep_square = None;
        self.state.rule50 = self.state.rule50.saturating_add(1);
        self.state.plies_from_null = 0;
        self.state.repetition = 0;
        self.state.captured = None;
        self.state.dirty.clear();
        self.side = !self.side;
        self.ply += 1;
        self.height += 1;

        self.update_derived_state();
    }

    pub fn unmake_nullmove(&mut self) {
        self.height -= 1;
        self.ply -= 1;
        self.side = !self.side;
        self.state = self.history.pop().expect("no null move to unmake");
    }

    // ------------------------------------------------------------------
    // draws and repetitions

    /// Draw detection at a node `ply` from the root: the fifty-move rule
    /// (unless the side to move is mated), a repetition since the root,
    /// or a position that repeated twice before the root.
    pub fn is_draw(&self, ply: usize) -> bool {
        #![allow(clippy::cast_possible_wrap)]
        if self.state.rule50 > 99 && (!self.in_check() || self.has_legal_moves()) {
            return true;
        }
        // strict <: a repetition exactly at the root is not yet a draw.
        // a negative repetition (seen twice before) always qualifies.
        self.state.repetition != 0 && self.state.repetition < ply as i32
    }

    /// Whether the side to move can force a repetition of an earlier
    /// position via a reversible move, detected with the cuckoo tables.
    pub fn has_game_cycle(&self, ply: usize) -> bool {
        let end = usize::min(
            self.state.rule50 as usize,
            self.state.plies_from_null as usize,
        );
        if end < 3 {
            return false;
        }

        let len = self.history.len();
        let old_key = |i: usize| self.history[len - i].keys.zobrist;
        let occ = self.occupied();
        let original_key = self.state.keys.zobrist;

        let mut i = 3;
        while i <= end && i <= len {
            let diff = original_key ^ old_key(i);

            let mut slot = cuckoo::h1(diff);
            if diff != cuckoo::keys()[slot] {
                slot = cuckoo::h2(diff);
            }
            if diff == cuckoo::keys()[slot] {
                let mv = cuckoo::moves()[slot].unwrap();
                if occ & RAY_BETWEEN[mv.from().index()][mv.to().index()] == SquareSet::EMPTY {
                    if ply > i {
                        return true;
                    }
                    // the repetition crosses the root: only claim it when
                    // the shuffling piece belongs to the side to move
                    let piece = self
                        .state
                        .mailbox[mv.from()]
                        .or(self.state.mailbox[mv.to()])
                        .unwrap();
                    return piece.colour() == self.side;
                }
            }
            i += 2;
        }

        false
    }

    pub fn has_non_pawn_material(&self) -> bool {
        self.state.non_pawn_material[self.side] > 0
    }

    pub fn is_insufficient_material(&self) -> bool {
        let bbs = &self.state.bbs;
        if bbs.pieces[PieceType::Pawn]
            | bbs.pieces[PieceType::Rook]
            | bbs.pieces[PieceType::Queen]
            != SquareSet::EMPTY
        {
            return false;
        }
        let minors = bbs.pieces[PieceType::Knight] | bbs.pieces[PieceType::Bishop];
        if minors.count() > 1 {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // keys and captures

    /// An estimate of the key after `m`, good enough to prefetch the
    /// right TT cluster. Exact for everything but castling.
    pub fn key_after(&self, m: Move) -> u64 {
        let from = m.from();
        let to = m.to();
        let piece = self.state.mailbox[from].unwrap();
        let captured = self.state.mailbox[to];
        let dst_piece = m
            .promotion_type()
            .map_or(piece, |promo| Piece::new(piece.colour(), promo));

        let mut key = self.state.keys.zobrist ^ SIDE_KEY;
        key ^= PIECE_KEYS[piece][from];
        key ^= PIECE_KEYS[dst_piece][to];
        if let Some(captured) = captured {
            key ^= PIECE_KEYS[captured][to];
        }
        if let Some(ep_sq) = self.state.ep_square {
            key ^= EP_KEYS[ep_sq.file()];
        }
        key
    }

    pub fn key_after_nullmove(&self) -> u64 {
        let mut key = self.state.keys.zobrist ^ SIDE_KEY;
        if let Some(ep_sq) = self.state.ep_square {
            key ^= EP_KEYS[ep_sq.file()];
        }
        key
    }

    pub fn captured_piece(&self, m: Move) -> Option<Piece> {
        if m.is_castle() {
            return None;
        }
        self.state.mailbox[m.to()]
    }

    pub fn is_capture(&self, m: Move) -> bool {
        self.captured_piece(m).is_some()
    }

    pub fn is_tactical(&self, m: Move) -> bool {
        m.is_promo() || m.is_ep() || self.is_capture(m)
    }

    // ------------------------------------------------------------------
    // UCI move parsing

    /// Parses a long-algebraic move string against this position.
    pub fn parse_uci(&self, uci: &str) -> Result<Move, MoveParseError> {
        use MoveParseError::{
            IllegalMove, InvalidFromSquareFile, InvalidFromSquareRank, InvalidLength,
            InvalidPromotionPiece, InvalidToSquareFile, InvalidToSquareRank,
        };
        let bytes = uci.as_bytes();
        if !(4..=5).contains(&bytes.len()) {
            return Err(InvalidLength(bytes.len()));
        }
        if !(b'a'..=b'h').contains(&bytes[0]) {
            return Err(InvalidFromSquareFile(bytes[0] as char));
        }
        if !(b'1'..=b'8').contains(&bytes[1]) {
            return Err(InvalidFromSquareRank(bytes[1] as char));
        }
        if !(b'a'..=b'h').contains(&bytes[2]) {
            return Err(InvalidToSquareFile(bytes[2] as char));
        }
        if !(b'1'..=b'8').contains(&bytes[3]) {
            return Err(InvalidToSquareRank(bytes[3] as char));
        }
        if bytes.len() == 5 && ![b'n', b'b', b'r', b'q'].contains(&bytes[4]) {
            return Err(InvalidPromotionPiece(bytes[4] as char));
        }

        let chess960 = CHESS960.load(Ordering::Relaxed);

        self.legal_moves()
            .into_iter()
            .find(|&m| m.display(chess960).to_string() == uci)
            .ok_or_else(|| IllegalMove(uci.to_string()))
    }

}

impl Default for Board {
    fn default() -> Self {
        let mut out = Self::empty();
        out.set_startpos();
        out
    }
}

impl Display for Board {
    /// Renders the position as a FEN string, the inverse of `set_from_fen`
    /// up to castling-notation normalisation.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let chess960 = CHESS960.load(Ordering::Relaxed);
        let mut counter = 0;
        for rank in Rank::all().rev() {
            for file in File::all() {
                let sq = Square::from_rank_file(rank, file);
                if let Some(piece) = self.state.mailbox[sq] {
                    if counter != 0 {
                        write!(f, "{counter}")?;
                    }
                    counter = 0;
                    write!(f, "{piece}")?;
                } else {
                    counter += 1;
                }
            }
            if counter != 0 {
                write!(f, "{counter}")?;
            }
            counter = 0;
            if rank != Rank::One {
                write!(f, "/")?;
            }
        }

        match self.side {
            Colour::White => write!(f, " w ")?,
            Colour::Black => write!(f, " b ")?,
        }

        if self.state.castle_perm == CastlingRights::default() {
            write!(f, "-")?;
        } else {
            for (right, colour, standard) in [
                (self.state.castle_perm.kingside(Colour::White), Colour::White, 'K'),
                (self.state.castle_perm.queenside(Colour::White), Colour::White, 'Q'),
                (self.state.castle_perm.kingside(Colour::Black), Colour::Black, 'k'),
                (self.state.castle_perm.queenside(Colour::Black), Colour::Black, 'q'),
            ] {
                if let Some(file) = right {
                    if chess960 {
                        let c = (b'A' + file as u8) as char;
                        let c = if colour == Colour::White {
                            c
                        } else {
                            c.to_ascii_lowercase()
                        };
                        write!(f, "{c}")?;
                    } else {
                        write!(f, "{standard}")?;
                    }
                }
            }
        }

        if let Some(ep_sq) = self.state.ep_square {
            write!(f, " {ep_sq}")?;
        } else {
            write!(f, " -")?;
        }
        write!(f, " {}", self.state.rule50)?;
        write!(f, " {}", self.ply / 2 + 1)
    }
}

impl Debug for Board {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("fen", &self.to_string())
            .field("key", &self.state.keys.zobrist)
            .field("height", &self.height)
            .field("checkers", &self.state.checkers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fen_roundtrip() {
        for fen in [
            Board::STARTING_FEN,
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
            "r1bqkbnr/pppp1p1p/2n5/4pPp1/4P3/8/PPPP2PP/RNBQKBNR w KQkq g6 0 4",
            "n1n5/PPPk4/8/8/8/8/4Kppp/5N1N b - - 0 1",
        ] {
            let board = Board::from_fen(fen).expect("from_fen failed");
            assert_eq!(board.to_string(), fen);
        }
    }

    #[test]
    fn make_unmake_roundtrip() {
        let mut board = Board::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();
        let reference = board.clone();
        for m in board.legal_moves() {
            board.make_move(m);
            board.unmake_move();
            assert_eq!(board, reference, "{m:?} did not round-trip");
        }
    }

    #[test]
    fn incremental_keys_match_regeneration() {
        let mut board = Board::default();
        for uci in ["e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "g8f6", "e1g1", "f6e4"] {
            let m = board.parse_uci(uci).unwrap();
            board.make_move(m);
            let incremental = board.state.keys.clone();
            board.regenerate_keys();
            assert_eq!(incremental, board.state.keys, "diverged after {uci}");
        }
    }

    #[test]
    fn ep_square_only_kept_when_capturable() {
        let illegal =
            Board::from_fen("rnbq1bnr/p1ppkppp/8/4p3/1pP5/BP3PP1/P2PP2P/RN1QKBNR b KQ c3 0 5")
                .unwrap();
        assert!(illegal.ep_sq().is_none());

        let legal =
            Board::from_fen("r1bqkbnr/pppp1p1p/2n5/4pPp1/4P3/8/PPPP2PP/RNBQKBNR w KQkq g6 0 4")
                .unwrap();
        assert_eq!(legal.ep_sq(), Some(Square::G6));
    }

    #[test]
    fn pinned_ep_capture_is_illegal() {
        // the capturing pawn is pinned along the rank through both pawns
        let board = Board::from_fen("8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 b - - 0 1").unwrap();
        let mut with_ep = board.clone();
        let m = with_ep.parse_uci("c7c5").unwrap();
        with_ep.make_move(m);
        assert_eq!(with_ep.ep_sq(), Some(Square::C6));
        let ep_capture = Move::new_with_kind(Square::B5, Square::C6, MoveKind::EnPassant);
        assert!(with_ep.is_pseudo_legal(ep_capture));
        assert!(with_ep.legal(ep_capture));

        // same shape, but the horizontal pin now bites
        let board = Board::from_fen("8/8/8/8/k2Pp2Q/8/8/K7 b - d3 0 1").unwrap();
        let ep_capture = Move::new_with_kind(Square::E4, Square::D3, MoveKind::EnPassant);
        if board.is_pseudo_legal(ep_capture) {
            assert!(!board.legal(ep_capture));
        }
    }

    #[test]
    fn repetition_shuffle_is_a_draw_at_ply_eight() {
        let mut board = Board::default();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"] {
            assert!(!board.is_draw(board.height()));
            let m = board.parse_uci(uci).unwrap();
            board.make_move(m);
        }
        assert!(board.is_draw(8));
    }

    #[test]
    fn rule50_boundary() {
        let almost =
            Board::from_fen("rnbqkb1r/pppppppp/5n2/8/3N4/8/PPPPPPPP/RNBQKB1R b KQkq - 99 2")
                .unwrap();
        assert!(!almost.is_draw(1));
        let there =
            Board::from_fen("rnbqkb1r/pppppppp/5n2/8/3N4/8/PPPPPPPP/RNBQKB1R b KQkq - 100 2")
                .unwrap();
        assert!(there.is_draw(1));
    }

    #[test]
    fn castling_moves_both_pieces() {
        let mut board =
            Board::from_fen("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1").unwrap();
        let m = board.parse_uci("e1g1").unwrap();
        assert!(m.is_castle());
        board.make_move(m);
        assert_eq!(board.piece_at(Square::G1), Some(Piece::WK));
        assert_eq!(board.piece_at(Square::F1), Some(Piece::WR));
        assert_eq!(board.piece_at(Square::E1), None);
        assert_eq!(board.piece_at(Square::H1), None);
    }

    #[test]
    fn promotion_under_pin_is_rejected() {
        // the e2 pawn shields its king from the a2 rook along the rank;
        // promoting steps off the ray and is pseudo-legal but not legal
        let board = Board::from_fen("8/8/8/8/8/8/R3p2k/2K5 b - - 0 1").unwrap();
        let pinned_promo = Move::new_promotion(Square::E2, Square::E1, PieceType::Queen);
        assert!(board.is_pseudo_legal(pinned_promo));
        assert!(!board.legal(pinned_promo));

        // without the pin the same promotion is fine
        let board = Board::from_fen("8/8/8/8/8/8/4p2k/2K5 b - - 0 1").unwrap();
        let free_promo = Move::new_promotion(Square::E2, Square::E1, PieceType::Queen);
        assert!(board.is_pseudo_legal(free_promo));
        assert!(board.legal(free_promo));
    }

    #[test]
    fn scharnagl_518_is_the_standard_arrangement() {
        let mut board = Board::empty();
        board.set_frc_idx(518);
        let standard = Board::default();
        assert_eq!(board, standard);

        let mut dfrc = Board::empty();
        dfrc.set_dfrc_idx(518 * 960 + 518);
        assert_eq!(dfrc, standard);
    }

    #[test]
    fn gives_check_agrees_with_make() {
        let board = Board::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();
        for m in board.legal_moves() {
            let mut clone = board.clone();
            clone.make_move(m);
            assert_eq!(
                board.gives_check(m),
                clone.in_check(),
                "gives_check disagreed on {m:?}",
            );
        }
    }
}
