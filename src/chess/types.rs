use std::{
    fmt::{self, Display},
    mem::size_of,
    ops::{Index, IndexMut},
    str::FromStr,
};

use arrayvec::ArrayVec;

use crate::chess::{
    piece::{Col, Colour, Piece},
    piecelayout::PieceLayout,
    squareset::SquareSet,
};

#[derive(PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum File {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

const _FILE_ASSERT: () = assert!(size_of::<File>() == size_of::<Option<File>>());

impl File {
    pub const fn from_index(index: u8) -> Option<Self> {
        if index < 8 {
            // SAFETY: inner is less than 8, so it corresponds to a valid enum variant.
            Some(unsafe { std::mem::transmute::<u8, Self>(index) })
        } else {
            None
        }
    }

    pub const fn abs_diff(self, other: Self) -> u8 {
        (self as u8).abs_diff(other as u8)
    }

    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        // SAFETY: all values are within `0..8`.
        (0..8u8).map(|i| unsafe { std::mem::transmute(i) })
    }
}

#[derive(PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash, Debug)]
#[repr(u8)]
pub enum Rank {
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
}

const _RANK_ASSERT: () = assert!(size_of::<Rank>() == size_of::<Option<Rank>>());

impl Rank {
    pub const fn from_index(index: u8) -> Option<Self> {
        if index < 8 {
            // SAFETY: inner is less than 8, so it corresponds to a valid enum variant.
            Some(unsafe { std::mem::transmute::<u8, Self>(index) })
        } else {
            None
        }
    }

    pub const fn abs_diff(self, other: Self) -> u8 {
        (self as u8).abs_diff(other as u8)
    }

    pub const fn relative_to(self, side: Colour) -> Self {
        match side {
            Colour::White => self,
            // SAFETY: `7 - self` stays within `0..8`.
            Colour::Black => unsafe { std::mem::transmute(7 - self as u8) },
        }
    }

    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        // SAFETY: all values are within `0..8`.
        (0..8u8).map(|i| unsafe { std::mem::transmute(i) })
    }
}

#[rustfmt::skip]
#[derive(PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(u8)]
pub enum Square {
    #[default]
    A1, B1, C1, D1, E1, F1, G1, H1,
    A2, B2, C2, D2, E2, F2, G2, H2,
    A3, B3, C3, D3, E3, F3, G3, H3,
    A4, B4, C4, D4, E4, F4, G4, H4,
    A5, B5, C5, D5, E5, F5, G5, H5,
    A6, B6, C6, D6, E6, F6, G6, H6,
    A7, B7, C7, D7, E7, F7, G7, H7,
    A8, B8, C8, D8, E8, F8, G8, H8,
}

const _SQUARE_ASSERT: () = assert!(size_of::<Square>() == size_of::<Option<Square>>());

static SQUARE_NAMES: [&str; 64] = [
    "a1", "b1", "c1", "d1", "e1", "f1", "g1", "h1", "a2", "b2", "c2", "d2", "e2", "f2", "g2", "h2",
    "a3", "b3", "c3", "d3", "e3", "f3", "g3", "h3", "a4", "b4", "c4", "d4", "e4", "f4", "g4", "h4",
    "a5", "b5", "c5", "d5", "e5", "f5", "g5", "h5", "a6", "b6", "c6", "d6", "e6", "f6", "g6", "h6",
    "a7", "b7", "c7", "d7", "e7", "f7", "g7", "h7", "a8", "b8", "c8", "d8", "e8", "f8", "g8", "h8",
];

#[allow(clippy::unusual_byte_groupings)]
impl Square {
    pub const fn new(inner: u8) -> Option<Self> {
        if inner < 64 {
            // SAFETY: inner is less than 64, so it corresponds to a valid enum variant.
            Some(unsafe { std::mem::transmute::<u8, Self>(inner) })
        } else {
            None
        }
    }

    /// SAFETY: you may only call this function with a value of `inner` less than 64.
    pub const unsafe fn new_unchecked(inner: u8) -> Self {
        debug_assert!(inner < 64);
        std::mem::transmute(inner)
    }

    pub const fn new_clamped(inner: u8) -> Self {
        let inner = min!(inner, 63);
        match Self::new(inner) {
            Some(sq) => sq,
            None => panic!(),
        }
    }

    pub const fn from_rank_file(rank: Rank, file: File) -> Self {
        let inner = rank as u8 * 8 + file as u8;
        // SAFETY: Rank and File are constrained such that inner is always < 64.
        unsafe { std::mem::transmute(inner) }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn inner(self) -> u8 {
        self as u8
    }

    pub const fn signed_inner(self) -> i8 {
        #![allow(clippy::cast_possible_wrap)]
        self as i8
    }

    /// The file that this square is on.
    pub const fn file(self) -> File {
        // SAFETY: `self % 8` is less than 8.
        unsafe { std::mem::transmute(self as u8 % 8) }
    }

    /// The rank that this square is on.
    pub const fn rank(self) -> Rank {
        // SAFETY: `self / 8` is less than 8.
        unsafe { std::mem::transmute(self as u8 / 8) }
    }

    pub const fn flip_rank(self) -> Self {
        // SAFETY: xor with 0b111000 cannot construct a value >= 64.
        unsafe { std::mem::transmute(self as u8 ^ 0b111_000) }
    }

    pub const fn flip_file(self) -> Self {
        // SAFETY: xor with 0b000111 cannot construct a value >= 64.
        unsafe { std::mem::transmute(self as u8 ^ 0b000_111) }
    }

    pub const fn relative_to(self, side: Colour) -> Self {
        match side {
            Colour::White => self,
            Colour::Black => self.flip_rank(),
        }
    }

    pub const fn distance(a: Self, b: Self) -> u8 {
        max!(a.file().abs_diff(b.file()), a.rank().abs_diff(b.rank()))
    }

    pub const fn add(self, offset: u8) -> Option<Self> {
        Self::new(self as u8 + offset)
    }

    pub const fn sub(self, offset: u8) -> Option<Self> {
        if self as u8 >= offset {
            Self::new(self as u8 - offset)
        } else {
            None
        }
    }

    pub const fn as_set(self) -> SquareSet {
        SquareSet::from_square(self)
    }

    pub fn pawn_push(self, side: Colour) -> Option<Self> {
        match side {
            Colour::White => self.add(8),
            Colour::Black => self.sub(8),
        }
    }

    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        // SAFETY: all values are within `0..64`.
        (0..64u8).map(|i| unsafe { std::mem::transmute(i) })
    }

    pub fn name(self) -> &'static str {
        SQUARE_NAMES[self]
    }
}

impl Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SQUARE_NAMES[*self])
    }
}

impl FromStr for Square {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SQUARE_NAMES
            .iter()
            .position(|&name| name == s)
            .and_then(|index| -> Option<u8> { index.try_into().ok() })
            .and_then(Self::new)
            .ok_or("invalid square name")
    }
}

impl From<Square> for u16 {
    fn from(square: Square) -> Self {
        square as Self
    }
}

impl<T> Index<Square> for [T; 64] {
    type Output = T;

    fn index(&self, index: Square) -> &Self::Output {
        // SAFETY: the legal values for this type are all in bounds.
        unsafe { self.get_unchecked(index as usize) }
    }
}

impl<T> IndexMut<Square> for [T; 64] {
    fn index_mut(&mut self, index: Square) -> &mut Self::Output {
        // SAFETY: the legal values for this type are all in bounds.
        unsafe { self.get_unchecked_mut(index as usize) }
    }
}

impl<T> Index<File> for [T; 8] {
    type Output = T;

    fn index(&self, index: File) -> &Self::Output {
        // SAFETY: the legal values for this type are all in bounds.
        unsafe { self.get_unchecked(index as usize) }
    }
}

impl<T> IndexMut<File> for [T; 8] {
    fn index_mut(&mut self, index: File) -> &mut Self::Output {
        // SAFETY: the legal values for this type are all in bounds.
        unsafe { self.get_unchecked_mut(index as usize) }
    }
}

impl<T> Index<Rank> for [T; 8] {
    type Output = T;

    fn index(&self, index: Rank) -> &Self::Output {
        // SAFETY: the legal values for this type are all in bounds.
        unsafe { self.get_unchecked(index as usize) }
    }
}

/// Castling rights, packed into sixteen bits.
///
/// Each of the four rights stores the file of the corresponding rook
/// (three bits), so Shredder-FEN castling works without special cases.
/// The low four bits are presence flags and double as the Zobrist index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CastlingRights {
    // [ 3 | wk ][ 3 | wq ][ 3 | bk ][ 3 | bq ][ 4 | flags ]
    data: u16,
}

#[allow(clippy::unusual_byte_groupings)]
impl CastlingRights {
    pub const WKCA: u16 = 0b0001;
    pub const WQCA: u16 = 0b0010;
    pub const BKCA: u16 = 0b0100;
    pub const BQCA: u16 = 0b1000;
    const WK_MASK: u16 = 0b111_000_000_000_0000;
    const WQ_MASK: u16 = 0b000_111_000_000_0000;
    const BK_MASK: u16 = 0b000_000_111_000_0000;
    const BQ_MASK: u16 = 0b000_000_000_111_0000;
    const WK_SHIFT: u8 = 4 + 3 + 3 + 3;
    const WQ_SHIFT: u8 = 4 + 3 + 3;
    const BK_SHIFT: u8 = 4 + 3;
    const BQ_SHIFT: u8 = 4;
    const KEY_MASK: u16 = 0b1111;

    pub const fn new(
        wk: Option<File>,
        wq: Option<File>,
        bk: Option<File>,
        bq: Option<File>,
    ) -> Self {
        let mut data = 0;

        if let Some(wk) = wk {
            data |= ((wk as u16) << Self::WK_SHIFT) | Self::WKCA;
        }
        if let Some(wq) = wq {
            data |= ((wq as u16) << Self::WQ_SHIFT) | Self::WQCA;
        }
        if let Some(bk) = bk {
            data |= ((bk as u16) << Self::BK_SHIFT) | Self::BKCA;
        }
        if let Some(bq) = bq {
            data |= ((bq as u16) << Self::BQ_SHIFT) | Self::BQCA;
        }

        Self { data }
    }

    pub const fn hashkey_index(self) -> usize {
        (self.data & Self::KEY_MASK) as usize
    }

    pub fn kingside(self, side: Colour) -> Option<File> {
        #![allow(clippy::cast_possible_truncation)]
        let presence = [Self::WKCA, Self::BKCA][side];
        if self.data & presence == 0 {
            return None;
        }
        let shift = [Self::WK_SHIFT, Self::BK_SHIFT][side];
        let mask = [Self::WK_MASK, Self::BK_MASK][side];
        File::from_index(((self.data & mask) >> shift) as u8)
    }

    pub fn queenside(self, side: Colour) -> Option<File> {
        #![allow(clippy::cast_possible_truncation)]
        let presence = [Self::WQCA, Self::BQCA][side];
        if self.data & presence == 0 {
            return None;
        }
        let shift = [Self::WQ_SHIFT, Self::BQ_SHIFT][side];
        let mask = [Self::WQ_MASK, Self::BQ_MASK][side];
        File::from_index(((self.data & mask) >> shift) as u8)
    }

    pub fn set_kingside(&mut self, side: Colour, file: File) {
        let presence = [Self::WKCA, Self::BKCA][side];
        let shift = [Self::WK_SHIFT, Self::BK_SHIFT][side];
        let mask = [!Self::WK_MASK, !Self::BK_MASK][side];
        self.data &= mask;
        self.data |= ((file as u16) << shift) | presence;
    }

    pub fn set_queenside(&mut self, side: Colour, file: File) {
        let presence = [Self::WQCA, Self::BQCA][side];
        let shift = [Self::WQ_SHIFT, Self::BQ_SHIFT][side];
        let mask = [!Self::WQ_MASK, !Self::BQ_MASK][side];
        self.data &= mask;
        self.data |= ((file as u16) << shift) | presence;
    }

    pub fn clear<C: Col>(&mut self) {
        self.data &= if C::WHITE {
            !(Self::WK_MASK | Self::WQ_MASK | Self::WKCA | Self::WQCA)
        } else {
            !(Self::BK_MASK | Self::BQ_MASK | Self::BKCA | Self::BQCA)
        };
    }

    pub fn clear_side<const IS_KINGSIDE: bool, C: Col>(&mut self) {
        #![allow(clippy::collapsible_else_if)]
        self.data &= !if C::WHITE {
            if IS_KINGSIDE {
                Self::WK_MASK | Self::WKCA
            } else {
                Self::WQ_MASK | Self::WQCA
            }
        } else {
            if IS_KINGSIDE {
                Self::BK_MASK | Self::BKCA
            } else {
                Self::BQ_MASK | Self::BQCA
            }
        };
    }

    pub fn remove<C: Col>(&mut self, file: File) {
        if self.kingside(C::COLOUR) == Some(file) {
            self.clear_side::<true, C>();
        } else if self.queenside(C::COLOUR) == Some(file) {
            self.clear_side::<false, C>();
        }
    }
}

/// Zobrist keys for a position.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Keys {
    /// The Zobrist hash of the board.
    pub zobrist: u64,
    /// The Zobrist hash of the pawns on the board.
    pub pawn: u64,
    /// The Zobrist hash of the material configuration.
    pub material: u64,
    /// The Zobrist hash of the non-pawns on the board, split by side.
    pub non_pawn: [u64; 2],
}

/// A single square change, as the NNUE feature sets see it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeatureUpdate {
    pub sq: Square,
    pub piece: Piece,
}

impl Display for FeatureUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{piece} on {sq}", piece = self.piece, sq = self.sq)
    }
}

/// The net square changes of one move: at most two pieces arrive
/// (castling) and at most two leave (castling, capture). This record is
/// the only channel between the board and the NNUE accumulators.
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct DirtyPiece {
    pub adds: ArrayVec<FeatureUpdate, 2>,
    pub subs: ArrayVec<FeatureUpdate, 2>,
}

impl DirtyPiece {
    pub fn move_piece(&mut self, from: Square, to: Square, piece: Piece) {
        self.adds.push(FeatureUpdate { sq: to, piece });
        self.subs.push(FeatureUpdate { sq: from, piece });
    }

    pub fn add_piece(&mut self, sq: Square, piece: Piece) {
        self.adds.push(FeatureUpdate { sq, piece });
    }

    pub fn clear_piece(&mut self, sq: Square, piece: Piece) {
        self.subs.push(FeatureUpdate { sq, piece });
    }

    pub fn clear(&mut self) {
        self.adds.clear();
        self.subs.clear();
    }
}

/// Upper bound on pieces standing on attacked squares.
pub const MAX_THREATENED: usize = 32;

/// Pieces standing on squares their opponents attack, recorded per ply
/// for the threat feature set.
pub type ThreatList = ArrayVec<FeatureUpdate, MAX_THREATENED>;

/// Full state for one ply of a chess position.
///
/// Stacked in an append-only `Vec` on the board; the previous state is
/// simply the element one index down, so unmaking a move is a pop and
/// restores every field exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    // fields carried forward from the previous ply and then amended
    pub castle_perm: CastlingRights,
    pub ep_square: Option<Square>,
    pub rule50: u8,
    pub plies_from_null: u16,
    pub keys: Keys,
    pub non_pawn_material: [i32; 2],
    pub bbs: PieceLayout,
    pub mailbox: [Option<Piece>; 64],
    pub piece_count: [u8; 12],
    // fields recomputed from scratch after the move is applied
    pub checkers: SquareSet,
    pub blockers_for_king: [SquareSet; 2],
    pub pinners: [SquareSet; 2],
    pub check_squares: [SquareSet; 6],
    pub threats: [SquareSet; 2],
    pub captured: Option<Piece>,
    pub repetition: i32,
    pub dirty: DirtyPiece,
    pub threatened: ThreatList,
    pub threatened_sqs: SquareSet,
}

impl Default for State {
    fn default() -> Self {
        Self {
            castle_perm: CastlingRights::default(),
            ep_square: None,
            rule50: 0,
            plies_from_null: 0,
            keys: Keys::default(),
            non_pawn_material: [0; 2],
            bbs: PieceLayout::default(),
            // curse thee array autoimpls
            mailbox: [None; 64],
            piece_count: [0; 12],
            checkers: SquareSet::EMPTY,
            blockers_for_king: [SquareSet::EMPTY; 2],
            pinners: [SquareSet::EMPTY; 2],
            check_squares: [SquareSet::EMPTY; 6],
            threats: [SquareSet::EMPTY; 2],
            captured: None,
            repetition: 0,
            dirty: DirtyPiece::default(),
            threatened: ThreatList::new(),
            threatened_sqs: SquareSet::EMPTY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::piece::{Black, White};

    #[test]
    fn square_flipping() {
        assert_eq!(Square::A1.flip_rank(), Square::A8);
        assert_eq!(Square::H8.flip_rank(), Square::H1);
        assert_eq!(Square::A1.flip_file(), Square::H1);
        assert_eq!(Square::H8.flip_file(), Square::A8);
    }

    #[test]
    fn square_relative_to() {
        assert_eq!(Square::A1.relative_to(Colour::White), Square::A1);
        assert_eq!(Square::A1.relative_to(Colour::Black), Square::A8);
        assert_eq!(Square::E4.relative_to(Colour::Black), Square::E5);
    }

    #[test]
    fn castling_rights_getters_and_setters() {
        let mut rights = CastlingRights::default();

        assert_eq!(rights.kingside(Colour::White), None);
        rights.set_kingside(Colour::White, File::H);
        assert_eq!(rights.kingside(Colour::White), Some(File::H));

        rights.set_queenside(Colour::Black, File::A);
        assert_eq!(rights.queenside(Colour::Black), Some(File::A));

        // overwriting an existing right
        rights.set_kingside(Colour::White, File::G);
        assert_eq!(rights.kingside(Colour::White), Some(File::G));
    }

    #[test]
    fn castling_rights_clearing() {
        let mut rights =
            CastlingRights::new(Some(File::H), Some(File::A), Some(File::H), Some(File::A));

        rights.clear::<White>();
        assert_eq!(rights.kingside(Colour::White), None);
        assert_eq!(rights.queenside(Colour::White), None);
        assert_eq!(rights.kingside(Colour::Black), Some(File::H));

        rights.remove::<Black>(File::A);
        assert_eq!(rights.queenside(Colour::Black), None);
        assert_eq!(rights.kingside(Colour::Black), Some(File::H));

        // removing an absent right has no effect
        rights.remove::<Black>(File::B);
        assert_eq!(rights.kingside(Colour::Black), Some(File::H));
    }
}
