use std::sync::OnceLock;

use crate::{
    chess::{
        board::movegen::attacks_by_type,
        chessmove::Move,
        piece::{Piece, PieceType},
        squareset::SquareSet,
        types::Square,
    },
    lookups::{PIECE_KEYS, SIDE_KEY},
};

/// Tables for fast reversible-move detection: every (piece, from, to)
/// pair a non-pawn can play on an empty board, keyed by the Zobrist
/// delta of playing it, in an 8192-slot two-hash cuckoo table.
struct CuckooTables {
    keys: Box<[u64; 8192]>,
    moves: Box<[Option<Move>; 8192]>,
}

static TABLES: OnceLock<CuckooTables> = OnceLock::new();

pub const fn h1(key: u64) -> usize {
    (key & 0x1FFF) as usize
}

pub const fn h2(key: u64) -> usize {
    ((key >> 16) & 0x1FFF) as usize
}

pub fn keys() -> &'static [u64; 8192] {
    &tables().keys
}

pub fn moves() -> &'static [Option<Move>; 8192] {
    &tables().moves
}

fn tables() -> &'static CuckooTables {
    TABLES.get_or_init(init)
}

/// Eagerly populates the tables; idempotent, and implicit in the first
/// probe, so tests may run in any order.
pub fn ensure_initialised() {
    let _ = tables();
}

fn init() -> CuckooTables {
    // tally the insertions to sanity-check the construction
    let mut count = 0u32;

    let mut keys = vec![0u64; 8192];
    let mut cuckoo_moves = vec![None; 8192];

    for piece in Piece::all() {
        if piece.piece_type() == PieceType::Pawn {
            continue;
        }
        for square0 in Square::all() {
            for square1 in Square::all().filter(|&s1| s1 > square0) {
                let reachable =
                    attacks_by_type(piece.piece_type(), square0, SquareSet::EMPTY)
                        .contains_square(square1);
                if !reachable {
                    continue;
                }

                let mut mv = Some(Move::new(square0, square1));
                let mut key = PIECE_KEYS[piece][square0] ^ PIECE_KEYS[piece][square1] ^ SIDE_KEY;
                let mut slot = h1(key);
                loop {
                    std::mem::swap(&mut keys[slot], &mut key);
                    std::mem::swap(&mut cuckoo_moves[slot], &mut mv);

                    if mv.is_none() {
                        break;
                    }

                    slot = if slot == h1(key) { h2(key) } else { h1(key) };
                }
                count += 1;
            }
        }
    }

    // there are exactly this many reversible moves in chess
    assert_eq!(count, 3668);

    CuckooTables {
        keys: keys.into_boxed_slice().try_into().map_err(|_| ()).unwrap(),
        moves: cuckoo_moves
            .into_boxed_slice()
            .try_into()
            .map_err(|_| ())
            .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_fully_populated() {
        // ensure_initialised asserts the 3668-entry cardinality itself
        ensure_initialised();
        let populated = moves().iter().filter(|m| m.is_some()).count();
        assert_eq!(populated, 3668);
    }

    #[test]
    fn every_entry_is_findable_by_its_key() {
        for (slot, &key) in keys().iter().enumerate() {
            if moves()[slot].is_some() {
                assert!(h1(key) == slot || h2(key) == slot);
            }
        }
    }
}
