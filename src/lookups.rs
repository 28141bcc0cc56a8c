#![allow(clippy::cast_possible_truncation)]

use crate::{cfor, rng::XorShiftState};

/// Zobrist keys, generated once at compile time.
///
/// Layout: one key per (piece, square), one per en-passant file, one per
/// castling-rights subset, one for the side to move, and a base key that
/// seeds the pawn hash so an empty pawn structure is still non-zero.
const fn init_hash_keys() -> ([[u64; 64]; 12], [u64; 8], [u64; 16], u64, u64) {
    let mut state = XorShiftState::new();
    let mut piece_keys = [[0; 64]; 12];
    cfor!(let mut piece = 0; piece < 12; piece += 1; {
        cfor!(let mut sq = 0; sq < 64; sq += 1; {
            let key;
            (key, state) = state.next_self();
            piece_keys[piece][sq] = key;
        });
    });
    let mut ep_keys = [0; 8];
    cfor!(let mut file = 0; file < 8; file += 1; {
        let key;
        (key, state) = state.next_self();
        ep_keys[file] = key;
    });
    let mut castle_keys = [0; 16];
    cfor!(let mut subset = 0; subset < 16; subset += 1; {
        let key;
        (key, state) = state.next_self();
        castle_keys[subset] = key;
    });
    let side_key;
    (side_key, state) = state.next_self();
    let no_pawns_key;
    (no_pawns_key, _) = state.next_self();
    (piece_keys, ep_keys, castle_keys, side_key, no_pawns_key)
}

pub static PIECE_KEYS: [[u64; 64]; 12] = init_hash_keys().0;
pub static EP_KEYS: [u64; 8] = init_hash_keys().1;
pub static CASTLE_KEYS: [u64; 16] = init_hash_keys().2;
pub const SIDE_KEY: u64 = init_hash_keys().3;
pub const NO_PAWNS_KEY: u64 = init_hash_keys().4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_keys_distinct() {
        let mut keys: Vec<u64> = PIECE_KEYS.iter().flatten().copied().collect();
        keys.extend_from_slice(&EP_KEYS);
        keys.extend_from_slice(&CASTLE_KEYS);
        keys.push(SIDE_KEY);
        keys.push(NO_PAWNS_KEY);
        let len_before = keys.len();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(len_before, keys.len());
    }
}
