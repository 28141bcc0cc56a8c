pub mod board;
pub mod chessmove;
pub mod fen;
pub mod magic;
pub mod piece;
pub mod piecelayout;
pub mod squareset;
pub mod types;

use std::sync::atomic::AtomicBool;

/// Whether the engine is playing Fischer-random chess.
/// Set once by the UCI layer, read everywhere castling is interpreted.
pub static CHESS960: AtomicBool = AtomicBool::new(false);
