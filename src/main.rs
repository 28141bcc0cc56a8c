#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

//! Tourmaline, a UCI chess engine.

#[macro_use]
mod macros;

mod chess;
mod cli;
mod cuckoo;
mod errors;
mod historytable;
mod lookups;
mod movepicker;
mod nnue;
mod perft;
mod rng;
mod search;
mod searchinfo;
mod threadlocal;
mod threadpool;
mod transpositiontable;
mod uci;
mod util;

use cli::Subcommands::{Bench, Perft};

/// Builds every process-wide table (sliding attacks, cuckoo hashes)
/// before any position exists. Idempotent.
fn initialise_globals() {
    chess::magic::ensure_initialised();
    cuckoo::ensure_initialised();
}

fn main() -> anyhow::Result<()> {
    initialise_globals();

    if std::env::args_os().len() == 1 {
        // fast path straight into UCI
        return uci::main_loop();
    }

    let cli = <cli::Cli as clap::Parser>::parse();

    match cli.subcommand {
        Some(Perft { depth, fen }) => {
            let fen = fen.as_deref().unwrap_or(chess::board::Board::STARTING_FEN);
            let mut board = chess::board::Board::from_fen(fen)?;
            let start = std::time::Instant::now();
            let nodes = perft::divide(&mut board, depth);
            let elapsed = start.elapsed();
            let nps = nodes as u128 * 1000 / elapsed.as_millis().max(1);
            println!("nodes searched: {nodes} ({nps} nps)");
            Ok(())
        }
        Some(Bench { depth }) => uci::bench(depth),
        None => uci::main_loop(),
    }
}
