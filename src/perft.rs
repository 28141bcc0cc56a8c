use crate::chess::{board::Board, CHESS960};

/// Counts the leaf nodes of the legal move tree to `depth`.
pub fn perft(board: &mut Board, depth: i32) -> u64 {
    if depth <= 0 {
        return 1;
    }
    let moves = board.legal_moves();
    if depth == 1 {
        return moves.len() as u64;
    }
    let mut count = 0;
    for m in moves {
        board.make_move(m);
        count += perft(board, depth - 1);
        board.unmake_move();
    }
    count
}

/// Perft with a per-root-move breakdown, as `go perft` prints it.
pub fn divide(board: &mut Board, depth: i32) -> u64 {
    let chess960 = CHESS960.load(std::sync::atomic::Ordering::Relaxed);
    let mut total = 0;
    for m in board.legal_moves() {
        board.make_move(m);
        let nodes = perft(board, depth - 1);
        board.unmake_move();
        println!("{}: {nodes}", m.display(chess960));
        total += nodes;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect(fen: &str, counts: &[u64]) {
        let mut board = Board::from_fen(fen).unwrap();
        for (depth, &expected) in counts.iter().enumerate() {
            assert_eq!(
                perft(&mut board, depth as i32 + 1),
                expected,
                "wrong perft({}) for {fen}",
                depth + 1,
            );
        }
    }

    #[test]
    fn startpos_shallow() {
        expect(Board::STARTING_FEN, &[20, 400, 8902, 197_281]);
    }

    #[test]
    fn kiwipete_shallow() {
        expect(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            &[48, 2039, 97_862],
        );
    }

    #[test]
    fn tricky_positions() {
        // positions chosen for their en-passant, promotion, and pin traps
        expect("8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1", &[14, 191, 2812, 43_238]);
        expect(
            "r3k2r/Pppp1ppp/1b3nbN/nP6/BBP1P3/q4N2/Pp1P2PP/R2Q1RK1 w kq - 0 1",
            &[6, 264, 9467],
        );
        expect(
            "rnbq1k1r/pp1Pbppp/2p5/8/2B5/8/PPP1NnPP/RNBQK2R w KQ - 1 8",
            &[44, 1486, 62_379],
        );
        expect(
            "r4rk1/1pp1qppp/p1np1n2/2b1p1B1/2B1P1b1/P1NP1N2/1PP1QPPP/R4RK1 w - - 0 10",
            &[46, 2079, 89_890],
        );
    }

    #[test]
    #[ignore = "heavy: the full depth-6 suite takes a while in debug builds"]
    fn startpos_deep() {
        expect(
            Board::STARTING_FEN,
            &[20, 400, 8902, 197_281, 4_865_609, 119_060_324],
        );
    }

    #[test]
    #[ignore = "heavy: kiwipete to depth 5"]
    fn kiwipete_deep() {
        expect(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
            &[48, 2039, 97_862, 4_085_603, 193_690_690],
        );
    }
}
