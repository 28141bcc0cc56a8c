//! Iterative-deepening alpha-beta with aspiration windows, transposition
//! cutoffs, null-move pruning, late-move reductions, and a history-driven
//! staged move picker; quiescence over tactical moves at the leaves.

use crate::{
    chess::{board::Board, chessmove::Move},
    historytable::{history_bonus, history_malus, ContHistIndex, CORRECTION_LIMIT},
    movepicker::{capture_kind, MovePicker},
    searchinfo::SearchInfo,
    threadlocal::{PVariation, ThreadData},
    transpositiontable::Bound,
    util::{
        is_mate_score, mate_in, mated_in, INFINITY, MATE_SCORE, MAX_DEPTH, MAX_PLY, VALUE_DRAW,
        VALUE_NONE,
    },
};

const ASPIRATION_WINDOW: i32 = 14;
const NULL_MOVE_MIN_DEPTH: i32 = 3;
const LMR_MIN_DEPTH: i32 = 3;
const LMR_MOVE_THRESHOLD: usize = 3;
const NODE_FLUSH_INTERVAL: u64 = 2048;

/// Searched-move bookkeeping for the history updates at a cutoff.
const MAX_SEARCHED: usize = 64;

/// Runs the full iterative deepening loop on one worker. The worker's
/// board is cloned so the root stays pinned for the whole search.
pub fn iterative_deepening(td: &mut ThreadData, info: &SearchInfo) {
    let mut board = td.board.clone();
    let max_depth = info
        .limits
        .depth
        .unwrap_or(MAX_DEPTH - 1)
        .clamp(1, MAX_DEPTH - 1);
    let mut prev_score = 0;

    for depth in 1..=max_depth {
        let mut pv = PVariation::default();
        let score = aspiration(&mut board, td, info, depth, prev_score, &mut pv);
        if info.stopped() && depth > 1 {
            break;
        }

        td.completed_depth = depth;
        td.best_score = score;
        if let Some(&first) = pv.moves.first() {
            td.best_move = Some(first);
            td.pv = pv;
        }
        prev_score = score;

        if td.is_main() && !info.quiet {
            print_info_line(td, info, depth, score);
        }

        if let Some(mate) = info.limits.mate {
            let mate_found =
                is_mate_score(score) && (MATE_SCORE - score.abs() + 1) / 2 <= mate.abs();
            if mate_found {
                break;
            }
        }
        if info.stopped() {
            break;
        }
    }

    // publish the remainder of this worker's node count
    info.add_nodes(td.nodes % NODE_FLUSH_INTERVAL);
}

/// Searches `depth` inside a window around the previous score, widening
/// on fail-high or fail-low until the score fits.
fn aspiration(
    board: &mut Board,
    td: &mut ThreadData,
    info: &SearchInfo,
    depth: i32,
    prev_score: i32,
    pv: &mut PVariation,
) -> i32 {
    let mut delta = ASPIRATION_WINDOW;
    let (mut alpha, mut beta) = if depth >= 5 {
        (
            (prev_score - delta).max(-INFINITY),
            (prev_score + delta).min(INFINITY),
        )
    } else {
        (-INFINITY, INFINITY)
    };

    loop {
        let score = alpha_beta(board, td, info, true, depth, alpha, beta, 0, false, pv);
        if info.stopped() {
            return score;
        }
        if score <= alpha {
            // fail low: pull beta towards alpha and widen downwards
            beta = (alpha + beta) / 2;
            alpha = (alpha - delta).max(-INFINITY);
        } else if score >= beta {
            beta = (beta + delta).min(INFINITY);
        } else {
            return score;
        }
        delta += delta / 2;
    }
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
fn alpha_beta(
    board: &mut Board,
    td: &mut ThreadData,
    info: &SearchInfo,
    pv_node: bool,
    depth: i32,
    mut alpha: i32,
    mut beta: i32,
    height: usize,
    last_was_null: bool,
    pv: &mut PVariation,
) -> i32 {
    pv.moves.clear();

    if depth <= 0 {
        return quiescence(board, td, info, pv_node, alpha, beta, height);
    }

    td.nodes += 1;
    if td.nodes % NODE_FLUSH_INTERVAL == 0 {
        info.add_nodes(NODE_FLUSH_INTERVAL);
        if td.is_main() {
            info.check_limits();
        }
    }
    if info.stopped() {
        return 0;
    }

    let root_node = height == 0;
    let in_check = board.in_check();

    if !root_node {
        if board.is_draw(height) || board.is_insufficient_material() {
            return VALUE_DRAW;
        }
        // an upcoming repetition bounds us at the draw score
        if alpha < VALUE_DRAW && board.has_game_cycle(height) {
            alpha = VALUE_DRAW;
            if alpha >= beta {
                return alpha;
            }
        }
        if height >= MAX_PLY - 1 {
            return if in_check {
                VALUE_DRAW
            } else {
                td.params.evaluate(board, &mut td.nnue, true)
            };
        }

        // mate distance pruning
        alpha = alpha.max(mated_in(height));
        beta = beta.min(mate_in(height + 1));
        if alpha >= beta {
            return alpha;
        }
    }

    let key = board.zobrist_key();
    let (tt_hit, tt_data, tt_writer) = td.tt.probe(key, height);
    // a racing writer may have torn the entry; only a move that is
    // pseudo-legal here is worth anything
    let tt_move = tt_data
        .mv
        .filter(|&m| tt_hit && board.is_pseudo_legal(m));

    if !pv_node
        && tt_hit
        && tt_data.value != VALUE_NONE
        && tt_data.depth >= depth
        && match tt_data.bound {
            Bound::Exact => true,
            Bound::Lower => tt_data.value >= beta,
            Bound::Upper => tt_data.value <= alpha,
            Bound::None => false,
        }
    {
        return tt_data.value;
    }

    // static evaluation, corrected by the pawn-structure statistics
    let raw_eval = if in_check {
        VALUE_NONE
    } else if tt_hit && tt_data.eval != VALUE_NONE {
        tt_data.eval
    } else {
        td.params.evaluate(board, &mut td.nnue, true)
    };
    let static_eval = if in_check {
        VALUE_NONE
    } else {
        raw_eval + td.correction_history.get(board.turn(), board.pawn_key()) / 8
    };
    td.ss[height].eval = static_eval;
    td.ss[height].in_check = in_check;

    let improving = !in_check
        && height >= 2
        && !td.ss[height - 2].in_check
        && static_eval > td.ss[height - 2].eval;

    // reverse futility: a comfortable static margin at low depth fails high
    if !pv_node
        && !in_check
        && depth <= 6
        && static_eval != VALUE_NONE
        && static_eval - 80 * depth + i32::from(improving) * 60 >= beta
        && !is_mate_score(beta)
    {
        return static_eval;
    }

    // null move pruning
    if !pv_node
        && !in_check
        && !last_was_null
        && depth >= NULL_MOVE_MIN_DEPTH
        && static_eval != VALUE_NONE
        && static_eval >= beta
        && board.has_non_pawn_material()
    {
        let reduction = 3 + depth / 4;
        td.ss[height].current_move = None;
        td.ss[height].conthist_index = ContHistIndex::default();
        board.make_nullmove();
        td.nnue.push(board);
        let mut line = PVariation::default();
        let score = -alpha_beta(
            board,
            td,
            info,
            false,
            depth - reduction,
            -beta,
            -beta + 1,
            height + 1,
            true,
            &mut line,
        );
        td.nnue.pop();
        board.unmake_nullmove();
        if info.stopped() {
            return 0;
        }
        if score >= beta && !is_mate_score(score) {
            return score;
        }
    }

    let killers = td.killers.get(height);
    let counter = if height > 0 && td.ss[height - 1].current_move.is_some() {
        let prev = td.ss[height - 1].conthist_index;
        td.counter_moves.get(prev.piece, prev.square)
    } else {
        None
    };

    let mut picker = MovePicker::new(tt_move, killers, counter);
    let mut best_score = -INFINITY;
    let mut best_move: Option<Move> = None;
    let original_alpha = alpha;
    let mut moves_searched = 0usize;
    let mut quiets_tried: arrayvec::ArrayVec<Move, MAX_SEARCHED> = arrayvec::ArrayVec::new();
    let mut tacticals_tried: arrayvec::ArrayVec<Move, MAX_SEARCHED> = arrayvec::ArrayVec::new();

    while let Some(m) = picker.next(board, td) {
        if !board.legal(m) {
            continue;
        }
        let tactical = board.is_tactical(m);
        let gives_check = board.gives_check(m);
        let moved = board.piece_at(m.from()).unwrap();

        // prefetch the child's cluster before the make touches memory
        td.tt.prefetch(board.key_after(m));

        td.ss[height].current_move = Some(m);
        td.ss[height].conthist_index = ContHistIndex {
            piece: moved,
            square: m.history_to_square(),
        };

        board.make_move(m);
        td.nnue.push(board);
        moves_searched += 1;

        let extension = i32::from(gives_check);
        let new_depth = depth - 1 + extension;

        let mut line = PVariation::default();
        let score = if moves_searched == 1 {
            -alpha_beta(
                board, td, info, pv_node, new_depth, -beta, -alpha, height + 1, false, &mut line,
            )
        } else {
            // late moves first get a reduced null-window look
            let mut reduction = 0;
            if depth >= LMR_MIN_DEPTH
                && moves_searched > LMR_MOVE_THRESHOLD + usize::from(root_node)
                && !tactical
                && !in_check
            {
                reduction = 1 + (moves_searched / 8) as i32 + depth / 8 - i32::from(improving);
                reduction = reduction.clamp(0, new_depth - 1);
            }
            let mut score = -alpha_beta(
                board,
                td,
                info,
                false,
                new_depth - reduction,
                -alpha - 1,
                -alpha,
                height + 1,
                false,
                &mut line,
            );
            if score > alpha && reduction > 0 {
                score = -alpha_beta(
                    board, td, info, false, new_depth, -alpha - 1, -alpha, height + 1, false,
                    &mut line,
                );
            }
            if score > alpha && score < beta {
                score = -alpha_beta(
                    board, td, info, pv_node, new_depth, -beta, -alpha, height + 1, false,
                    &mut line,
                );
            }
            score
        };

        td.nnue.pop();
        board.unmake_move();

        if info.stopped() {
            return 0;
        }

        if score > best_score {
            best_score = score;
            if score > alpha {
                best_move = Some(m);
                alpha = score;
                if pv_node {
                    pv.load_from(m, &line);
                }
            }
            if score >= beta {
                update_stats(
                    td,
                    board,
                    m,
                    depth,
                    height,
                    in_check,
                    &quiets_tried,
                    &tacticals_tried,
                );
                break;
            }
        }

        if tactical {
            if !tacticals_tried.is_full() {
                tacticals_tried.push(m);
            }
        } else if !quiets_tried.is_full() {
            quiets_tried.push(m);
        }
    }

    if moves_searched == 0 {
        return if in_check {
            mated_in(height)
        } else {
            VALUE_DRAW
        };
    }

    let bound = if best_score >= beta {
        Bound::Lower
    } else if best_score > original_alpha {
        Bound::Exact
    } else {
        Bound::Upper
    };
    tt_writer.write(
        key,
        best_score,
        pv_node,
        bound,
        depth,
        best_move,
        raw_eval,
        td.tt.generation(),
        height,
    );

    // teach the correction history how far the static eval missed
    if !in_check
        && best_move.map_or(true, |m| !board.is_tactical(m))
        && !is_mate_score(best_score)
        && static_eval != VALUE_NONE
        && !(bound == Bound::Lower && best_score <= static_eval)
        && !(bound == Bound::Upper && best_score >= static_eval)
    {
        let diff = best_score - static_eval;
        let bonus = (diff * depth / 8).clamp(-CORRECTION_LIMIT / 4, CORRECTION_LIMIT / 4);
        td.correction_history
            .update(board.turn(), board.pawn_key(), bonus);
    }

    best_score
}

/// Rewards the cutoff move and punishes the moves tried before it, in
/// every table that scored them.
#[allow(clippy::too_many_arguments)]
fn update_stats(
    td: &mut ThreadData,
    board: &Board,
    best: Move,
    depth: i32,
    height: usize,
    in_check: bool,
    quiets_tried: &[Move],
    tacticals_tried: &[Move],
) {
    let bonus = history_bonus(depth);
    let malus = history_malus(depth);
    let us = board.turn();
    let pawn_key = board.pawn_key();

    if board.is_tactical(best) {
        let piece = board.piece_at(best.from()).unwrap();
        td.tactical_history
            .update(piece, best.to(), capture_kind(board, best), bonus);
    } else {
        td.killers.insert(height, best);
        if height > 0 && td.ss[height - 1].current_move.is_some() {
            let prev = td.ss[height - 1].conthist_index;
            td.counter_moves.add(prev.piece, prev.square, best);
        }

        let piece = board.piece_at(best.from()).unwrap();
        let to = best.history_to_square();
        td.main_history.update(us, best, bonus);
        td.pawn_history.update(pawn_key, piece, to, bonus);
        update_continuation_histories(td, height, piece, to, bonus, in_check);

        for &m in quiets_tried {
            if m == best {
                continue;
            }
            let piece = board.piece_at(m.from()).unwrap();
            let to = m.history_to_square();
            td.main_history.update(us, m, -malus);
            td.pawn_history.update(pawn_key, piece, to, -malus);
            update_continuation_histories(td, height, piece, to, -malus, in_check);
        }
    }

    for &m in tacticals_tried {
        if m == best {
            continue;
        }
        let piece = board.piece_at(m.from()).unwrap();
        td.tactical_history
            .update(piece, m.to(), capture_kind(board, m), -malus);
    }
}

/// Updates the continuation histories of the move pairs at offsets
/// 1, 2, 3, 4, and 6 plies back. In check only the first two offsets
/// are touched, and the ply-3 update gets a quarter of the bonus.
fn update_continuation_histories(
    td: &mut ThreadData,
    height: usize,
    piece: crate::chess::piece::Piece,
    to: crate::chess::types::Square,
    bonus: i32,
    in_check: bool,
) {
    for offset in [1usize, 2, 3, 4, 6] {
        if in_check && offset > 2 {
            break;
        }
        if height < offset {
            break;
        }
        if td.ss[height - offset].current_move.is_none() {
            continue;
        }
        let index = td.ss[height - offset].conthist_index;
        let scaled = bonus / (1 + 3 * i32::from(offset == 3));
        td.continuation_history
            .get_index_mut(index)
            .update(piece, to, scaled);
    }
}

#[allow(clippy::too_many_arguments)]
fn quiescence(
    board: &mut Board,
    td: &mut ThreadData,
    info: &SearchInfo,
    pv_node: bool,
    mut alpha: i32,
    beta: i32,
    height: usize,
) -> i32 {
    td.nodes += 1;
    if td.nodes % NODE_FLUSH_INTERVAL == 0 {
        info.add_nodes(NODE_FLUSH_INTERVAL);
        if td.is_main() {
            info.check_limits();
        }
    }
    if info.stopped() {
        return 0;
    }

    if board.is_draw(height) || board.is_insufficient_material() {
        return VALUE_DRAW;
    }
    if height >= MAX_PLY - 1 {
        return if board.in_check() {
            VALUE_DRAW
        } else {
            td.params.evaluate(board, &mut td.nnue, true)
        };
    }

    let in_check = board.in_check();
    let key = board.zobrist_key();
    let (tt_hit, tt_data, tt_writer) = td.tt.probe(key, height);
    let tt_move = tt_data
        .mv
        .filter(|&m| tt_hit && board.is_pseudo_legal(m));

    if !pv_node
        && tt_hit
        && tt_data.value != VALUE_NONE
        && match tt_data.bound {
            Bound::Exact => true,
            Bound::Lower => tt_data.value >= beta,
            Bound::Upper => tt_data.value <= alpha,
            Bound::None => false,
        }
    {
        return tt_data.value;
    }

    let raw_eval = if in_check {
        VALUE_NONE
    } else if tt_hit && tt_data.eval != VALUE_NONE {
        tt_data.eval
    } else {
        td.params.evaluate(board, &mut td.nnue, true)
    };

    let stand_pat = if in_check {
        -INFINITY
    } else {
        raw_eval + td.correction_history.get(board.turn(), board.pawn_key()) / 8
    };

    if stand_pat >= beta {
        return stand_pat;
    }
    alpha = alpha.max(stand_pat);

    let mut picker = MovePicker::new_tacticals(tt_move);
    let mut best_score = stand_pat;
    let mut best_move: Option<Move> = None;
    let mut moves_searched = 0usize;

    while let Some(m) = picker.next(board, td) {
        if !board.legal(m) {
            continue;
        }
        td.tt.prefetch(board.key_after(m));
        td.ss[height].current_move = Some(m);
        td.ss[height].conthist_index = ContHistIndex {
            piece: board.piece_at(m.from()).unwrap(),
            square: m.history_to_square(),
        };

        board.make_move(m);
        td.nnue.push(board);
        moves_searched += 1;
        let score = -quiescence(board, td, info, pv_node, -beta, -alpha, height + 1);
        td.nnue.pop();
        board.unmake_move();

        if info.stopped() {
            return 0;
        }

        if score > best_score {
            best_score = score;
            if score > alpha {
                alpha = score;
                best_move = Some(m);
            }
            if score >= beta {
                break;
            }
        }
    }

    if in_check && moves_searched == 0 && !board.has_legal_moves() {
        return mated_in(height);
    }

    let bound = if best_score >= beta {
        Bound::Lower
    } else {
        Bound::Upper
    };
    tt_writer.write(
        key,
        best_score,
        pv_node,
        bound,
        0,
        best_move,
        raw_eval,
        td.tt.generation(),
        height,
    );

    best_score
}

fn print_info_line(td: &ThreadData, info: &SearchInfo, depth: i32, score: i32) {
    let elapsed = info.elapsed();
    let millis = elapsed.as_millis().max(1);
    let nodes = info.nodes.load(std::sync::atomic::Ordering::Relaxed).max(td.nodes);
    let nps = nodes as u128 * 1000 / millis;
    let score_str = format_score(score);
    let chess960 = crate::chess::CHESS960.load(std::sync::atomic::Ordering::Relaxed);
    let pv: Vec<String> = td
        .pv
        .moves
        .iter()
        .map(|m| m.display(chess960).to_string())
        .collect();
    println!(
        "info depth {depth} score {score_str} nodes {nodes} nps {nps} time {millis} hashfull {hashfull} pv {pv}",
        hashfull = td.tt.hashfull(0),
        pv = pv.join(" "),
    );
}

/// Formats a score for the UCI info channel: centipawns, or moves to
/// mate from the engine's point of view.
pub fn format_score(score: i32) -> String {
    if is_mate_score(score) {
        let plies_to_mate = MATE_SCORE - score.abs();
        let moves_to_mate = (plies_to_mate + 1) / 2;
        if score > 0 {
            format!("mate {moves_to_mate}")
        } else {
            format!("mate -{moves_to_mate}")
        }
    } else {
        format!("cp {score}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nnue::network::patterned_params,
        searchinfo::SearchLimits,
        transpositiontable::TT,
    };
    use std::sync::atomic::{AtomicBool, AtomicU64};

    fn run_search(fen: &str, depth: i32) -> (Option<Move>, i32, u64) {
        let board = Board::from_fen(fen).unwrap();
        let params = patterned_params();
        let mut tt = TT::new();
        tt.resize(16, 1);
        tt.new_search();
        let stop = AtomicBool::new(false);
        let nodes = AtomicU64::new(0);
        let mut info = SearchInfo::new(&stop, &nodes, SearchLimits::depth(depth));
        info.quiet = true;
        let mut td = ThreadData::new(0, &board, tt.view(), &params);
        iterative_deepening(&mut td, &info);
        (td.best_move, td.best_score, td.nodes)
    }

    #[test]
    fn finds_mate_in_one() {
        // back-rank mate with the rook
        let (best, score, _) = run_search("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1", 4);
        assert_eq!(best.map(|m| m.display(false).to_string()), Some("a1a8".into()));
        assert_eq!(score, mate_in(1));
    }

    #[test]
    fn search_is_deterministic_across_runs() {
        // same position, fresh table: identical best move, score, nodes
        let first = run_search(Board::STARTING_FEN, 6);
        let second = run_search(Board::STARTING_FEN, 6);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2);
    }

    #[test]
    fn stalemate_scores_draw() {
        let (_, score, _) = run_search("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1", 2);
        assert_eq!(score, VALUE_DRAW);
    }

    #[test]
    fn recognises_mated_position() {
        let board = Board::from_fen("R5k1/5ppp/8/8/8/8/5PPP/6K1 b - - 0 1").unwrap();
        assert!(board.in_check());
        assert!(board.legal_moves().is_empty());
    }
}
