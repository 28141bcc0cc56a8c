//! Per-ply feature accumulators and their lazy update machinery.
//!
//! Two stacks run in parallel: the king-bucketed piece-square stack,
//! whose per-ply diffs are at most two squares each way, and the threat
//! stack, whose diffs are whole threat lists. An accumulator entry is
//! only brought up to date when an evaluation actually needs it: scan
//! back for the nearest usable entry, then either walk diffs forward,
//! or rebuild from the king-bucket refresh cache and walk backwards so
//! nearby probes hit the fast path again.

use arrayvec::ArrayVec;

use crate::{
    chess::{
        board::Board,
        piece::Colour,
        piecelayout::PieceLayout,
        squareset::SquareSet,
        types::{DirtyPiece, FeatureUpdate, ThreatList},
    },
    util::MAX_PLY,
};

use super::{
    feature::{psq, threat, IndexList},
    network::NetworkParams,
    simd, Align64, L1_SIZE, PSQT_BUCKETS, PSQ_DIMS,
};

/// One accumulator: the transformer output per perspective, the PSQT
/// side channel, and whether each perspective is currently valid.
///
/// When `computed[c]` is set, the row equals biases (piece-square
/// stack) or zero (threat stack) plus the weight columns of every
/// active feature of the position at this ply.
#[derive(Clone)]
pub struct Accumulator {
    pub accumulation: [Align64<[i16; L1_SIZE]>; 2],
    pub psqt: [[i32; PSQT_BUCKETS]; 2],
    pub computed: [bool; 2],
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            accumulation: [Align64([0; L1_SIZE]), Align64([0; L1_SIZE])],
            psqt: [[0; PSQT_BUCKETS]; 2],
            computed: [false; 2],
        }
    }
}

/// Piece-square stack entry: the accumulator plus the square diff that
/// produced this ply.
#[derive(Clone, Default)]
pub struct PsqState {
    pub acc: Accumulator,
    pub diff: DirtyPiece,
}

/// Threat stack entry: the accumulator plus this ply's full threat
/// list, from which diffs against any neighbour can be derived.
#[derive(Clone, Default)]
pub struct ThreatState {
    pub acc: Accumulator,
    pub threatened: ThreatList,
    pub threatened_sqs: SquareSet,
}

/// One slot of the king-bucket refresh cache: the accumulator last
/// computed for this (king square, perspective), and the piece layout
/// it was computed from.
#[derive(Clone)]
pub struct CacheEntry {
    pub accumulation: Align64<[i16; L1_SIZE]>,
    pub psqt: [i32; PSQT_BUCKETS],
    pub bbs: PieceLayout,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            accumulation: Align64([0; L1_SIZE]),
            psqt: [0; PSQT_BUCKETS],
            bbs: PieceLayout::default(),
        }
    }
}

/// The full NNUE evaluation state of one search thread.
pub struct NnueState {
    pub psq: Box<[PsqState]>,
    pub threat: Box<[ThreatState]>,
    /// Index of the entry for the current position.
    pub current: usize,
    /// Refresh cache, indexed by king square and perspective.
    cache: Box<[CacheEntry]>,
}

impl NnueState {
    pub fn new() -> Self {
        Self {
            psq: (0..=MAX_PLY).map(|_| PsqState::default()).collect(),
            threat: (0..=MAX_PLY).map(|_| ThreatState::default()).collect(),
            current: 0,
            cache: (0..64 * 2).map(|_| CacheEntry::default()).collect(),
        }
    }

    /// Rebuilds everything for a new root position. The refresh cache is
    /// reset to biases-over-an-empty-board, the root piece-square
    /// accumulator comes straight back out of it, and the root threat
    /// accumulator is accumulated from scratch.
    pub fn reset(&mut self, board: &Board, params: &NetworkParams) {
        self.current = 0;

        for entry in self.cache.iter_mut() {
            entry.accumulation = params.ft_biases.clone();
            entry.psqt = [0; PSQT_BUCKETS];
            entry.bbs = PieceLayout::default();
        }

        self.psq[0].diff.clear();
        self.threat[0].threatened = board.state().threatened.clone();
        self.threat[0].threatened_sqs = board.state().threatened_sqs;
        self.psq[0].acc.computed = [false; 2];
        self.threat[0].acc.computed = [false; 2];

        for perspective in Colour::all() {
            self.refresh_psq_from_cache(0, perspective, board, params);

            let mut active = IndexList::new();
            threat::append_active(&self.threat[0].threatened.clone(), perspective, &mut active);
            let entry = &mut self.threat[0];
            entry.acc.accumulation[perspective].0.fill(0);
            entry.acc.psqt[perspective] = [0; PSQT_BUCKETS];
            let offset: ArrayVec<usize, { super::feature::MAX_ACTIVE }> =
                active.iter().map(|&f| f + PSQ_DIMS).collect();
            simd::apply_diff_inplace(
                &mut entry.acc.accumulation[perspective],
                &params.ft_weights,
                &offset,
                &[],
            );
            for &f in &offset {
                for b in 0..PSQT_BUCKETS {
                    entry.acc.psqt[perspective][b] += params.psqt_weights.0[f * PSQT_BUCKETS + b];
                }
            }
            entry.acc.computed[perspective] = true;
        }
    }

    /// Records the diff of a move just made on `board` and advances the
    /// stacks. Both new entries start invalid.
    pub fn push(&mut self, board: &Board) {
        debug_assert!(self.current + 1 <= MAX_PLY);
        self.current += 1;
        let st = board.state();
        let psq_entry = &mut self.psq[self.current];
        psq_entry.diff = st.dirty.clone();
        psq_entry.acc.computed = [false; 2];
        let threat_entry = &mut self.threat[self.current];
        threat_entry.threatened = st.threatened.clone();
        threat_entry.threatened_sqs = st.threatened_sqs;
        threat_entry.acc.computed = [false; 2];
    }

    pub fn pop(&mut self) {
        debug_assert!(self.current > 0);
        self.current -= 1;
    }

    /// Brings the current entry of both stacks up to date for both
    /// perspectives.
    pub fn force(&mut self, board: &Board, params: &NetworkParams) {
        for perspective in Colour::all() {
            self.ensure_psq(board, params, perspective);
            self.ensure_threat(params, perspective);
        }
    }

    // ------------------------------------------------------------------
    // piece-square stack

    /// Finds the highest index at or below the current entry that is
    /// either valid or a chain-breaking king move.
    fn find_last_usable_psq(&self, perspective: Colour) -> usize {
        let mut idx = self.current;
        while idx > 0 {
            if self.psq[idx].acc.computed[perspective] {
                return idx;
            }
            if psq::requires_refresh(&self.psq[idx].diff, perspective) {
                return idx;
            }
            idx -= 1;
        }
        0
    }

    fn ensure_psq(&mut self, board: &Board, params: &NetworkParams, perspective: Colour) {
        if self.psq[self.current].acc.computed[perspective] {
            return;
        }
        let last = self.find_last_usable_psq(perspective);
        if self.psq[last].acc.computed[perspective] {
            self.forward_update_psq(board, params, perspective, last);
        } else {
            self.refresh_psq_from_cache(self.current, perspective, board, params);
            self.backward_update_psq(board, params, perspective, last);
        }
    }

    /// Replays diffs from entry `begin` up to the current entry. A
    /// capture followed by a recapture on the same square is fused into
    /// a single three-term update spanning both plies.
    fn forward_update_psq(
        &mut self,
        board: &Board,
        params: &NetworkParams,
        perspective: Colour,
        begin: usize,
    ) {
        let king = board.king_sq(perspective);
        let mut next = begin + 1;
        while next <= self.current {
            if next + 1 <= self.current {
                let fusable = self.psq[next]
                    .diff
                    .adds
                    .iter()
                    .any(|a| self.psq[next + 1].diff.subs.contains(a));
                if fusable {
                    let (adds, subs) =
                        combine_diffs(&self.psq[next].diff, &self.psq[next + 1].diff);
                    let mut added = IndexList::new();
                    let mut removed = IndexList::new();
                    for f in &adds {
                        added.push(psq::make_index(perspective, king, *f).index());
                    }
                    for f in &subs {
                        removed.push(psq::make_index(perspective, king, *f).index());
                    }
                    self.apply_psq(params, perspective, next - 1, next + 1, &added, &removed);
                    next += 2;
                    continue;
                }
            }

            let mut added = IndexList::new();
            let mut removed = IndexList::new();
            psq::append_changed(
                perspective,
                king,
                &self.psq[next].diff,
                &mut added,
                &mut removed,
            );
            self.apply_psq(params, perspective, next - 1, next, &added, &removed);
            next += 1;
        }
        debug_assert!(self.psq[self.current].acc.computed[perspective]);
    }

    /// Replays diffs in reverse from the current entry down to `end`,
    /// restoring the intermediate entries after a cache refresh.
    fn backward_update_psq(
        &mut self,
        board: &Board,
        params: &NetworkParams,
        perspective: Colour,
        end: usize,
    ) {
        let king = board.king_sq(perspective);
        for next in (end..self.current).rev() {
            let mut added = IndexList::new();
            let mut removed = IndexList::new();
            psq::append_changed(
                perspective,
                king,
                &self.psq[next + 1].diff,
                &mut added,
                &mut removed,
            );
            // undoing the diff: swap the roles of added and removed
            self.apply_psq(params, perspective, next + 1, next, &removed, &added);
        }
        debug_assert!(self.psq[end].acc.computed[perspective]);
    }

    fn apply_psq(
        &mut self,
        params: &NetworkParams,
        perspective: Colour,
        from: usize,
        to: usize,
        added: &[usize],
        removed: &[usize],
    ) {
        debug_assert!(self.psq[from].acc.computed[perspective]);
        let (src, dst) = pair_mut(&mut self.psq, from, to);
        simd::apply_diff(
            &src.acc.accumulation[perspective],
            &mut dst.acc.accumulation[perspective],
            &params.ft_weights,
            added,
            removed,
        );
        dst.acc.psqt[perspective] = src.acc.psqt[perspective];
        for &f in added {
            for b in 0..PSQT_BUCKETS {
                dst.acc.psqt[perspective][b] += params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        for &f in removed {
            for b in 0..PSQT_BUCKETS {
                dst.acc.psqt[perspective][b] -= params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        dst.acc.computed[perspective] = true;
    }

    /// Rebuilds one perspective of entry `index` from the refresh cache:
    /// diff the cached board against the real one, patch the cached
    /// accumulator, and copy it out.
    fn refresh_psq_from_cache(
        &mut self,
        index: usize,
        perspective: Colour,
        board: &Board,
        params: &NetworkParams,
    ) {
        let king = board.king_sq(perspective);
        let entry = &mut self.cache[king.index() * 2 + perspective.index()];

        let mut added = IndexList::new();
        let mut removed = IndexList::new();
        entry.bbs.update_iter(board.state().bbs, |sq, piece, is_add| {
            let idx = psq::make_index(perspective, king, FeatureUpdate { sq, piece }).index();
            if is_add {
                added.push(idx);
            } else {
                removed.push(idx);
            }
        });

        simd::apply_diff_inplace(&mut entry.accumulation, &params.ft_weights, &added, &removed);
        for &f in &added {
            for b in 0..PSQT_BUCKETS {
                entry.psqt[b] += params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        for &f in &removed {
            for b in 0..PSQT_BUCKETS {
                entry.psqt[b] -= params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        entry.bbs = board.state().bbs;

        let acc = &mut self.psq[index].acc;
        acc.accumulation[perspective] = entry.accumulation.clone();
        acc.psqt[perspective] = entry.psqt;
        acc.computed[perspective] = true;
    }

    // ------------------------------------------------------------------
    // threat stack

    fn find_last_usable_threat(&self, perspective: Colour) -> usize {
        let mut idx = self.current;
        while idx > 0 {
            if self.threat[idx].acc.computed[perspective] {
                return idx;
            }
            idx -= 1;
        }
        0
    }

    fn ensure_threat(&mut self, params: &NetworkParams, perspective: Colour) {
        if self.threat[self.current].acc.computed[perspective] {
            return;
        }
        let last = self.find_last_usable_threat(perspective);
        debug_assert!(self.threat[last].acc.computed[perspective]);
        self.forward_update_threat(params, perspective, last);
    }

    /// Replays threat-list diffs forward. When the next ply removes a
    /// piece from a square this ply marks as threatened, both plies are
    /// diffed against the endpoint lists in one go.
    fn forward_update_threat(&mut self, params: &NetworkParams, perspective: Colour, begin: usize) {
        let mut next = begin + 1;
        while next <= self.current {
            if next + 1 <= self.current {
                let fusable = self.psq[next + 1]
                    .diff
                    .subs
                    .iter()
                    .any(|s| self.threat[next].threatened_sqs.contains_square(s.sq));
                if fusable {
                    let mut added = IndexList::new();
                    let mut removed = IndexList::new();
                    threat::append_changed(
                        perspective,
                        &self.threat[next - 1].threatened,
                        &self.threat[next + 1].threatened,
                        &mut added,
                        &mut removed,
                    );
                    self.apply_threat(params, perspective, next - 1, next + 1, &added, &removed);
                    next += 2;
                    continue;
                }
            }

            let mut added = IndexList::new();
            let mut removed = IndexList::new();
            threat::append_changed(
                perspective,
                &self.threat[next - 1].threatened,
                &self.threat[next].threatened,
                &mut added,
                &mut removed,
            );
            self.apply_threat(params, perspective, next - 1, next, &added, &removed);
            next += 1;
        }
        debug_assert!(self.threat[self.current].acc.computed[perspective]);
    }

    fn apply_threat(
        &mut self,
        params: &NetworkParams,
        perspective: Colour,
        from: usize,
        to: usize,
        added: &[usize],
        removed: &[usize],
    ) {
        debug_assert!(self.threat[from].acc.computed[perspective]);
        // threat columns sit after the piece-square block
        let added: IndexList = added.iter().map(|&f| f + PSQ_DIMS).collect();
        let removed: IndexList = removed.iter().map(|&f| f + PSQ_DIMS).collect();
        let (src, dst) = pair_mut(&mut self.threat, from, to);
        simd::apply_diff(
            &src.acc.accumulation[perspective],
            &mut dst.acc.accumulation[perspective],
            &params.ft_weights,
            &added,
            &removed,
        );
        dst.acc.psqt[perspective] = src.acc.psqt[perspective];
        for &f in &added {
            for b in 0..PSQT_BUCKETS {
                dst.acc.psqt[perspective][b] += params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        for &f in &removed {
            for b in 0..PSQT_BUCKETS {
                dst.acc.psqt[perspective][b] -= params.psqt_weights.0[f * PSQT_BUCKETS + b];
            }
        }
        dst.acc.computed[perspective] = true;
    }

    /// The combined transformer input at the current ply: piece-square
    /// plus threat accumulation, as an i32 to dodge overflow before
    /// clamping.
    pub fn combined(&self, perspective: Colour, j: usize) -> i32 {
        i32::from(self.psq[self.current].acc.accumulation[perspective].0[j])
            + i32::from(self.threat[self.current].acc.accumulation[perspective].0[j])
    }

    /// The combined PSQT accumulation at the current ply.
    pub fn combined_psqt(&self, perspective: Colour, bucket: usize) -> i32 {
        self.psq[self.current].acc.psqt[perspective][bucket]
            + self.threat[self.current].acc.psqt[perspective][bucket]
    }
}

/// Cancels identical add/sub pairs across two consecutive diffs,
/// producing the net change of both plies. Pure term cancellation, so
/// applying the result is arithmetically identical to applying the two
/// diffs in sequence.
fn combine_diffs(
    d1: &DirtyPiece,
    d2: &DirtyPiece,
) -> (ArrayVec<FeatureUpdate, 4>, ArrayVec<FeatureUpdate, 4>) {
    let mut adds: ArrayVec<FeatureUpdate, 4> = d1.adds.iter().chain(&d2.adds).copied().collect();
    let mut subs: ArrayVec<FeatureUpdate, 4> = d1.subs.iter().chain(&d2.subs).copied().collect();

    let mut i = 0;
    'outer: while i < adds.len() {
        for j in 0..subs.len() {
            if adds[i] == subs[j] {
                adds.swap_remove(i);
                subs.swap_remove(j);
                continue 'outer;
            }
        }
        i += 1;
    }

    (adds, subs)
}

fn pair_mut<T>(slice: &mut [T], a: usize, b: usize) -> (&T, &mut T) {
    debug_assert!(a != b);
    if a < b {
        let (front, back) = slice.split_at_mut(b);
        (&front[a], &mut back[0])
    } else {
        let (front, back) = slice.split_at_mut(a);
        (&back[0], &mut front[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::piece::Piece;
    use crate::chess::types::Square;
    use crate::nnue::network::{patterned_params, NetworkParams};

    fn fresh_eval(board: &Board, params: &NetworkParams) -> i32 {
        let mut state = NnueState::new();
        state.reset(board, params);
        params.evaluate(board, &mut state, false)
    }

    fn play(board: &mut Board, nnue: &mut NnueState, uci: &str) {
        let m = board.parse_uci(uci).unwrap();
        board.make_move(m);
        nnue.push(board);
    }

    #[test]
    fn incremental_accumulators_match_from_scratch() {
        let params = patterned_params();
        let mut board = Board::from_fen(
            "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        )
        .unwrap();
        let mut nnue = NnueState::new();
        nnue.reset(&board, &params);

        for uci in ["e2a6", "b4c3", "e5g6", "h3g2", "g6e7", "g2h1q"] {
            play(&mut board, &mut nnue, uci);
            // evaluating every ply keeps the chain in the forward-update
            // fast path; each result must match a from-scratch rebuild
            assert_eq!(
                params.evaluate(&board, &mut nnue, false),
                fresh_eval(&board, &params),
                "diverged after {uci}",
            );
        }

        // walking back must leave earlier entries just as exact
        for _ in 0..3 {
            board.unmake_move();
            nnue.pop();
            assert_eq!(
                params.evaluate(&board, &mut nnue, false),
                fresh_eval(&board, &params),
            );
        }
    }

    #[test]
    fn fused_and_unfused_updates_agree() {
        let params = patterned_params();

        // capture and recapture on d5: evaluating only at the end lets
        // the double-update fusion kick in
        let mut lazy_board = Board::default();
        let mut lazy = NnueState::new();
        lazy.reset(&lazy_board, &params);
        for uci in ["e2e4", "d7d5", "e4d5", "d8d5"] {
            play(&mut lazy_board, &mut lazy, uci);
        }
        let fused = params.evaluate(&lazy_board, &mut lazy, false);

        // same line, evaluated ply by ply, never fuses
        let mut eager_board = Board::default();
        let mut eager = NnueState::new();
        eager.reset(&eager_board, &params);
        for uci in ["e2e4", "d7d5", "e4d5", "d8d5"] {
            play(&mut eager_board, &mut eager, uci);
            params.evaluate(&eager_board, &mut eager, false);
        }
        let unfused = params.evaluate(&eager_board, &mut eager, false);

        assert_eq!(fused, unfused);
        assert_eq!(fused, fresh_eval(&lazy_board, &params));
    }

    #[test]
    fn king_bucket_refresh_produces_exact_values() {
        let params = patterned_params();
        let mut board = Board::from_fen("4k3/7p/8/8/8/8/P7/4K3 w - - 0 1").unwrap();
        let mut nnue = NnueState::new();
        nnue.reset(&board, &params);

        // the white king steps across the mirror boundary, breaking the
        // incremental chain and forcing the cache-refresh path
        for uci in ["e1d1", "e8d8", "d1c1", "d8c8"] {
            play(&mut board, &mut nnue, uci);
        }
        assert_eq!(
            params.evaluate(&board, &mut nnue, false),
            fresh_eval(&board, &params),
        );

        // and the backward pass restored the intermediate plies, so
        // popping stays on the fast path and stays exact
        board.unmake_move();
        nnue.pop();
        assert_eq!(
            params.evaluate(&board, &mut nnue, false),
            fresh_eval(&board, &params),
        );
    }

    #[test]
    fn combine_diffs_cancels_recaptures() {
        // a knight captures on d5, then gets captured by a pawn
        let mut d1 = DirtyPiece::default();
        d1.move_piece(Square::F4, Square::D5, Piece::WN);
        d1.clear_piece(Square::D5, Piece::BP);
        let mut d2 = DirtyPiece::default();
        d2.move_piece(Square::C6, Square::D5, Piece::BP);
        d2.clear_piece(Square::D5, Piece::WN);

        let (adds, subs) = combine_diffs(&d1, &d2);
        // net effect across both plies: d5 holds a black pawn again, so
        // only the knight and the c6 pawn actually left the board
        assert!(adds.is_empty());
        assert_eq!(subs.len(), 2);
        assert!(subs.contains(&FeatureUpdate {
            sq: Square::F4,
            piece: Piece::WN
        }));
        assert!(subs.contains(&FeatureUpdate {
            sq: Square::C6,
            piece: Piece::BP
        }));
    }
}
