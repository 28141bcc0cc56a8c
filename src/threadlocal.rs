use arrayvec::ArrayVec;

use crate::{
    chess::{board::Board, chessmove::Move},
    historytable::{
        ButterflyHistory, CaptureHistory, ContHistIndex, ContinuationHistory, CorrectionHistory,
        CounterMoveTable, KillerTable, PawnHistory,
    },
    nnue::{accumulator::NnueState, network::NetworkParams},
    transpositiontable::TTView,
    util::MAX_PLY,
};

/// The principal variation collected at a root search.
#[derive(Clone, Default)]
pub struct PVariation {
    pub moves: ArrayVec<Move, MAX_PLY>,
    pub score: i32,
}

impl PVariation {
    pub fn load_from(&mut self, m: Move, rest: &Self) {
        self.moves.clear();
        self.moves.push(m);
        self.moves
            .try_extend_from_slice(&rest.moves)
            .expect("PV overflowed");
        self.score = rest.score;
    }
}

/// Per-ply search state, addressed by height.
#[derive(Clone, Copy, Default)]
pub struct SearchStackEntry {
    pub eval: i32,
    pub current_move: Option<Move>,
    pub conthist_index: ContHistIndex,
    pub in_check: bool,
}

/// Everything a worker owns privately: its board copy, accumulator
/// stacks, histories, and per-ply stack. The transposition table view
/// and network weights are the only shared references.
pub struct ThreadData<'a> {
    pub thread_id: usize,
    pub board: Board,
    pub nnue: Box<NnueState>,

    pub main_history: Box<ButterflyHistory>,
    pub tactical_history: Box<CaptureHistory>,
    pub continuation_history: Box<ContinuationHistory>,
    pub pawn_history: Box<PawnHistory>,
    pub counter_moves: Box<CounterMoveTable>,
    pub correction_history: Box<CorrectionHistory>,
    pub killers: Box<KillerTable>,

    pub ss: Vec<SearchStackEntry>,
    pub pv: PVariation,

    pub tt: TTView<'a>,
    pub params: &'a NetworkParams,

    /// Nodes searched by this worker alone.
    pub nodes: u64,
    pub best_move: Option<Move>,
    pub best_score: i32,
    pub completed_depth: i32,
}

impl<'a> ThreadData<'a> {
    pub fn new(thread_id: usize, board: &Board, tt: TTView<'a>, params: &'a NetworkParams) -> Self {
        let mut nnue = Box::new(NnueState::new());
        nnue.reset(board, params);
        Self {
            thread_id,
            board: board.clone(),
            nnue,
            main_history: ButterflyHistory::boxed(),
            tactical_history: CaptureHistory::boxed(),
            continuation_history: ContinuationHistory::boxed(),
            pawn_history: PawnHistory::boxed(),
            counter_moves: CounterMoveTable::boxed(),
            correction_history: CorrectionHistory::boxed(),
            killers: KillerTable::boxed(),
            ss: vec![SearchStackEntry::default(); MAX_PLY],
            pv: PVariation::default(),
            tt,
            params,
            nodes: 0,
            best_move: None,
            best_score: 0,
            completed_depth: 0,
        }
    }

    /// Hands the history tables back to the worker so they stay warm
    /// across consecutive searches of the same game.
    pub fn take_histories(&mut self) -> HistoryStore {
        HistoryStore {
            main_history: std::mem::replace(&mut self.main_history, ButterflyHistory::boxed()),
            tactical_history: std::mem::replace(
                &mut self.tactical_history,
                CaptureHistory::boxed(),
            ),
            continuation_history: std::mem::replace(
                &mut self.continuation_history,
                ContinuationHistory::boxed(),
            ),
            pawn_history: std::mem::replace(&mut self.pawn_history, PawnHistory::boxed()),
            counter_moves: std::mem::replace(&mut self.counter_moves, CounterMoveTable::boxed()),
            correction_history: std::mem::replace(
                &mut self.correction_history,
                CorrectionHistory::boxed(),
            ),
            killers: std::mem::replace(&mut self.killers, KillerTable::boxed()),
        }
    }

    pub fn install_histories(&mut self, store: HistoryStore) {
        self.main_history = store.main_history;
        self.tactical_history = store.tactical_history;
        self.continuation_history = store.continuation_history;
        self.pawn_history = store.pawn_history;
        self.counter_moves = store.counter_moves;
        self.correction_history = store.correction_history;
        self.killers = store.killers;
    }

    pub const fn is_main(&self) -> bool {
        self.thread_id == 0
    }
}

/// The history tables of one worker, parked between searches.
pub struct HistoryStore {
    pub main_history: Box<ButterflyHistory>,
    pub tactical_history: Box<CaptureHistory>,
    pub continuation_history: Box<ContinuationHistory>,
    pub pawn_history: Box<PawnHistory>,
    pub counter_moves: Box<CounterMoveTable>,
    pub correction_history: Box<CorrectionHistory>,
    pub killers: Box<KillerTable>,
}

impl HistoryStore {
    /// Zeroes every table, as a new game demands.
    pub fn clear(&mut self) {
        self.main_history.clear();
        self.tactical_history.clear();
        self.continuation_history.clear();
        self.pawn_history.clear();
        self.counter_moves.clear();
        self.correction_history.clear();
        self.killers.clear();
    }
}
