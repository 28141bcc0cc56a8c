//! The worker pool: one main worker plus helpers, parked on condition
//! variables while idle, woken by a broadcast carrying the root state.
//!
//! Workers share the transposition table, the network weights, and the
//! stop flag; everything else is thread-local. When the main worker's
//! search returns it raises the stop flag, waits for the helpers'
//! completion counter, elects the best thread, and announces the move.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
};

use crate::{
    chess::{board::Board, CHESS960},
    nnue::network::NetworkParams,
    search,
    searchinfo::{SearchInfo, SearchLimits},
    threadlocal::ThreadData,
    transpositiontable::TT,
    util::is_mate_score,
};

/// What one worker reports when its search unwinds.
#[derive(Clone, Default)]
pub struct WorkerReport {
    pub best_move: Option<crate::chess::chessmove::Move>,
    pub ponder_move: Option<crate::chess::chessmove::Move>,
    pub score: i32,
    pub depth: i32,
    pub nodes: u64,
}

#[derive(Clone)]
pub struct SearchJob {
    pub board: Board,
    pub limits: SearchLimits,
    pub tt: Arc<TT>,
    pub params: Arc<NetworkParams>,
    pub stop: Arc<AtomicBool>,
    pub nodes: Arc<AtomicU64>,
    pub reports: Arc<Mutex<Vec<WorkerReport>>>,
    pub completed: Arc<AtomicUsize>,
    pub helper_count: usize,
    pub quiet: bool,
}

enum Command {
    Search(Box<SearchJob>),
    NewGame,
    Quit,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WorkerState {
    Idle,
    Searching,
    Finishing,
}

struct WorkerSlot {
    state: Mutex<(WorkerState, Option<Command>)>,
    cv: Condvar,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new((WorkerState::Idle, None)),
            cv: Condvar::new(),
        }
    }

    fn send(&self, command: Command) {
        let mut guard = self.state.lock().unwrap();
        // a worker only accepts commands while idle
        while guard.0 != WorkerState::Idle || guard.1.is_some() {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.1 = Some(command);
        self.cv.notify_all();
    }

    fn wait_idle(&self) {
        let mut guard = self.state.lock().unwrap();
        while guard.0 != WorkerState::Idle || guard.1.is_some() {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

struct Worker {
    slot: Arc<WorkerSlot>,
    handle: Option<JoinHandle<()>>,
}

pub struct ThreadPool {
    workers: Vec<Worker>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        let mut pool = Self {
            workers: Vec::new(),
        };
        pool.set(threads);
        pool
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Adjusts the worker count, joining every existing thread first so
    /// per-thread state is rebuilt from scratch.
    pub fn set(&mut self, threads: usize) {
        self.shutdown();
        for thread_id in 0..threads.max(1) {
            let slot = Arc::new(WorkerSlot::new());
            let worker_slot = Arc::clone(&slot);
            let handle = std::thread::Builder::new()
                .name(format!("tourmaline-worker-{thread_id}"))
                .stack_size(16 * 1024 * 1024)
                .spawn(move || worker_loop(thread_id, &worker_slot))
                .expect("failed to spawn worker thread");
            self.workers.push(Worker {
                slot,
                handle: Some(handle),
            });
        }
    }

    /// Copies the root state to every worker and broadcasts start.
    pub fn start_thinking(&self, job: &SearchJob) {
        {
            let mut reports = job.reports.lock().unwrap();
            reports.clear();
            reports.resize(self.workers.len(), WorkerReport::default());
        }
        job.completed.store(0, Ordering::SeqCst);
        job.stop.store(false, Ordering::SeqCst);
        job.nodes.store(0, Ordering::SeqCst);

        // helpers first, the main worker last so that every report slot
        // exists before anyone can finish
        for worker in self.workers.iter().skip(1) {
            worker.slot.send(Command::Search(Box::new(job.clone())));
        }
        self.workers[0]
            .slot
            .send(Command::Search(Box::new(job.clone())));
    }

    /// Blocks until the main worker has gone back to sleep; helpers are
    /// already accounted for by then.
    pub fn wait_for_search_finished(&self) {
        if let Some(main) = self.workers.first() {
            main.slot.wait_idle();
        }
    }

    /// Blocks until every worker has parked and dropped its job, so
    /// uniquely-owned shared state can be mutated again.
    pub fn wait_all_idle(&self) {
        for worker in &self.workers {
            worker.slot.wait_idle();
        }
    }

    /// Resets every worker's history tables.
    pub fn new_game(&self) {
        for worker in &self.workers {
            worker.slot.send(Command::NewGame);
        }
        for worker in &self.workers {
            worker.slot.wait_idle();
        }
    }

    fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.slot.send(Command::Quit);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        self.workers.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(thread_id: usize, slot: &WorkerSlot) {
    // histories survive from one search to the next
    let mut warm_histories: Option<crate::threadlocal::HistoryStore> = None;

    loop {
        let command = {
            let mut guard = slot.state.lock().unwrap();
            loop {
                if let Some(command) = guard.1.take() {
                    guard.0 = WorkerState::Searching;
                    break command;
                }
                guard = slot.cv.wait(guard).unwrap();
            }
        };

        match command {
            Command::Quit => {
                let mut guard = slot.state.lock().unwrap();
                guard.0 = WorkerState::Idle;
                slot.cv.notify_all();
                return;
            }
            Command::NewGame => {
                if let Some(store) = warm_histories.as_mut() {
                    store.clear();
                }
                let mut guard = slot.state.lock().unwrap();
                guard.0 = WorkerState::Idle;
                slot.cv.notify_all();
            }
            Command::Search(job) => {
                run_search_job(thread_id, &job, slot, &mut warm_histories);
                // release the job (and its shared handles) before
                // declaring idle, so the owner may reclaim them
                drop(job);
                {
                    let mut guard = slot.state.lock().unwrap();
                    guard.0 = WorkerState::Idle;
                    slot.cv.notify_all();
                }
            }
        }
    }
}

fn run_search_job(
    thread_id: usize,
    job: &SearchJob,
    slot: &WorkerSlot,
    warm_histories: &mut Option<crate::threadlocal::HistoryStore>,
) {
    let view = job.tt.view();
    let mut td = ThreadData::new(thread_id, &job.board, view, &job.params);
    if let Some(store) = warm_histories.take() {
        td.install_histories(store);
    }

    let mut info = SearchInfo::new(&job.stop, &job.nodes, job.limits);
    info.quiet = job.quiet || thread_id != 0;

    search::iterative_deepening(&mut td, &info);

    // the search proper is over; the worker is finishing until its
    // result is published and, for the main worker, announced
    {
        let mut guard = slot.state.lock().unwrap();
        guard.0 = WorkerState::Finishing;
        slot.cv.notify_all();
    }

    // publish the result before signalling completion
    {
        let mut reports = job.reports.lock().unwrap();
        reports[thread_id] = WorkerReport {
            best_move: td.best_move,
            ponder_move: td.pv.moves.get(1).copied(),
            score: td.best_score,
            depth: td.completed_depth,
            nodes: td.nodes,
        };
    }

    if thread_id == 0 {
        // the main worker ends the search for everyone, then waits for
        // the helpers' completion signals
        info.stop_now();
        while job.completed.load(Ordering::SeqCst) < job.helper_count {
            std::thread::yield_now();
        }
        let reports = job.reports.lock().unwrap();
        let best = select_best_thread(&reports);
        if !job.quiet {
            let chess960 = CHESS960.load(Ordering::Relaxed);
            match (best.best_move, best.ponder_move) {
                (Some(mv), Some(ponder)) => println!(
                    "bestmove {} ponder {}",
                    mv.display(chess960),
                    ponder.display(chess960),
                ),
                (Some(mv), None) => println!("bestmove {}", mv.display(chess960)),
                (None, _) => println!("bestmove 0000"),
            }
        }
    } else {
        job.completed.fetch_add(1, Ordering::SeqCst);
    }

    *warm_histories = Some(td.take_histories());
}

/// Elects the result to play: any mate beats every non-mate, then the
/// better score at the greater depth, with nodes as the tie-break.
fn select_best_thread(reports: &[WorkerReport]) -> &WorkerReport {
    let mut best = &reports[0];
    for candidate in &reports[1..] {
        if candidate.best_move.is_none() {
            continue;
        }
        if best.best_move.is_none() {
            best = candidate;
            continue;
        }
        let cand_mate = is_mate_score(candidate.score) && candidate.score > 0;
        let best_mate = is_mate_score(best.score) && best.score > 0;
        if cand_mate != best_mate {
            if cand_mate {
                best = candidate;
            }
            continue;
        }
        let cand_key = (candidate.score, candidate.depth, candidate.nodes);
        let best_key = (best.score, best.depth, best.nodes);
        if cand_key > best_key {
            best = candidate;
        }
    }
    best
}
