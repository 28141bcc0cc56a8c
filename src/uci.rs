//! The UCI text interface: a reader thread feeding a channel, a command
//! loop that owns the engine state, and the option registry.

use std::{
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
};

use crate::{
    chess::{board::Board, fen::Fen, CHESS960},
    errors::{GoParseError, PositionParseError, SetOptionParseError, UciError},
    nnue::{accumulator::NnueState, network::NetworkParams},
    perft,
    searchinfo::SearchLimits,
    threadpool::{SearchJob, ThreadPool},
    transpositiontable::TT,
};

use crate::nnue::network::DEFAULT_NET_NAME;

pub static NAME: &str = "Tourmaline";
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

const HASH_DEFAULT: usize = 16;
const HASH_MAX: usize = 1 << 20;
const THREADS_MAX: usize = 512;

struct Engine {
    board: Board,
    tt: Arc<TT>,
    params: Option<Arc<NetworkParams>>,
    pool: ThreadPool,
    stop: Arc<AtomicBool>,
    nodes: Arc<AtomicU64>,
    reports: Arc<Mutex<Vec<crate::threadpool::WorkerReport>>>,
    completed: Arc<AtomicUsize>,
    hash_mb: usize,
    threads: usize,
    eval_file: String,
    /// Directory the host may supply for network lookup, after the CWD.
    net_root: Option<PathBuf>,
}

impl Engine {
    fn new() -> Self {
        Self {
            board: Board::default(),
            tt: Arc::new(TT::new()),
            params: None,
            pool: ThreadPool::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            nodes: Arc::new(AtomicU64::new(0)),
            reports: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicUsize::new(0)),
            hash_mb: HASH_DEFAULT,
            threads: 1,
            eval_file: DEFAULT_NET_NAME.to_string(),
            net_root: std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(PathBuf::from)),
        }
    }

    fn set_tt_size(&mut self, mb: usize) {
        self.pool.wait_all_idle();
        self.hash_mb = mb;
        let threads = self.threads;
        Arc::get_mut(&mut self.tt)
            .expect("resizing the hash table while a search is running")
            .resize(mb, threads);
    }

    fn set_threads(&mut self, threads: usize) {
        self.threads = threads;
        self.pool.set(threads);
    }

    /// Loads the configured network; a missing or malformed file is
    /// fatal, because an engine with wrong weights plays silently
    /// wrong moves.
    fn ensure_network(&mut self) {
        if self.params.is_some() {
            return;
        }
        match NetworkParams::load(&self.eval_file, self.net_root.as_deref()) {
            Ok((params, description)) => {
                if !description.is_empty() {
                    println!("info string loaded network: {description}");
                }
                self.params = Some(Arc::from(params));
            }
            Err(e) => {
                println!("info string FATAL: {e:#}");
                std::process::exit(1);
            }
        }
    }

    fn ensure_tt(&mut self) {
        if self.tt.size_bytes() == 0 {
            self.set_tt_size(self.hash_mb);
        }
    }

    fn load_network(&mut self, name: &str) {
        self.eval_file = name.to_string();
        self.params = None;
    }

    fn save_network(&mut self, path: &str) {
        self.ensure_network();
        let params = self.params.as_ref().unwrap();
        let description = format!("{NAME} {VERSION} network");
        match params.save(std::path::Path::new(path), &description) {
            Ok(()) => println!("info string wrote network to {path}"),
            Err(e) => println!("info string failed to write network: {e:#}"),
        }
    }

    fn go(&mut self, limits: SearchLimits) {
        self.pool.wait_for_search_finished();
        self.ensure_network();
        self.ensure_tt();
        self.tt.new_search();

        let job = SearchJob {
            board: self.board.clone(),
            limits,
            tt: Arc::clone(&self.tt),
            params: Arc::clone(self.params.as_ref().unwrap()),
            stop: Arc::clone(&self.stop),
            nodes: Arc::clone(&self.nodes),
            reports: Arc::clone(&self.reports),
            completed: Arc::clone(&self.completed),
            helper_count: self.pool.len() - 1,
            quiet: false,
        };
        self.pool.start_thinking(&job);
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.pool.wait_for_search_finished();
    }

    fn new_game(&mut self) {
        self.stop();
        self.ensure_tt();
        self.tt.clear(self.threads);
        self.pool.new_game();
        self.board.set_startpos();
    }

    fn trace_eval(&mut self) {
        self.ensure_network();
        let params = self.params.as_ref().unwrap();
        let mut nnue = NnueState::new();
        nnue.reset(&self.board, params);
        print!("{}", params.trace(&self.board, &mut nnue));
        let psqt_only = params.evaluate_psqt_only(&self.board, &mut nnue);
        let value = params.evaluate(&self.board, &mut nnue, false);
        println!("psqt-only evaluation: {psqt_only} cp");
        println!("final evaluation: {value} cp (from the side to move)");
    }
}

fn stdin_reader() -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let mut line = String::with_capacity(128);
            while std::io::stdin().read_line(&mut line).is_ok_and(|n| n != 0) {
                let cmd = line.trim();
                if !cmd.is_empty() && sender.send(cmd.to_owned()).is_err() {
                    break;
                }
                line.clear();
            }
        })
        .expect("failed to start the stdin reader thread");
    receiver
}

fn print_uci_response() {
    println!("id name {NAME} {VERSION}");
    println!("id author the {NAME} developers");
    println!("option name Hash type spin default {HASH_DEFAULT} min 1 max {HASH_MAX}");
    println!("option name Threads type spin default 1 max {THREADS_MAX} min 1");
    println!("option name UCI_Chess960 type check default false");
    println!("option name EvalFile type string default {DEFAULT_NET_NAME}");
    println!("uciok");
}

pub fn main_loop() -> anyhow::Result<()> {
    let mut engine = Engine::new();
    let stdin = stdin_reader();

    loop {
        std::io::stdout().flush()?;
        let Ok(line) = stdin.recv() else {
            break;
        };
        let input = line.trim();

        let res: Result<(), UciError> = match input {
            "uci" => {
                print_uci_response();
                Ok(())
            }
            "isready" => {
                engine.ensure_network();
                engine.ensure_tt();
                println!("readyok");
                Ok(())
            }
            "ucinewgame" => {
                engine.new_game();
                Ok(())
            }
            "stop" => {
                engine.stop();
                Ok(())
            }
            "quit" => break,
            "eval" => {
                engine.trace_eval();
                Ok(())
            }
            input if input.starts_with("setoption") => parse_setoption(input, &mut engine),
            input if input.starts_with("position") => parse_position(input, &mut engine.board),
            input if input.starts_with("go") => parse_go(input, &mut engine),
            input if input.starts_with("export_net") => {
                let path = input
                    .split_ascii_whitespace()
                    .nth(1)
                    .unwrap_or(DEFAULT_NET_NAME);
                engine.save_network(path);
                Ok(())
            }
            other => Err(UciError::UnknownCommand(other.to_string())),
        };

        if let Err(e) = res {
            // parse failures are reported and leave the engine untouched
            println!("info string error: {e}");
        }
    }

    engine.stop();
    Ok(())
}

fn parse_position(text: &str, board: &mut Board) -> Result<(), UciError> {
    let mut parts = text.split_ascii_whitespace();
    parts.next(); // "position"

    let mut new_board = Board::empty();
    match parts.next() {
        Some("startpos") => {
            new_board.set_startpos();
            match parts.next() {
                Some("moves") | None => {}
                Some(other) => {
                    return Err(PositionParseError::InvalidStartposSuffix(other.into()).into())
                }
            }
        }
        Some("fen") => {
            let mut fen = String::new();
            for part in parts.by_ref() {
                if part == "moves" {
                    break;
                }
                fen.push_str(part);
                fen.push(' ');
            }
            let parsed = Fen::parse(fen.trim()).map_err(PositionParseError::Fen)?;
            new_board.set_from_fen(&parsed);
        }
        Some("frc") => {
            let idx: usize = parts
                .next()
                .and_then(|p| p.parse().ok())
                .filter(|&i| i < 960)
                .ok_or_else(|| PositionParseError::UnknownPositionSpecifier("frc".into()))?;
            new_board.set_frc_idx(idx);
            match parts.next() {
                Some("moves") | None => {}
                Some(other) => {
                    return Err(PositionParseError::InvalidStartposSuffix(other.into()).into())
                }
            }
        }
        Some("dfrc") => {
            let idx: usize = parts
                .next()
                .and_then(|p| p.parse().ok())
                .filter(|&i| i < 960 * 960)
                .ok_or_else(|| PositionParseError::UnknownPositionSpecifier("dfrc".into()))?;
            new_board.set_dfrc_idx(idx);
            match parts.next() {
                Some("moves") | None => {}
                Some(other) => {
                    return Err(PositionParseError::InvalidStartposSuffix(other.into()).into())
                }
            }
        }
        Some(other) => {
            return Err(PositionParseError::UnknownPositionSpecifier(other.into()).into())
        }
        None => return Err(PositionParseError::MissingPositionSpecifier.into()),
    }

    for move_str in parts {
        let m = new_board
            .parse_uci(move_str)
            .map_err(PositionParseError::Move)?;
        new_board.make_move(m);
    }
    new_board.zero_height();
    *board = new_board;
    Ok(())
}

fn parse_go(text: &str, engine: &mut Engine) -> Result<(), UciError> {
    let mut limits = SearchLimits::default();
    let our_time = if engine.board.turn() == crate::chess::piece::Colour::White {
        ("wtime", "winc")
    } else {
        ("btime", "binc")
    };

    let mut parts = text.split_ascii_whitespace();
    parts.next(); // "go"

    while let Some(part) = parts.next() {
        match part {
            "depth" => limits.depth = Some(parse_value("depth", parts.next())?),
            "nodes" => limits.nodes = Some(parse_value("nodes", parts.next())?),
            "mate" => limits.mate = Some(parse_value("mate", parts.next())?),
            "movetime" => limits.movetime = Some(parse_value("movetime", parts.next())?),
            "perft" => limits.perft = Some(parse_value("perft", parts.next())?),
            "infinite" => limits.infinite = true,
            t if t == our_time.0 => limits.time = Some(parse_value("time", parts.next())?),
            t if t == our_time.1 => limits.inc = Some(parse_value("inc", parts.next())?),
            // the opponent's clock does not constrain us
            "wtime" | "btime" | "winc" | "binc" | "movestogo" | "ponder" => {
                let _ = parts.next();
            }
            other => return Err(GoParseError::UnknownSubcommand(other.to_string()).into()),
        }
    }

    if let Some(depth) = limits.perft {
        // perft runs synchronously on the command thread
        let nodes = perft::divide(&mut engine.board, depth);
        println!("nodes searched: {nodes}");
        return Ok(());
    }

    engine.go(limits);
    Ok(())
}

fn parse_value<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    param: &'static str,
    part: Option<&str>,
) -> Result<T, GoParseError> {
    part.ok_or(GoParseError::MissingValue(param))?
        .parse()
        .map_err(|source| GoParseError::InvalidValue { param, source })
}

fn parse_setoption(text: &str, engine: &mut Engine) -> Result<(), UciError> {
    let mut parts = text.split_ascii_whitespace();
    parts.next(); // "setoption"
    if parts.next() != Some("name") {
        return Err(SetOptionParseError::MissingNameKeyword.into());
    }
    let mut name = String::new();
    for part in parts.by_ref() {
        if part == "value" {
            break;
        }
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(part);
    }
    if name.is_empty() {
        return Err(SetOptionParseError::MissingOptionName.into());
    }
    let value = parts.collect::<Vec<_>>().join(" ");

    let spin = |lo: i64, hi: i64| -> Result<i64, SetOptionParseError> {
        let parsed: i64 =
            value
                .parse()
                .map_err(|_| SetOptionParseError::InvalidValue {
                    name: name.clone(),
                    value: value.clone(),
                })?;
        if !(lo..=hi).contains(&parsed) {
            return Err(SetOptionParseError::ValueOutOfRange {
                name: name.clone(),
                lo,
                hi,
                got: parsed,
            });
        }
        Ok(parsed)
    };

    match name.as_str() {
        "Hash" => {
            let mb = spin(1, HASH_MAX as i64)?;
            engine.set_tt_size(mb as usize);
        }
        "Threads" => {
            let threads = spin(1, THREADS_MAX as i64)?;
            engine.set_threads(threads as usize);
        }
        "UCI_Chess960" => {
            let enabled = value.parse::<bool>().map_err(|_| {
                SetOptionParseError::InvalidValue {
                    name: name.clone(),
                    value: value.clone(),
                }
            })?;
            CHESS960.store(enabled, Ordering::SeqCst);
        }
        "EvalFile" => {
            if value.is_empty() {
                return Err(SetOptionParseError::MissingOptionValue(name).into());
            }
            engine.load_network(&value);
        }
        _ => return Err(SetOptionParseError::UnknownOption(name).into()),
    }
    Ok(())
}

/// Fixed-depth sweep over a bench suite, for quick speed and
/// reproducibility checks.
pub fn bench(depth: i32) -> anyhow::Result<()> {
    let mut engine = Engine::new();
    engine.ensure_network();
    engine.set_tt_size(16);

    let start = std::time::Instant::now();
    let mut total_nodes = 0u64;
    for fen in BENCH_FENS {
        let parsed = Fen::parse(fen).expect("bench fen is broken");
        engine.board.set_from_fen(&parsed);
        engine.tt.clear(1);

        let job = SearchJob {
            board: engine.board.clone(),
            limits: SearchLimits::depth(depth),
            tt: Arc::clone(&engine.tt),
            params: Arc::clone(engine.params.as_ref().unwrap()),
            stop: Arc::clone(&engine.stop),
            nodes: Arc::clone(&engine.nodes),
            reports: Arc::clone(&engine.reports),
            completed: Arc::clone(&engine.completed),
            helper_count: 0,
            quiet: true,
        };
        engine.pool.start_thinking(&job);
        engine.pool.wait_for_search_finished();
        total_nodes += engine.nodes.load(Ordering::Relaxed);
    }
    let elapsed = start.elapsed();
    let nps = total_nodes as u128 * 1000 / elapsed.as_millis().max(1);
    println!("{total_nodes} nodes {nps} nps");
    Ok(())
}

const BENCH_FENS: &[&str] = &[
    Board::STARTING_FEN,
    "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
    "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
    "r3k2r/Pppp1ppp/1b3nbN/nP6/BBP1P3/q4N2/Pp1P2PP/R2Q1RK1 w kq - 0 1",
    "rnbq1k1r/pp1Pbppp/2p5/8/2B5/8/PPP1NnPP/RNBQK2R w KQ - 1 8",
    "r4rk1/1pp1qppp/p1np1n2/2b1p1B1/2B1P1b1/P1NP1N2/1PP1QPPP/R4RK1 w - - 0 10",
];
