use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// What `go` asked for. Time controls are reduced to a single deadline
/// here; there is no management policy beyond "stop when told to".
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchLimits {
    pub depth: Option<i32>,
    pub nodes: Option<u64>,
    pub mate: Option<i32>,
    pub movetime: Option<u64>,
    pub time: Option<u64>,
    pub inc: Option<u64>,
    pub infinite: bool,
    pub perft: Option<i32>,
}

impl SearchLimits {
    pub fn depth(depth: i32) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    /// The wall-clock budget implied by the limits, if any.
    pub fn budget(&self) -> Option<Duration> {
        if self.infinite {
            return None;
        }
        if let Some(movetime) = self.movetime {
            return Some(Duration::from_millis(movetime));
        }
        self.time.map(|time| {
            let budget = time / 20 + self.inc.unwrap_or(0) / 2;
            Duration::from_millis(budget.min(time.saturating_sub(50)).max(1))
        })
    }
}

/// Shared bookkeeping for one `go`: the stop flag every worker polls,
/// the global node counter, and the deadline.
pub struct SearchInfo<'a> {
    pub stop: &'a AtomicBool,
    pub nodes: &'a AtomicU64,
    pub limits: SearchLimits,
    pub start: Instant,
    pub deadline: Option<Instant>,
    /// Suppress info output, for internal searches (bench, tests).
    pub quiet: bool,
}

impl<'a> SearchInfo<'a> {
    pub fn new(stop: &'a AtomicBool, nodes: &'a AtomicU64, limits: SearchLimits) -> Self {
        let start = Instant::now();
        Self {
            stop,
            nodes,
            limits,
            start,
            deadline: limits.budget().map(|budget| start + budget),
            quiet: false,
        }
    }

    /// Observed at every node; `SeqCst` so that no new node is expanded
    /// after a stop has been published.
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn stop_now(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Periodic limit check from the main worker: deadline and node
    /// budget both funnel into the one stop flag.
    pub fn check_limits(&self) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.stop_now();
                return;
            }
        }
        if let Some(max_nodes) = self.limits.nodes {
            if self.nodes.load(Ordering::Relaxed) >= max_nodes {
                self.stop_now();
            }
        }
    }

    pub fn add_nodes(&self, n: u64) {
        self.nodes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
