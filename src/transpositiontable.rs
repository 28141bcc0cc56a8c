use std::{
    mem::size_of,
    sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering},
};

use crate::{
    chess::chessmove::Move,
    util::{MINIMUM_MATE_SCORE, VALUE_NONE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bound {
    None = 0,
    Upper = 1,
    Lower = 2,
    Exact = 3,
}

/// Stored depth is biased by this offset so that the quiescence depths
/// down to -6 still fit a byte, and `depth8 == 0` can mean "empty".
pub const DEPTH_ENTRY_OFFSET: i32 = 7;

/// The three low bits of `gen_bound8` hold the bound and the pv flag,
/// so the generation steps in units of eight.
const GENERATION_BITS: u32 = 3;
pub const GENERATION_DELTA: u8 = 1 << GENERATION_BITS;
const GENERATION_CYCLE: i32 = 255 + GENERATION_DELTA as i32;
const GENERATION_MASK: i32 = (0xFF << GENERATION_BITS) & 0xFF;

/// The eight payload bytes of an entry, as packed into one `u64`:
///
/// ```text
/// depth8 | gen_bound8 | move16 | value16 | eval16
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct TTPacked {
    depth8: u8,
    gen_bound8: u8,
    move16: u16,
    value16: i16,
    eval16: i16,
}

impl TTPacked {
    fn from_bits(bits: u64) -> Self {
        #![allow(clippy::cast_possible_truncation)]
        Self {
            depth8: bits as u8,
            gen_bound8: (bits >> 8) as u8,
            move16: (bits >> 16) as u16,
            value16: (bits >> 32) as u16 as i16,
            eval16: (bits >> 48) as u16 as i16,
        }
    }

    fn to_bits(self) -> u64 {
        u64::from(self.depth8)
            | u64::from(self.gen_bound8) << 8
            | u64::from(self.move16) << 16
            | u64::from(self.value16 as u16) << 32
            | u64::from(self.eval16 as u16) << 48
    }

    const fn is_occupied(self) -> bool {
        self.depth8 != 0
    }

    fn bound(self) -> Bound {
        match self.gen_bound8 & 0b11 {
            0 => Bound::None,
            1 => Bound::Upper,
            2 => Bound::Lower,
            _ => Bound::Exact,
        }
    }

    const fn is_pv(self) -> bool {
        self.gen_bound8 & 0b100 != 0
    }

    /// Age relative to the current generation, in internal (x8) units,
    /// correct across generation-counter wraparound.
    fn relative_age(self, generation: u8) -> i32 {
        (GENERATION_CYCLE + i32::from(generation) - i32::from(self.gen_bound8)) & GENERATION_MASK
    }
}

/// What a probe hands back to the search.
///
/// The key and payload are loaded with separate relaxed operations, so
/// the pair may have been written by two different writers. The search
/// must treat the move as advisory and validate it against the current
/// position before use.
#[derive(Debug, Clone, Copy)]
pub struct TTData {
    pub mv: Option<Move>,
    pub value: i32,
    pub eval: i32,
    pub depth: i32,
    pub bound: Bound,
    pub is_pv: bool,
}

impl TTData {
    const fn empty() -> Self {
        Self {
            mv: None,
            value: VALUE_NONE,
            eval: VALUE_NONE,
            depth: -DEPTH_ENTRY_OFFSET,
            bound: Bound::None,
            is_pv: false,
        }
    }
}

/// A handle onto the entry a probe selected, for writing back later.
pub struct TTWriter<'a> {
    key: &'a AtomicU16,
    data: &'a AtomicU64,
}

impl TTWriter<'_> {
    /// Populates the entry, possibly overwriting an old position.
    ///
    /// The previous move is preserved when no new one is supplied for
    /// the same position. The whole entry is replaced when the bound is
    /// exact, the key changed, the new depth is close enough to the old
    /// one, or the old entry is from a previous generation; otherwise
    /// only the refreshed move is written.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        key: u64,
        value: i32,
        is_pv: bool,
        bound: Bound,
        depth: i32,
        mv: Option<Move>,
        eval: i32,
        generation: u8,
        ply: usize,
    ) {
        #![allow(clippy::cast_possible_truncation)]
        let key16 = key as u16;
        let current_key = self.key.load(Ordering::Relaxed);
        let mut current = TTPacked::from_bits(self.data.load(Ordering::Relaxed));

        let mut update_move = false;
        if mv.is_some() || key16 != current_key {
            update_move = true;
            current.move16 = mv.map_or(0, Move::inner);
        }

        let old_depth = i32::from(current.depth8) - DEPTH_ENTRY_OFFSET;
        if bound == Bound::Exact
            || key16 != current_key
            || depth + 2 * i32::from(is_pv) > old_depth - 4
            || current.relative_age(generation) != 0
        {
            debug_assert!(depth > -DEPTH_ENTRY_OFFSET);
            debug_assert!(depth < 256 - DEPTH_ENTRY_OFFSET);

            let value = normalise_mate_score(value, ply);
            current.depth8 = (depth + DEPTH_ENTRY_OFFSET) as u8;
            current.gen_bound8 = generation | u8::from(is_pv) << 2 | bound as u8;
            current.value16 = value as i16;
            current.eval16 = eval as i16;

            self.key.store(key16, Ordering::Relaxed);
            self.data.store(current.to_bits(), Ordering::Relaxed);
            return;
        }

        if update_move {
            self.data.store(current.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Three entries, 32 bytes, one half of a cache line.
#[repr(C, align(32))]
struct Cluster {
    keys: [AtomicU16; 3],
    data: [AtomicU64; 3],
}

const _CLUSTER_SIZE: () = assert!(size_of::<Cluster>() == 32, "suboptimal cluster size");

pub struct TT {
    /// Anonymous mapping backing the clusters; page-aligned, and advised
    /// towards huge pages where the platform offers them.
    memory: Option<memmap2::MmapMut>,
    cluster_count: usize,
    generation: AtomicU8,
}

#[derive(Clone, Copy)]
pub struct TTView<'a> {
    table: &'a [Cluster],
    generation: u8,
}

impl TT {
    pub const fn new() -> Self {
        Self {
            memory: None,
            cluster_count: 0,
            generation: AtomicU8::new(0),
        }
    }

    /// Resizes the table to `mb` mebibytes and zeroes it across the
    /// given number of helper threads. Allocation failure is fatal: an
    /// engine without a hash table cannot search.
    pub fn resize(&mut self, mb: usize, threads: usize) {
        let bytes = mb * 1024 * 1024;
        self.cluster_count = bytes / size_of::<Cluster>();
        self.memory = None;

        let mmap = memmap2::MmapOptions::new()
            .len(self.cluster_count * size_of::<Cluster>())
            .map_anon()
            .unwrap_or_else(|e| {
                eprintln!("info string failed to allocate {mb} MB for the transposition table: {e}");
                std::process::exit(1);
            });
        #[cfg(target_os = "linux")]
        {
            // large pages cut TLB pressure; losing the advice is fine
            let _ = mmap.advise(memmap2::Advice::HugePage);
        }
        assert_eq!(mmap.as_ptr().align_offset(size_of::<Cluster>()), 0);
        self.memory = Some(mmap);
        self.clear(threads);
    }

    /// Zeroes the whole table, splitting the work over `threads`.
    pub fn clear(&self, threads: usize) {
        self.generation.store(0, Ordering::Relaxed);
        let table = self.table();
        let chunk_size = table.len() / threads.max(1) + 1;
        std::thread::scope(|s| {
            for chunk in table.chunks(chunk_size) {
                s.spawn(move || {
                    for cluster in chunk {
                        for i in 0..3 {
                            cluster.keys[i].store(0, Ordering::Relaxed);
                            cluster.data[i].store(0, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
    }

    fn table(&self) -> &[Cluster] {
        self.memory.as_ref().map_or(&[], |memory| {
            // SAFETY: the mapping is zero-initialised and page-aligned,
            // all-zeroes is a valid Cluster, and the length was chosen
            // as an exact multiple of the cluster size.
            unsafe {
                std::slice::from_raw_parts(memory.as_ptr().cast::<Cluster>(), self.cluster_count)
            }
        })
    }

    /// Ages the table at the start of a new search; stepping by the
    /// delta leaves the bound/pv bits of stored entries meaningful.
    pub fn new_search(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation
            .store(generation.wrapping_add(GENERATION_DELTA), Ordering::Relaxed);
    }

    pub fn view(&self) -> TTView<'_> {
        TTView {
            table: self.table(),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.cluster_count * size_of::<Cluster>()
    }
}

impl<'a> TTView<'a> {
    /// Maps a key uniformly onto the clusters with a 64-bit
    /// multiply-high, avoiding the modulo.
    fn cluster_index(&self, key: u64) -> usize {
        #![allow(clippy::cast_possible_truncation)]
        ((u128::from(key) * self.table.len() as u128) >> 64) as usize
    }

    pub const fn generation(&self) -> u8 {
        self.generation
    }

    /// Looks up `key`. On a hit, returns the (possibly torn) stored
    /// data; on a miss, the returned writer points at the least
    /// valuable entry of the cluster, chosen by depth minus age.
    ///
    /// The writer borrows the table memory itself, not this view, so a
    /// search thread can keep it across recursion.
    pub fn probe(self, key: u64, ply: usize) -> (bool, TTData, TTWriter<'a>) {
        #![allow(clippy::cast_possible_truncation)]
        let cluster = &self.table[self.cluster_index(key)];
        let key16 = key as u16;

        for i in 0..3 {
            if cluster.keys[i].load(Ordering::Relaxed) == key16 {
                // between this load and the payload load a writer may
                // intervene; the copy below is final but possibly
                // self-inconsistent, which the caller must tolerate.
                let data = TTPacked::from_bits(cluster.data[i].load(Ordering::Relaxed));
                return (
                    data.is_occupied(),
                    TTData {
                        mv: Move::from_raw(data.move16),
                        value: reconstruct_mate_score(i32::from(data.value16), ply),
                        eval: i32::from(data.eval16),
                        depth: i32::from(data.depth8) - DEPTH_ENTRY_OFFSET,
                        bound: data.bound(),
                        is_pv: data.is_pv(),
                    },
                    TTWriter {
                        key: &cluster.keys[i],
                        data: &cluster.data[i],
                    },
                );
            }
        }

        let mut replace_idx = 0;
        for i in 1..3 {
            let current = TTPacked::from_bits(cluster.data[replace_idx].load(Ordering::Relaxed));
            let candidate = TTPacked::from_bits(cluster.data[i].load(Ordering::Relaxed));
            if i32::from(current.depth8) - current.relative_age(self.generation)
                > i32::from(candidate.depth8) - candidate.relative_age(self.generation)
            {
                replace_idx = i;
            }
        }

        (
            false,
            TTData::empty(),
            TTWriter {
                key: &cluster.keys[replace_idx],
                data: &cluster.data[replace_idx],
            },
        )
    }

    /// Software-prefetches the cluster for `key` so that the loads in
    /// `probe` overlap with memory latency.
    pub fn prefetch(&self, key: u64) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: the pointer is in bounds, and prefetching cannot fault.
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            if !self.table.is_empty() {
                let cluster = &self.table[self.cluster_index(key)];
                _mm_prefetch(std::ptr::from_ref::<Cluster>(cluster).cast::<i8>(), _MM_HINT_T0);
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = key;
    }

    /// An estimate of table occupancy in permille, sampling the first
    /// thousand clusters and counting entries no older than `max_age`
    /// generations.
    pub fn hashfull(&self, max_age: i32) -> usize {
        let max_age_internal = max_age << GENERATION_BITS;
        let mut count = 0;
        for cluster in self.table.iter().take(1000) {
            for i in 0..3 {
                let entry = TTPacked::from_bits(cluster.data[i].load(Ordering::Relaxed));
                if entry.is_occupied() && entry.relative_age(self.generation) <= max_age_internal {
                    count += 1;
                }
            }
        }
        count / 3
    }
}

/// Mate scores are stored relative to the node, not the root, so they
/// stay valid when found again at a different height.
const fn normalise_mate_score(mut score: i32, ply: usize) -> i32 {
    #![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    if score >= MINIMUM_MATE_SCORE {
        score += ply as i32;
    } else if score <= -MINIMUM_MATE_SCORE {
        score -= ply as i32;
    }
    score
}

const fn reconstruct_mate_score(mut score: i32, ply: usize) -> i32 {
    #![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    if score >= MINIMUM_MATE_SCORE {
        score -= ply as i32;
    } else if score <= -MINIMUM_MATE_SCORE {
        score += ply as i32;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::types::Square;

    #[test]
    fn packed_roundtrip() {
        let packed = TTPacked {
            depth8: 0x13,
            gen_bound8: 0b1010_1111,
            move16: Move::new(Square::E2, Square::E4).inner(),
            value16: -1234,
            eval16: 0x7FEE,
        };
        assert_eq!(TTPacked::from_bits(packed.to_bits()), packed);
    }

    #[test]
    fn store_and_probe_roundtrip() {
        let mut tt = TT::new();
        tt.resize(1, 1);
        let view = tt.view();
        let key = 0xDEAD_BEEF_CAFE_F00D;
        let mv = Move::new(Square::G1, Square::F3);

        let (hit, _, writer) = view.probe(key, 0);
        assert!(!hit);
        writer.write(key, 42, true, Bound::Exact, 9, Some(mv), 37, view.generation(), 0);

        let (hit, data, _) = view.probe(key, 0);
        assert!(hit);
        assert_eq!(data.mv, Some(mv));
        assert_eq!(data.value, 42);
        assert_eq!(data.eval, 37);
        assert_eq!(data.depth, 9);
        assert_eq!(data.bound, Bound::Exact);
        assert!(data.is_pv);
    }

    #[test]
    fn same_write_twice_is_idempotent() {
        let mut tt = TT::new();
        tt.resize(1, 1);
        let view = tt.view();
        let key = 0x0123_4567_89AB_CDEF;
        let mv = Move::new(Square::D2, Square::D4);

        let (_, _, writer) = view.probe(key, 0);
        writer.write(key, -300, false, Bound::Lower, 5, Some(mv), -250, view.generation(), 0);
        let (_, first, _) = view.probe(key, 0);
        let (_, _, writer) = view.probe(key, 0);
        writer.write(key, -300, false, Bound::Lower, 5, Some(mv), -250, view.generation(), 0);
        let (_, second, _) = view.probe(key, 0);

        assert_eq!(first.value, second.value);
        assert_eq!(first.eval, second.eval);
        assert_eq!(first.depth, second.depth);
        assert_eq!(first.mv, second.mv);
    }

    #[test]
    fn exact_bound_always_replaces() {
        let mut tt = TT::new();
        tt.resize(1, 1);
        let view = tt.view();
        let key = 0xFFFF_0000_FFFF_0000;

        let (_, _, writer) = view.probe(key, 0);
        writer.write(key, 10, false, Bound::Lower, 100, None, 10, view.generation(), 0);
        // a shallow exact entry still overwrites the deep lower bound
        let (_, _, writer) = view.probe(key, 0);
        writer.write(key, 77, false, Bound::Exact, 1, None, 77, view.generation(), 0);
        let (hit, data, _) = view.probe(key, 0);
        assert!(hit);
        assert_eq!(data.value, 77);
        assert_eq!(data.depth, 1);
        assert_eq!(data.bound, Bound::Exact);
    }

    #[test]
    fn fresh_table_reads_empty_hashfull() {
        let mut tt = TT::new();
        tt.resize(16, 2);
        assert_eq!(tt.view().hashfull(0), 0);
    }

    #[test]
    fn mate_scores_are_ply_relative() {
        let mut tt = TT::new();
        tt.resize(1, 1);
        let view = tt.view();
        let key = 0x1122_3344_5566_7788;
        let mate_at_5 = crate::util::mate_in(5);

        let (_, _, writer) = view.probe(key, 3);
        writer.write(key, mate_at_5, false, Bound::Exact, 10, None, 0, view.generation(), 3);
        // probing from a different height re-relativises the score
        let (hit, data, _) = view.probe(key, 1);
        assert!(hit);
        assert_eq!(data.value, mate_at_5 + 3 - 1);
    }
}
