//! Thin SIMD wrapper for the accumulator tile loops.
//!
//! The operations used on accumulator rows are exact integer adds and
//! subtracts, so the vector and scalar paths are bit-identical by
//! construction; the backend only changes how many lanes move per step.

use super::{Align64, INPUT_DIMS, L1_SIZE};

#[derive(Clone, Copy)]
pub struct Vector16 {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    data: std::arch::x86_64::__m256i,
    #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
    data: i16,
}

impl Vector16 {
    pub const COUNT: usize = std::mem::size_of::<Self>() / std::mem::size_of::<i16>();

    #[inline]
    unsafe fn load_at(memory: &Align64<[i16; L1_SIZE]>, start_idx: usize) -> Self {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
        {
            Self {
                data: std::arch::x86_64::_mm256_load_si256(memory.0.as_ptr().add(start_idx).cast()),
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
        {
            Self {
                data: *memory.0.get_unchecked(start_idx),
            }
        }
    }

    #[inline]
    unsafe fn store_at(memory: &mut Align64<[i16; L1_SIZE]>, value: Self, start_idx: usize) {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
        {
            std::arch::x86_64::_mm256_store_si256(
                memory.0.as_mut_ptr().add(start_idx).cast(),
                value.data,
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
        {
            *memory.0.get_unchecked_mut(start_idx) = value.data;
        }
    }

    #[inline]
    unsafe fn add(a: Self, b: Self) -> Self {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
        {
            Self {
                data: std::arch::x86_64::_mm256_add_epi16(a.data, b.data),
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
        {
            Self {
                data: a.data.wrapping_add(b.data),
            }
        }
    }

    #[inline]
    unsafe fn sub(a: Self, b: Self) -> Self {
        #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
        {
            Self {
                data: std::arch::x86_64::_mm256_sub_epi16(a.data, b.data),
            }
        }
        #[cfg(not(all(target_arch = "x86_64", target_feature = "avx2")))]
        {
            Self {
                data: a.data.wrapping_sub(b.data),
            }
        }
    }
}

/// The accumulator row is processed in tiles of this many registers:
/// each tile is loaded once, diffed against every changed feature
/// column, and stored once.
pub const NUM_REGS: usize = 8;
const TILE_SIZE: usize = NUM_REGS * Vector16::COUNT;

const _TILING_DIVIDES: () = assert!(L1_SIZE % TILE_SIZE == 0);

/// Reinterprets a weight column as an aligned row. The feature-major
/// weight layout keeps every column 64-byte aligned.
fn column(weights: &Align64<[i16; INPUT_DIMS * L1_SIZE]>, feature: usize) -> &Align64<[i16; L1_SIZE]> {
    let slice = &weights.0[feature * L1_SIZE..feature * L1_SIZE + L1_SIZE];
    let ptr = slice.as_ptr();
    assert_eq!(ptr.align_offset(64), 0);
    // SAFETY: the slice is exactly L1_SIZE long and 64-byte aligned.
    #[allow(clippy::cast_ptr_alignment)]
    unsafe {
        &*ptr.cast()
    }
}

/// `dst = src + Σ weights[adds] − Σ weights[subs]`, tiled.
pub fn apply_diff(
    src: &Align64<[i16; L1_SIZE]>,
    dst: &mut Align64<[i16; L1_SIZE]>,
    weights: &Align64<[i16; INPUT_DIMS * L1_SIZE]>,
    adds: &[usize],
    subs: &[usize],
) {
    // SAFETY: all indices stay below L1_SIZE, which divides into tiles.
    unsafe {
        for tile in 0..L1_SIZE / TILE_SIZE {
            let base = tile * TILE_SIZE;
            let mut regs = [Vector16::load_at(src, base); NUM_REGS];
            for (r, reg) in regs.iter_mut().enumerate() {
                *reg = Vector16::load_at(src, base + r * Vector16::COUNT);
            }
            for &add in adds {
                let col = column(weights, add);
                for (r, reg) in regs.iter_mut().enumerate() {
                    *reg = Vector16::add(*reg, Vector16::load_at(col, base + r * Vector16::COUNT));
                }
            }
            for &sub in subs {
                let col = column(weights, sub);
                for (r, reg) in regs.iter_mut().enumerate() {
                    *reg = Vector16::sub(*reg, Vector16::load_at(col, base + r * Vector16::COUNT));
                }
            }
            for (r, reg) in regs.iter().enumerate() {
                Vector16::store_at(dst, *reg, base + r * Vector16::COUNT);
            }
        }
    }
}

/// In-place variant used by the king-bucket refresh cache.
pub fn apply_diff_inplace(
    acc: &mut Align64<[i16; L1_SIZE]>,
    weights: &Align64<[i16; INPUT_DIMS * L1_SIZE]>,
    adds: &[usize],
    subs: &[usize],
) {
    // SAFETY: as for `apply_diff`.
    unsafe {
        for tile in 0..L1_SIZE / TILE_SIZE {
            let base = tile * TILE_SIZE;
            let mut regs = [Vector16::load_at(acc, base); NUM_REGS];
            for (r, reg) in regs.iter_mut().enumerate() {
                *reg = Vector16::load_at(acc, base + r * Vector16::COUNT);
            }
            for &add in adds {
                let col = column(weights, add);
                for (r, reg) in regs.iter_mut().enumerate() {
                    *reg = Vector16::add(*reg, Vector16::load_at(col, base + r * Vector16::COUNT));
                }
            }
            for &sub in subs {
                let col = column(weights, sub);
                for (r, reg) in regs.iter_mut().enumerate() {
                    *reg = Vector16::sub(*reg, Vector16::load_at(col, base + r * Vector16::COUNT));
                }
            }
            for (r, reg) in regs.iter().enumerate() {
                Vector16::store_at(acc, *reg, base + r * Vector16::COUNT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiled_diff_matches_scalar_reference() {
        // SAFETY: zeroed integer arrays are valid.
        let mut weights: Box<Align64<[i16; INPUT_DIMS * L1_SIZE]>> =
            unsafe { crate::util::boxed_zeroed() };
        for (i, w) in weights.0.iter_mut().enumerate() {
            *w = (i % 251) as i16 - 125;
        }
        // SAFETY: as above.
        let mut src: Box<Align64<[i16; L1_SIZE]>> = unsafe { crate::util::boxed_zeroed() };
        for (i, v) in src.0.iter_mut().enumerate() {
            *v = (i % 97) as i16 - 48;
        }
        let adds = [3usize, 777, 2048];
        let subs = [5usize, 901];

        let mut expected = src.clone();
        for &f in &adds {
            for j in 0..L1_SIZE {
                expected.0[j] = expected.0[j].wrapping_add(weights.0[f * L1_SIZE + j]);
            }
        }
        for &f in &subs {
            for j in 0..L1_SIZE {
                expected.0[j] = expected.0[j].wrapping_sub(weights.0[f * L1_SIZE + j]);
            }
        }

        // SAFETY: as above.
        let mut dst: Box<Align64<[i16; L1_SIZE]>> = unsafe { crate::util::boxed_zeroed() };
        apply_diff(&src, &mut dst, &weights, &adds, &subs);
        assert_eq!(dst.0, expected.0);

        apply_diff_inplace(&mut src, &weights, &adds, &subs);
        assert_eq!(src.0, expected.0);
    }
}
