//! Ceiling divisions shared by the geometry and the wavelet recursion.

/// `ceil(a / b)` for unsigned operands.
#[inline]
pub fn ceil_div(a: u64, b: u64) -> u64 {
    debug_assert!(b > 0);
    a.div_ceil(b)
}

/// `ceil(a / 2^shift)`.
#[inline]
pub fn ceil_div_pow2(a: u64, shift: u32) -> u64 {
    ceil_div(a, 1u64 << shift)
}

/// `ceil((coordinate - band_offset * 2^(level - 1)) / 2^level)`, the subband edge formula of
/// ISO/IEC 15444-1 B-15. A zero `band_offset` selects the low-pass edge; any level with a
/// non-zero offset must be at least 1. Numerators below zero clamp to zero, which is what the
/// formula yields for every non-negative coordinate.
#[inline]
pub fn band_edge(coordinate: u64, level: u32, band_offset: u64) -> u64 {
    if band_offset == 0 {
        return ceil_div_pow2(coordinate, level);
    }
    debug_assert!(level >= 1);
    let half = 1u64 << (level - 1);
    ceil_div_pow2(coordinate.saturating_sub(half), level)
}

/// `[index * step, (index + 1) * step)` clipped to `limit`, the span of one cell of a
/// regular grid laid over `[0, limit)`.
#[inline]
pub fn grid_span(index: u32, step: u32, limit: u32) -> (u32, u32) {
    let start = (index as u64 * step as u64).min(limit as u64);
    let end = (start + step as u64).min(limit as u64);
    (start as u32, end as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(0, 4), 0);
        assert_eq!(ceil_div(1, 4), 1);
        assert_eq!(ceil_div(8, 4), 2);
        assert_eq!(ceil_div(9, 4), 3);
        assert_eq!(ceil_div_pow2(255, 4), 16);
        assert_eq!(ceil_div_pow2(7, 0), 7);
    }

    #[test]
    fn test_grid_span() {
        assert_eq!(grid_span(0, 64, 100), (0, 64));
        assert_eq!(grid_span(1, 64, 100), (64, 100));
        assert_eq!(grid_span(2, 64, 100), (100, 100));
        // Cells whose end passes u32::MAX still clip to the limit.
        assert_eq!(grid_span(1, 3_000_000_000, u32::MAX), (3_000_000_000, u32::MAX));
        assert_eq!(grid_span(u32::MAX - 1, 64, u32::MAX), (u32::MAX, u32::MAX));
    }

    #[test]
    fn test_band_edge_high_pass() {
        // Level 1 high band of [0, 7): ceil((7 - 1) / 2) - ceil((0 - 1) / 2) = 3.
        assert_eq!(band_edge(7, 1, 1) - band_edge(0, 1, 1), 3);
        // Low band takes the remaining 4 samples.
        assert_eq!(band_edge(7, 1, 0) - band_edge(0, 1, 0), 4);
        // Odd origin: [3, 10) splits 3 low / 4 high.
        assert_eq!(band_edge(10, 1, 0) - band_edge(3, 1, 0), 3);
        assert_eq!(band_edge(10, 1, 1) - band_edge(3, 1, 1), 4);
    }

    #[test]
    fn test_band_edges_cover_parent() {
        for level in 1..6u32 {
            for t0 in 0..70u64 {
                for t1 in t0..t0 + 70 {
                    let parent = ceil_div_pow2(t1, level - 1) - ceil_div_pow2(t0, level - 1);
                    let low = band_edge(t1, level, 0) - band_edge(t0, level, 0);
                    let high = band_edge(t1, level, 1) - band_edge(t0, level, 1);
                    assert_eq!(low + high, parent, "level {level} [{t0}, {t1})");
                }
            }
        }
    }
}
