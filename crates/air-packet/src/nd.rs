//! Four-level strided transfer geometry.
//!
//! An nd-memcpy moves `dim0_bytes` contiguous bytes per innermost step and
//! nests three strided loops around it:
//!
//! ```text
//! for i3 in 0..dim3.count            // tile rows
//!   for i2 in 0..dim2.count          // tile columns
//!     for i1 in 0..dim1.count        // rows within a tile
//!       copy dim0_bytes from base + i3*dim3.stride + i2*dim2.stride + i1*dim1.stride
//! ```
//!
//! A count of 0 behaves as 1, so unused outer dimensions written as
//! `(1, 0)` or `(0, 0)` collapse to a plain 1-D or 2-D copy.

/// One outer dimension: repeat count and byte stride between repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dim {
    /// Number of repeats. Zero is treated as one.
    pub count: u16,
    /// Byte distance between consecutive repeats.
    pub stride: u16,
}

impl Dim {
    /// Dimension that does not repeat.
    pub const UNIT: Self = Self { count: 1, stride: 0 };

    /// Build a dimension.
    pub const fn new(count: u16, stride: u16) -> Self {
        Self { count, stride }
    }

    /// Repeat count with the zero-means-one rule applied.
    pub const fn effective_count(&self) -> u64 {
        if self.count == 0 {
            1
        } else {
            self.count as u64
        }
    }
}

/// Iterator over the contiguous `(address, len)` runs of a transfer, in the
/// order the DMA engine streams them.
#[derive(Debug, Clone)]
pub struct Chunks {
    base: u64,
    run: u32,
    dims: [Dim; 3],
    // i1, i2, i3
    pos: [u64; 3],
    done: bool,
}

impl Chunks {
    pub(crate) fn new(base: u64, run: u32, dims: [Dim; 3]) -> Self {
        Self {
            base,
            run,
            dims,
            pos: [0; 3],
            done: run == 0,
        }
    }

    /// Number of runs still to be produced.
    pub fn remaining(&self) -> u64 {
        if self.done {
            return 0;
        }
        let [d1, d2, d3] = self.dims.map(|d| d.effective_count());
        let consumed = self.pos[0] + self.pos[1] * d1 + self.pos[2] * d1 * d2;
        d1 * d2 * d3 - consumed
    }
}

impl Iterator for Chunks {
    type Item = (u64, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = self
            .pos
            .iter()
            .zip(self.dims.iter())
            .map(|(i, d)| i * u64::from(d.stride))
            .sum::<u64>();
        let item = (self.base + offset, self.run);

        // odometer increment, innermost first
        let mut level = 0;
        loop {
            if level == 3 {
                self.done = true;
                break;
            }
            self.pos[level] += 1;
            if self.pos[level] < self.dims[level].effective_count() {
                break;
            }
            self.pos[level] = 0;
            level += 1;
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_dims_yield_single_run() {
        let chunks: Vec<_> = Chunks::new(0x1000, 128, [Dim::UNIT; 3]).collect();
        assert_eq!(chunks, vec![(0x1000, 128)]);

        let zeroed: Vec<_> = Chunks::new(0x1000, 128, [Dim::default(); 3]).collect();
        assert_eq!(zeroed, vec![(0x1000, 128)]);
    }

    #[test]
    fn test_nesting_order() {
        // 2 rows of 8 bytes, stride 32; 2 tiles across, stride 8
        let dims = [Dim::new(2, 32), Dim::new(2, 8), Dim::UNIT];
        let chunks: Vec<_> = Chunks::new(0, 8, dims).collect();
        assert_eq!(chunks, vec![(0, 8), (32, 8), (8, 8), (40, 8)]);
    }

    #[test]
    fn test_remaining_tracks_progress() {
        let dims = [Dim::new(4, 16), Dim::new(3, 4), Dim::new(2, 256)];
        let mut chunks = Chunks::new(0, 4, dims);
        assert_eq!(chunks.remaining(), 24);
        chunks.next();
        chunks.next();
        assert_eq!(chunks.remaining(), 22);
        assert_eq!(chunks.by_ref().count(), 22);
        assert_eq!(chunks.remaining(), 0);
    }

    #[test]
    fn test_zero_run_is_empty() {
        assert_eq!(Chunks::new(0, 0, [Dim::UNIT; 3]).count(), 0);
    }
}
