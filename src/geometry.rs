//! Extent and block-grid arithmetic
//!
//! Block-compressed data is addressed in 4x4 pixel blocks. Every stage that
//! needs level dimensions or block counts goes through these helpers so the
//! halving and rounding rules live in one place.

use std::fmt;

/// Width/height of one side of a block-compressed block, in pixels
pub const BLOCK_DIM: u32 = 4;

/// A two-dimensional extent (pixels, texels or blocks depending on context)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of elements covered by this extent
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Extent of mip `level` for a base extent, halving and flooring with a minimum of 1
    pub fn mip(&self, level: u32) -> Self {
        Self {
            width: halve(self.width, level),
            height: halve(self.height, level),
        }
    }

    /// Number of 4x4 blocks needed to cover this extent
    pub fn block_grid(&self) -> Self {
        Self {
            width: self.width.div_ceil(BLOCK_DIM),
            height: self.height.div_ceil(BLOCK_DIM),
        }
    }

    /// Pixel extent spanned by a block grid of this size
    pub fn block_grid_pixels(&self) -> Self {
        Self {
            width: self.width * BLOCK_DIM,
            height: self.height * BLOCK_DIM,
        }
    }
}

impl fmt::Display for Extent2d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn halve(value: u32, level: u32) -> u32 {
    value.checked_shr(level).unwrap_or(0).max(1)
}

/// Number of levels in a full mip chain ending at 1x1
pub fn full_chain_len(extent: Extent2d) -> u32 {
    let max_dim = extent.width.max(extent.height).max(1);
    u32::BITS - max_dim.leading_zeros()
}

/// Bytes occupied by one level's block payload
pub fn level_byte_size(level_extent: Extent2d, block_stride: u32) -> u64 {
    level_extent.block_grid().area() * block_stride as u64
}
