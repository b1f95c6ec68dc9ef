//! Resource layout policies
//!
//! Two driver eras lay block-compressed mip chains out differently:
//!
//! - **Native**: the resource uses the block-compressed format directly and
//!   every level keeps its true pixel extent.
//! - **Emulated**: the resource pretends to be a plain 32-bit integer format
//!   whose texels are whole blocks, so each level is only as large as its
//!   block grid. The two smallest levels cannot be represented that way.
//!
//! A policy is chosen once per pipeline and used for provisioning, transfer
//! and sampling-view construction alike.

use crate::format::FormatDescriptor;
use crate::geometry::Extent2d;
use crate::gpu::{BlockCopy, ResourceDescriptor};
use std::fmt;
use wgpu::TextureFormat;

/// Levels the emulated layout cannot represent
const EMULATED_DROPPED_LEVELS: u32 = 2;

/// Bytes per channel of the integer format used by the emulated layout
const EMULATED_CHANNEL_BYTES: u32 = 4;

/// Block counts and strides for one level copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferGeometry {
    /// Block grid of the host payload
    pub src_blocks: Extent2d,
    /// Block grid of the device level
    pub dst_blocks: Extent2d,
    pub src_row_bytes: u64,
    pub dst_row_bytes: u64,
    /// Copy extent in the level's own texel units
    pub texel_extent: Extent2d,
}

impl TransferGeometry {
    /// Bytes of host payload the level must provide
    pub fn required_source_bytes(&self) -> u64 {
        self.src_row_bytes * self.src_blocks.height as u64
    }

    /// Every destination block has a source block behind it
    pub fn fits_source(&self) -> bool {
        self.dst_blocks.width <= self.src_blocks.width
            && self.dst_blocks.height <= self.src_blocks.height
    }

    pub fn block_copy(&self) -> BlockCopy {
        BlockCopy {
            src_pitch: self.src_row_bytes,
            row_bytes: self.dst_row_bytes,
            rows: self.dst_blocks.height,
            texel_extent: self.texel_extent,
        }
    }
}

/// How level dimensions and formats are presented to the GPU resource layer
pub trait LayoutPolicy: Send + Sync {
    fn kind(&self) -> PolicyKind;

    /// Levels that can be provisioned for a container with `level_count` levels
    fn usable_level_count(&self, level_count: u32) -> u32;

    fn resource_descriptor(
        &self,
        base: Extent2d,
        level_count: u32,
        format: &FormatDescriptor,
    ) -> ResourceDescriptor;

    /// Copy geometry for `level`, given the extent the device reports for it
    fn transfer_geometry(
        &self,
        base: Extent2d,
        level: u32,
        device_extent: Extent2d,
        format: &FormatDescriptor,
    ) -> TransferGeometry;

    /// Pixel extent a sampling view spans
    fn sample_view_extent(&self, base: Extent2d) -> Extent2d;

    /// Prefix for output names, keeps both layouts' outputs apart
    fn output_tag(&self) -> &'static str {
        self.kind().name()
    }
}

/// Block-compressed storage at true pixel extents
#[derive(Debug, Clone, Copy, Default)]
pub struct Native;

/// Integer storage at block-grid extents
#[derive(Debug, Clone, Copy, Default)]
pub struct Emulated;

impl LayoutPolicy for Native {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Native
    }

    fn usable_level_count(&self, level_count: u32) -> u32 {
        level_count
    }

    fn resource_descriptor(
        &self,
        base: Extent2d,
        level_count: u32,
        format: &FormatDescriptor,
    ) -> ResourceDescriptor {
        ResourceDescriptor {
            format: format.storage_format,
            channel_count: format.channel_count,
            extent: base,
            level_count: self.usable_level_count(level_count),
        }
    }

    fn transfer_geometry(
        &self,
        _base: Extent2d,
        _level: u32,
        device_extent: Extent2d,
        format: &FormatDescriptor,
    ) -> TransferGeometry {
        // Host and device are both measured in true pixels
        let blocks = device_extent.block_grid();
        let row_bytes = blocks.width as u64 * format.block_stride as u64;
        TransferGeometry {
            src_blocks: blocks,
            dst_blocks: blocks,
            src_row_bytes: row_bytes,
            dst_row_bytes: row_bytes,
            texel_extent: blocks.block_grid_pixels(),
        }
    }

    fn sample_view_extent(&self, base: Extent2d) -> Extent2d {
        base
    }
}

impl Emulated {
    /// Integer storage format holding one block per texel
    pub fn storage_format(block_stride: u32) -> TextureFormat {
        match block_stride / EMULATED_CHANNEL_BYTES {
            2 => TextureFormat::Rg32Uint,
            _ => TextureFormat::Rgba32Uint,
        }
    }
}

impl LayoutPolicy for Emulated {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Emulated
    }

    fn usable_level_count(&self, level_count: u32) -> u32 {
        level_count.saturating_sub(EMULATED_DROPPED_LEVELS).max(1)
    }

    fn resource_descriptor(
        &self,
        base: Extent2d,
        level_count: u32,
        format: &FormatDescriptor,
    ) -> ResourceDescriptor {
        ResourceDescriptor {
            format: Self::storage_format(format.block_stride),
            channel_count: format.block_stride / EMULATED_CHANNEL_BYTES,
            extent: base.block_grid(),
            level_count: self.usable_level_count(level_count),
        }
    }

    fn transfer_geometry(
        &self,
        base: Extent2d,
        level: u32,
        device_extent: Extent2d,
        format: &FormatDescriptor,
    ) -> TransferGeometry {
        // The device level is already block-grid sized; the host payload follows
        // the true level extent and can be larger at small levels.
        let src_blocks = base.mip(level).block_grid();
        let stride = format.block_stride as u64;
        TransferGeometry {
            src_blocks,
            dst_blocks: device_extent,
            src_row_bytes: src_blocks.width as u64 * stride,
            dst_row_bytes: device_extent.width as u64 * stride,
            texel_extent: device_extent,
        }
    }

    fn sample_view_extent(&self, base: Extent2d) -> Extent2d {
        base.block_grid().block_grid_pixels()
    }
}

/// Which layout policy to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Native,
    Emulated,
}

static NATIVE: Native = Native;
static EMULATED: Emulated = Emulated;

impl PolicyKind {
    pub fn policy(self) -> &'static dyn LayoutPolicy {
        match self {
            PolicyKind::Native => &NATIVE,
            PolicyKind::Emulated => &EMULATED,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Native => "native",
            PolicyKind::Emulated => "emulated",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Policy as requested by configuration, before the device is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PolicySelection {
    /// Native when the device supports block-compressed storage, else emulated
    #[default]
    Auto,
    #[value(alias = "new")]
    Native,
    #[value(alias = "legacy")]
    Emulated,
}

impl PolicySelection {
    /// Resolve against a device's capabilities
    pub fn resolve(self, native_block_formats: bool) -> PolicyKind {
        match self {
            PolicySelection::Auto if native_block_formats => PolicyKind::Native,
            PolicySelection::Auto => PolicyKind::Emulated,
            PolicySelection::Native => PolicyKind::Native,
            PolicySelection::Emulated => PolicyKind::Emulated,
        }
    }
}
