//! GPU device boundary
//!
//! The provisioning, transfer and sampling stages only talk to a device through
//! [`GpuDevice`]. Two backends implement it: [`WgpuDevice`] for real adapters
//! and [`HostDevice`], a CPU-resident model used as the fallback device and by
//! the test suite.

mod host;
mod wgpu_device;
mod wgpu_kernel;

pub use host::{
    DeviceEvent, HostCapabilities, HostDevice, HostKernel, HostLevel, HostResource, HostView,
};
pub use wgpu_device::{list_gpus, GpuInfo, WgpuDevice, WgpuLevel, WgpuResource, WgpuView};
pub use wgpu_kernel::WgpuKernel;

use crate::geometry::{full_chain_len, Extent2d};
use wgpu::TextureFormat;

/// What a device era can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Block-compressed formats can be used directly as storage formats
    pub native_block_formats: bool,
    /// Largest supported width/height of a 2D resource
    pub max_extent: u32,
}

/// Request for a mipmapped 2D resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub format: TextureFormat,
    pub channel_count: u32,
    pub extent: Extent2d,
    pub level_count: u32,
}

/// A host to device copy of whole block rows into one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCopy {
    /// Distance between consecutive rows in the host payload
    pub src_pitch: u64,
    /// Bytes copied from each row
    pub row_bytes: u64,
    /// Number of block rows copied
    pub rows: u32,
    /// Copy extent in the level's own texel units
    pub texel_extent: Extent2d,
}

impl BlockCopy {
    /// Host bytes the copy reads, from the start of the payload
    pub fn source_span(&self) -> u64 {
        if self.rows == 0 {
            return 0;
        }
        self.src_pitch * (self.rows as u64 - 1) + self.row_bytes
    }
}

/// Point or linear filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Read-only sampling view over a mipmapped resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingViewDescriptor {
    /// Block-compressed format the stored bytes are read as
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub normalized_coords: bool,
    pub filter: FilterMode,
    pub mip_filter: FilterMode,
    pub degamma: bool,
    /// Inclusive mip range visible through the view
    pub first_level: u32,
    pub last_level: u32,
}

/// Failure reported by a device backend
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU adapter available: {0}")]
    NoAdapter(String),

    #[error("failed to create device: {0}")]
    DeviceRequest(String),

    #[error("format {format:?} is not supported by this device")]
    UnsupportedFormat { format: TextureFormat },

    #[error("invalid resource descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("level {level} out of range (resource has {level_count} levels)")]
    LevelOutOfRange { level: u32, level_count: u32 },

    #[error("copy out of bounds: {0}")]
    CopyOutOfBounds(String),

    #[error("invalid sampling view: {0}")]
    InvalidView(String),

    #[error("device synchronization failed: {0}")]
    Sync(String),
}

/// Element grid of an extent (blocks for compressed formats, texels otherwise)
pub(crate) fn element_grid(format: TextureFormat, extent: Extent2d) -> Extent2d {
    let (bw, bh) = format.block_dimensions();
    Extent2d::new(extent.width.div_ceil(bw), extent.height.div_ceil(bh))
}

/// Creation rules shared by every backend; returns bytes per element
pub(crate) fn validate_resource(
    desc: &ResourceDescriptor,
    caps: &DeviceCapabilities,
) -> Result<u32, GpuError> {
    let extent = desc.extent;
    if extent.is_empty() || extent.width > caps.max_extent || extent.height > caps.max_extent {
        return Err(GpuError::InvalidDescriptor(format!(
            "extent {} outside 1..={}",
            extent, caps.max_extent
        )));
    }

    let max_levels = full_chain_len(extent);
    if desc.level_count == 0 || desc.level_count > max_levels {
        return Err(GpuError::InvalidDescriptor(format!(
            "{} levels requested, {} extent allows 1..={}",
            desc.level_count, extent, max_levels
        )));
    }

    if desc.format.is_compressed() && !caps.native_block_formats {
        return Err(GpuError::UnsupportedFormat {
            format: desc.format,
        });
    }

    let unit_bytes = desc
        .format
        .block_copy_size(None)
        .ok_or(GpuError::UnsupportedFormat {
            format: desc.format,
        })?;

    let components = desc.format.components() as u32;
    if components != desc.channel_count {
        return Err(GpuError::InvalidDescriptor(format!(
            "{:?} has {} channels, descriptor asks for {}",
            desc.format, components, desc.channel_count
        )));
    }

    Ok(unit_bytes)
}

/// Bounds of a block copy into a level whose element grid is `level_grid`
pub(crate) fn validate_copy(
    format: TextureFormat,
    unit_bytes: u32,
    level: u32,
    level_grid: Extent2d,
    copy: &BlockCopy,
    data_len: usize,
) -> Result<(), GpuError> {
    let grid = element_grid(format, copy.texel_extent);
    if grid.width as u64 * unit_bytes as u64 != copy.row_bytes || grid.height != copy.rows {
        return Err(GpuError::CopyOutOfBounds(format!(
            "texel extent {} does not match {} rows of {} bytes",
            copy.texel_extent, copy.rows, copy.row_bytes
        )));
    }
    if grid.width > level_grid.width || grid.height > level_grid.height {
        return Err(GpuError::CopyOutOfBounds(format!(
            "{} elements into level {} with {} elements",
            grid, level, level_grid
        )));
    }
    if copy.row_bytes > copy.src_pitch || (data_len as u64) < copy.source_span() {
        return Err(GpuError::CopyOutOfBounds(format!(
            "source of {} bytes cannot supply {} rows at pitch {}",
            data_len, copy.rows, copy.src_pitch
        )));
    }
    Ok(())
}

/// Whether `view` may read a resource described by `res`
///
/// Block-compressed storage is read through the same format, with or without
/// the gamma suffix. Integer storage is read through any block format whose
/// block size equals the texel size, at four times the resource extent.
pub(crate) fn validate_view(
    res: &ResourceDescriptor,
    unit_bytes: u32,
    view: &SamplingViewDescriptor,
) -> Result<(), GpuError> {
    if view.first_level > view.last_level || view.last_level >= res.level_count {
        return Err(GpuError::InvalidView(format!(
            "mip range {}..={} outside resource with {} levels",
            view.first_level, view.last_level, res.level_count
        )));
    }

    if !view.format.is_compressed() || view.format.block_copy_size(None) != Some(unit_bytes) {
        return Err(GpuError::InvalidView(format!(
            "{:?} cannot reinterpret {:?} storage",
            view.format, res.format
        )));
    }

    let expected_extent = if res.format.is_compressed() {
        if view.format.remove_srgb_suffix() != res.format.remove_srgb_suffix() {
            return Err(GpuError::InvalidView(format!(
                "{:?} view over {:?} storage",
                view.format, res.format
            )));
        }
        res.extent
    } else {
        res.extent.block_grid_pixels()
    };
    if view.extent != expected_extent {
        return Err(GpuError::InvalidView(format!(
            "view extent {} does not match storage extent {}",
            view.extent, expected_extent
        )));
    }
    Ok(())
}

/// Capability-queryable device context
///
/// Resources own their levels; a view borrows the resource it reads, so it is
/// always released before the resource. Every call completes or fails before
/// it returns.
pub trait GpuDevice {
    type Resource;
    type Level;
    type View<'r>
    where
        Self: 'r;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Create a mipmapped resource with exactly `desc.level_count` levels
    fn create_mip_resource(&self, desc: &ResourceDescriptor) -> Result<Self::Resource, GpuError>;

    /// Resolve the sub-resource handle of one level
    fn resolve_level(&self, resource: &Self::Resource, level: u32)
        -> Result<Self::Level, GpuError>;

    /// Dimensions the device actually allocated for a level
    fn level_extent(&self, level: &Self::Level) -> Extent2d;

    /// Copy block rows from host memory into a level
    fn copy_to_level(
        &self,
        resource: &Self::Resource,
        level: &Self::Level,
        copy: &BlockCopy,
        data: &[u8],
    ) -> Result<(), GpuError>;

    fn create_sampling_view<'r>(
        &'r self,
        resource: &'r Self::Resource,
        desc: &SamplingViewDescriptor,
    ) -> Result<Self::View<'r>, GpuError>;

    /// Wait for all queued work to finish
    fn synchronize(&self) -> Result<(), GpuError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_span_uses_pitch_between_rows() {
        let copy = BlockCopy {
            src_pitch: 24,
            row_bytes: 16,
            rows: 3,
            texel_extent: Extent2d::new(2, 3),
        };
        assert_eq!(copy.source_span(), 24 * 2 + 16);
    }

    #[test]
    fn test_source_span_empty_copy() {
        let copy = BlockCopy {
            src_pitch: 8,
            row_bytes: 8,
            rows: 0,
            texel_extent: Extent2d::new(1, 0),
        };
        assert_eq!(copy.source_span(), 0);
    }

    #[test]
    fn test_element_grid_per_format() {
        let extent = Extent2d::new(37, 27);
        assert_eq!(
            element_grid(TextureFormat::Bc1RgbaUnorm, extent),
            Extent2d::new(10, 7)
        );
        assert_eq!(element_grid(TextureFormat::Rg32Uint, extent), extent);
    }

    #[test]
    fn test_validate_resource_rules() {
        let caps = DeviceCapabilities {
            native_block_formats: false,
            max_extent: 64,
        };
        let mut desc = ResourceDescriptor {
            format: TextureFormat::Rgba32Uint,
            channel_count: 4,
            extent: Extent2d::new(16, 16),
            level_count: 5,
        };
        assert_eq!(validate_resource(&desc, &caps).unwrap(), 16);

        desc.level_count = 6;
        assert!(validate_resource(&desc, &caps).is_err());

        desc.level_count = 1;
        desc.extent = Extent2d::new(128, 1);
        assert!(validate_resource(&desc, &caps).is_err());

        desc.extent = Extent2d::new(16, 16);
        desc.format = TextureFormat::Bc7RgbaUnorm;
        assert!(matches!(
            validate_resource(&desc, &caps),
            Err(GpuError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_validate_copy_bounds() {
        let copy = BlockCopy {
            src_pitch: 24,
            row_bytes: 16,
            rows: 2,
            texel_extent: Extent2d::new(8, 8),
        };
        let fmt = TextureFormat::Bc1RgbaUnorm;
        assert!(validate_copy(fmt, 8, 0, Extent2d::new(2, 2), &copy, 40).is_ok());
        assert!(validate_copy(fmt, 8, 0, Extent2d::new(2, 2), &copy, 39).is_err());
        assert!(validate_copy(fmt, 8, 0, Extent2d::new(1, 2), &copy, 40).is_err());
        assert!(validate_copy(fmt, 16, 0, Extent2d::new(2, 2), &copy, 40).is_err());
    }
}
