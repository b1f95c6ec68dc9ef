//! Host to device level transfer
//!
//! Copies each level's compressed blocks into its sub-resource. The level
//! extent is always queried from the device rather than recomputed, so any
//! rounding the device applied during provisioning is honoured here.

use crate::container::CompressedLevel;
use crate::error::TransferError;
use crate::format::FormatDescriptor;
use crate::geometry::Extent2d;
use crate::gpu::GpuDevice;
use crate::layout::{LayoutPolicy, TransferGeometry};
use crate::provision::ProvisionedTexture;
use tracing::{debug, info, warn};

/// Copy one level's payload into its sub-resource
///
/// The level is consumed; its payload is released as soon as the copy has
/// been issued.
pub fn transfer_level<D: GpuDevice>(
    device: &D,
    resource: &D::Resource,
    subresource: &D::Level,
    level: CompressedLevel,
    base: Extent2d,
    format: &FormatDescriptor,
    policy: &dyn LayoutPolicy,
) -> Result<TransferGeometry, TransferError> {
    let device_extent = device.level_extent(subresource);
    let geometry = policy.transfer_geometry(base, level.index, device_extent, format);

    if !geometry.fits_source() {
        return Err(TransferError::GeometryMismatch {
            level: level.index,
            device: geometry.dst_blocks,
            host: geometry.src_blocks,
        });
    }

    let required = geometry.required_source_bytes();
    let available = level.byte_size() as u64;
    if available < required {
        return Err(TransferError::PayloadTooSmall {
            level: level.index,
            required,
            available,
        });
    }

    let copy = geometry.block_copy();
    debug!(
        "Level {}: device {} host blocks {} -> device blocks {}, pitch {} / row {} x{}",
        level.index,
        device_extent,
        geometry.src_blocks,
        geometry.dst_blocks,
        copy.src_pitch,
        copy.row_bytes,
        copy.rows
    );

    device
        .copy_to_level(resource, subresource, &copy, &level.payload)
        .map_err(|source| TransferError::Copy {
            level: level.index,
            source,
        })?;

    Ok(geometry)
}

/// Transfer every usable level, releasing each payload after its copy
///
/// Levels past the resource's usable count are dropped without a copy.
pub fn transfer_all<D: GpuDevice>(
    device: &D,
    texture: &ProvisionedTexture<D>,
    levels: Vec<CompressedLevel>,
    base: Extent2d,
    format: &FormatDescriptor,
    policy: &dyn LayoutPolicy,
) -> Result<u64, TransferError> {
    let mut bytes = 0u64;
    let mut copied = 0usize;
    let usable = texture.levels.len();

    for (level, subresource) in levels.into_iter().zip(texture.levels.iter()) {
        let geometry =
            transfer_level(device, &texture.resource, subresource, level, base, format, policy)?;
        bytes += geometry.dst_row_bytes * geometry.dst_blocks.height as u64;
        copied += 1;
    }

    if copied < usable {
        warn!("Only {} of {} usable levels had a payload", copied, usable);
    }
    info!("Transferred {} levels ({} bytes)", copied, bytes);
    Ok(bytes)
}
