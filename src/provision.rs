//! Mipmapped resource provisioning
//!
//! Creates the GPU resource for a texture under the chosen layout policy and
//! resolves a sub-resource handle for every usable level.

use crate::error::PipelineError;
use crate::format::FormatDescriptor;
use crate::geometry::Extent2d;
use crate::gpu::{GpuDevice, ResourceDescriptor};
use crate::layout::LayoutPolicy;
use tracing::{debug, info};

/// A created resource together with its resolved levels
pub struct ProvisionedTexture<D: GpuDevice> {
    pub resource: D::Resource,
    /// One handle per usable level, index = mip level
    pub levels: Vec<D::Level>,
    pub descriptor: ResourceDescriptor,
}

impl<D: GpuDevice> ProvisionedTexture<D> {
    pub fn usable_level_count(&self) -> u32 {
        self.descriptor.level_count
    }
}

/// Create a mipmapped resource for a `base` texture with `level_count` levels
pub fn provision<D: GpuDevice>(
    device: &D,
    base: Extent2d,
    level_count: u32,
    format: &FormatDescriptor,
    policy: &dyn LayoutPolicy,
) -> Result<ProvisionedTexture<D>, PipelineError> {
    let descriptor = policy.resource_descriptor(base, level_count, format);

    info!(
        "Provisioning {} {} resource: {:?} {} x{} levels ({} of {} usable)",
        policy.kind(),
        format.variant,
        descriptor.format,
        descriptor.extent,
        descriptor.channel_count,
        descriptor.level_count,
        level_count
    );

    let resource =
        device
            .create_mip_resource(&descriptor)
            .map_err(|source| PipelineError::ResourceCreation {
                operation: format!(
                    "{:?} {} with {} levels",
                    descriptor.format, descriptor.extent, descriptor.level_count
                ),
                source,
            })?;

    let mut levels = Vec::with_capacity(descriptor.level_count as usize);
    for level in 0..descriptor.level_count {
        let handle = device
            .resolve_level(&resource, level)
            .map_err(|source| PipelineError::Subresource { level, source })?;
        debug!("Resolved level {}: {}", level, device.level_extent(&handle));
        levels.push(handle);
    }

    Ok(ProvisionedTexture {
        resource,
        levels,
        descriptor,
    })
}
