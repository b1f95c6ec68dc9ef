//! wgpu device backend
//!
//! Adapter selection prefers discrete GPUs, then the Vulkan backend. Native
//! block-compressed storage needs `TEXTURE_COMPRESSION_BC`; adapters without it
//! can still run the emulated layout, whose integer levels are copied into a
//! block-compressed shadow texture when a sampling view is created.

use super::{
    element_grid, validate_copy, validate_resource, validate_view, BlockCopy, DeviceCapabilities,
    FilterMode, GpuDevice, GpuError, ResourceDescriptor, SamplingViewDescriptor,
};
use crate::geometry::Extent2d;
use std::sync::Arc;
use tracing::{debug, info};
use wgpu::{
    Backends, BufferDescriptor, BufferUsages, CommandEncoderDescriptor, Device, Extent3d,
    Instance, Queue, Sampler, Texture, TextureDescriptor, TextureDimension, TextureFormat,
    TextureUsages, TextureView, TextureViewDescriptor,
};

/// GPU information for display/selection
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub adapter_index: usize,
    /// Adapter can store BC formats natively
    pub bc_compression: bool,
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.backend, self.device_type)?;
        if !self.bc_compression {
            write!(f, " [no BC]")?;
        }
        Ok(())
    }
}

/// Device context on a real adapter
pub struct WgpuDevice {
    device: Arc<Device>,
    queue: Arc<Queue>,
    caps: DeviceCapabilities,
    pub gpu_info: GpuInfo,
}

/// Mipmapped texture on the adapter
pub struct WgpuResource {
    texture: Texture,
    desc: ResourceDescriptor,
    unit_bytes: u32,
}

/// Level handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuLevel {
    index: u32,
    extent: Extent2d,
}

/// Texture view and sampler over a resource
pub struct WgpuView<'r> {
    resource: &'r WgpuResource,
    /// Block-compressed copy of integer storage, when the resource has one
    shadow: Option<Texture>,
    view: TextureView,
    sampler: Sampler,
    desc: SamplingViewDescriptor,
}

fn new_instance() -> Instance {
    Instance::new(&wgpu::InstanceDescriptor {
        backends: Backends::VULKAN | Backends::DX12 | Backends::METAL,
        ..Default::default()
    })
}

/// Auto-selection preference: discrete GPU first, then Vulkan backend
fn adapter_score(device_type: wgpu::DeviceType, backend: wgpu::Backend, bc: bool) -> i32 {
    let mut score = 0i32;
    if device_type == wgpu::DeviceType::DiscreteGpu {
        score += 100;
    }
    if backend == wgpu::Backend::Vulkan {
        score += 10;
    }
    if bc {
        score += 1;
    }
    score
}

fn extent3d(extent: Extent2d) -> Extent3d {
    Extent3d {
        width: extent.width,
        height: extent.height,
        depth_or_array_layers: 1,
    }
}

/// The same format with the gamma suffix toggled, if it has one
fn srgb_counterpart(format: TextureFormat) -> Option<TextureFormat> {
    let other = if format.is_srgb() {
        format.remove_srgb_suffix()
    } else {
        format.add_srgb_suffix()
    };
    (other != format).then_some(other)
}

fn wgpu_filter(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

impl WgpuDevice {
    /// Initialize on the preferred adapter
    pub fn new() -> Result<Self, GpuError> {
        Self::with_gpu_index(None)
    }

    /// Initialize on a specific adapter index
    pub fn with_gpu_index(gpu_index: Option<usize>) -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async(gpu_index))
    }

    async fn new_async(gpu_index: Option<usize>) -> Result<Self, GpuError> {
        info!("Initializing GPU device...");

        let instance = new_instance();
        let adapters = instance.enumerate_adapters(Backends::all()).await;

        if adapters.is_empty() {
            return Err(GpuError::NoAdapter("no GPU found on this system".into()));
        }

        for (i, adapter) in adapters.iter().enumerate() {
            let info = adapter.get_info();
            info!(
                "GPU {}: {} ({:?}, {:?})",
                i, info.name, info.backend, info.device_type
            );
        }

        let adapter_index = match gpu_index {
            Some(idx) if idx >= adapters.len() => {
                return Err(GpuError::NoAdapter(format!(
                    "GPU index {} out of range (found {} GPUs)",
                    idx,
                    adapters.len()
                )));
            }
            Some(idx) => idx,
            None => adapters
                .iter()
                .enumerate()
                .max_by_key(|(_, a)| {
                    let info = a.get_info();
                    let bc = a
                        .features()
                        .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
                    adapter_score(info.device_type, info.backend, bc)
                })
                .map(|(i, _)| i)
                .unwrap_or(0),
        };
        let adapter = &adapters[adapter_index];

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        let bc_compression = adapter
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
        let gpu_info = GpuInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            device_type: format!("{:?}", adapter_info.device_type),
            adapter_index,
            bc_compression,
        };

        info!("Selected GPU: {}", gpu_info);

        let required_features = if bc_compression {
            wgpu::Features::TEXTURE_COMPRESSION_BC
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("bcmip device"),
                required_features,
                required_limits: adapter_limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let caps = DeviceCapabilities {
            native_block_formats: bc_compression,
            max_extent: adapter_limits.max_texture_dimension_2d,
        };
        debug!("Device capabilities: {:?}", caps);

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            caps,
            gpu_info,
        })
    }

    /// Get GPU information
    pub fn info(&self) -> &GpuInfo {
        &self.gpu_info
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Copy integer storage block-for-block into a block-compressed texture
    fn reinterpret_blocks(
        &self,
        resource: &WgpuResource,
        desc: &SamplingViewDescriptor,
    ) -> Texture {
        let view_formats: Vec<TextureFormat> = srgb_counterpart(desc.format).into_iter().collect();
        let shadow = self.device.create_texture(&TextureDescriptor {
            label: Some("bcmip block view"),
            size: extent3d(desc.extent),
            mip_level_count: desc.last_level + 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: desc.format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &view_formats,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("bcmip block view copy"),
            });

        let storage_base = Extent2d::new(resource.texture.width(), resource.texture.height());
        for level in desc.first_level..=desc.last_level {
            let stored = storage_base.mip(level);
            let viewed = desc.extent.mip(level).block_grid();
            // Blocks past the stored grid stay zero
            let blocks = Extent2d::new(
                stored.width.min(viewed.width),
                stored.height.min(viewed.height),
            );
            let bytes_per_row = align_to(
                blocks.width * resource.unit_bytes,
                wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
            );
            let layout = wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            };

            let staging = self.device.create_buffer(&BufferDescriptor {
                label: Some("bcmip block view staging"),
                size: bytes_per_row as u64 * blocks.height as u64,
                usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });

            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: &resource.texture,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout,
                },
                extent3d(blocks),
            );
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout,
                },
                wgpu::TexelCopyTextureInfo {
                    texture: &shadow,
                    mip_level: level,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                extent3d(blocks.block_grid_pixels()),
            );

            debug!(
                "Block view level {}: {} stored blocks, {} viewed",
                level, stored, viewed
            );
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        shadow
    }
}

impl GpuDevice for WgpuDevice {
    type Resource = WgpuResource;
    type Level = WgpuLevel;
    type View<'r> = WgpuView<'r>;

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn create_mip_resource(&self, desc: &ResourceDescriptor) -> Result<WgpuResource, GpuError> {
        let unit_bytes = validate_resource(desc, &self.caps)?;

        let (bw, bh) = desc.format.block_dimensions();
        if desc.extent.width % bw != 0 || desc.extent.height % bh != 0 {
            return Err(GpuError::InvalidDescriptor(format!(
                "{:?} needs a base extent in multiples of {}x{}, got {}",
                desc.format, bw, bh, desc.extent
            )));
        }

        let view_formats: Vec<TextureFormat> = srgb_counterpart(desc.format).into_iter().collect();
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("bcmip mip resource"),
            size: extent3d(desc.extent),
            mip_level_count: desc.level_count,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: desc.format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST | TextureUsages::COPY_SRC,
            view_formats: &view_formats,
        });

        debug!(
            "Created {:?} {} with {} levels",
            desc.format, desc.extent, desc.level_count
        );

        Ok(WgpuResource {
            texture,
            desc: *desc,
            unit_bytes,
        })
    }

    fn resolve_level(&self, resource: &WgpuResource, level: u32) -> Result<WgpuLevel, GpuError> {
        let level_count = resource.texture.mip_level_count();
        if level >= level_count {
            return Err(GpuError::LevelOutOfRange { level, level_count });
        }
        let base = Extent2d::new(resource.texture.width(), resource.texture.height());
        Ok(WgpuLevel {
            index: level,
            extent: base.mip(level),
        })
    }

    fn level_extent(&self, level: &WgpuLevel) -> Extent2d {
        level.extent
    }

    fn copy_to_level(
        &self,
        resource: &WgpuResource,
        level: &WgpuLevel,
        copy: &BlockCopy,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let format = resource.desc.format;
        validate_copy(
            format,
            resource.unit_bytes,
            level.index,
            element_grid(format, level.extent),
            copy,
            data.len(),
        )?;

        let bytes_per_row = u32::try_from(copy.src_pitch).map_err(|_| {
            GpuError::CopyOutOfBounds(format!("row pitch {} too large", copy.src_pitch))
        })?;

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &resource.texture,
                mip_level: level.index,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            },
            extent3d(copy.texel_extent),
        );

        Ok(())
    }

    fn create_sampling_view<'r>(
        &'r self,
        resource: &'r WgpuResource,
        desc: &SamplingViewDescriptor,
    ) -> Result<WgpuView<'r>, GpuError> {
        validate_view(&resource.desc, resource.unit_bytes, desc)?;
        if !self.caps.native_block_formats {
            return Err(GpuError::UnsupportedFormat {
                format: desc.format,
            });
        }
        if !desc.normalized_coords {
            return Err(GpuError::InvalidView(
                "unnormalized coordinates are not supported".into(),
            ));
        }

        let shadow = if resource.desc.format.is_compressed() {
            None
        } else {
            Some(self.reinterpret_blocks(resource, desc))
        };
        let source = shadow.as_ref().unwrap_or(&resource.texture);

        // Gamma decode happens in the sampler hardware through the sRGB view
        let view_format = if desc.degamma {
            desc.format.add_srgb_suffix()
        } else {
            desc.format.remove_srgb_suffix()
        };

        let view = source.create_view(&TextureViewDescriptor {
            label: Some("bcmip sampling view"),
            format: Some(view_format),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: desc.first_level,
            mip_level_count: Some(desc.last_level - desc.first_level + 1),
            ..Default::default()
        });

        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("bcmip sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu_filter(desc.filter),
            min_filter: wgpu_filter(desc.filter),
            ..Default::default()
        });

        Ok(WgpuView {
            resource,
            shadow,
            view,
            sampler,
            desc: *desc,
        })
    }

    fn synchronize(&self) -> Result<(), GpuError> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| GpuError::Sync(e.to_string()))
    }
}

impl WgpuResource {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.desc
    }
}

impl Drop for WgpuResource {
    fn drop(&mut self) {
        debug!("Releasing {:?} {}", self.desc.format, self.desc.extent);
        self.texture.destroy();
    }
}

impl WgpuView<'_> {
    pub fn descriptor(&self) -> &SamplingViewDescriptor {
        &self.desc
    }

    pub fn texture_view(&self) -> &TextureView {
        &self.view
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Extent of the resource the view reads
    pub fn storage_extent(&self) -> Extent2d {
        self.resource.desc.extent
    }
}

impl Drop for WgpuView<'_> {
    fn drop(&mut self) {
        if let Some(shadow) = &self.shadow {
            shadow.destroy();
        }
    }
}

/// List available GPUs
pub fn list_gpus() -> Vec<GpuInfo> {
    pollster::block_on(list_gpus_async())
}

async fn list_gpus_async() -> Vec<GpuInfo> {
    let instance = new_instance();
    let adapters = instance.enumerate_adapters(Backends::all()).await;

    adapters
        .iter()
        .enumerate()
        .map(|(idx, adapter)| {
            let info = adapter.get_info();
            GpuInfo {
                name: info.name.clone(),
                backend: format!("{:?}", info.backend),
                device_type: format!("{:?}", info.device_type),
                adapter_index: idx,
                bc_compression: adapter
                    .features()
                    .contains(wgpu::Features::TEXTURE_COMPRESSION_BC),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_gpus_indices_match_selection() {
        let gpus = list_gpus();
        for (i, gpu) in gpus.iter().enumerate() {
            assert_eq!(gpu.adapter_index, i);
            assert_eq!(gpu.to_string().ends_with(" [no BC]"), !gpu.bc_compression);
        }
    }

    #[test]
    fn test_gpu_info_display_flags_missing_bc() {
        let mut info = GpuInfo {
            name: "Test Adapter".into(),
            backend: "Vulkan".into(),
            device_type: "DiscreteGpu".into(),
            adapter_index: 0,
            bc_compression: true,
        };
        assert_eq!(info.to_string(), "Test Adapter (Vulkan, DiscreteGpu)");
        info.bc_compression = false;
        assert_eq!(info.to_string(), "Test Adapter (Vulkan, DiscreteGpu) [no BC]");
    }

    #[test]
    fn test_adapter_score_prefers_discrete_vulkan() {
        let discrete = adapter_score(wgpu::DeviceType::DiscreteGpu, wgpu::Backend::Dx12, false);
        let integrated =
            adapter_score(wgpu::DeviceType::IntegratedGpu, wgpu::Backend::Vulkan, true);
        assert!(discrete > integrated);
        assert!(
            adapter_score(wgpu::DeviceType::IntegratedGpu, wgpu::Backend::Vulkan, false)
                > adapter_score(wgpu::DeviceType::IntegratedGpu, wgpu::Backend::Metal, true)
        );
    }

    #[test]
    fn test_srgb_counterpart() {
        assert_eq!(
            srgb_counterpart(TextureFormat::Bc7RgbaUnorm),
            Some(TextureFormat::Bc7RgbaUnormSrgb)
        );
        assert_eq!(
            srgb_counterpart(TextureFormat::Bc1RgbaUnormSrgb),
            Some(TextureFormat::Bc1RgbaUnorm)
        );
        assert_eq!(srgb_counterpart(TextureFormat::Bc4RUnorm), None);
        assert_eq!(srgb_counterpart(TextureFormat::Rg32Uint), None);
    }

    #[test]
    fn test_align_to_row_alignment() {
        assert_eq!(align_to(16, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_rejects_unaligned_block_extent() {
        let device = WgpuDevice::new().expect("Failed to create device");
        if !device.capabilities().native_block_formats {
            return;
        }
        let desc = ResourceDescriptor {
            format: TextureFormat::Bc1RgbaUnorm,
            channel_count: 4,
            extent: Extent2d::new(37, 27),
            level_count: 6,
        };
        assert!(matches!(
            device.create_mip_resource(&desc),
            Err(GpuError::InvalidDescriptor(_))
        ));
    }
}
