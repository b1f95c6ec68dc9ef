//! CPU-resident device model
//!
//! Keeps every level as rows of blocks in host memory and applies the same
//! creation rules a driver would. Used when no GPU is available and as the
//! device behind the test suite: it logs every create/destroy so teardown
//! order can be checked, and views expose stored blocks directly.

use super::{
    element_grid, validate_copy, validate_resource, validate_view, BlockCopy, DeviceCapabilities,
    GpuDevice, GpuError, ResourceDescriptor, SamplingViewDescriptor,
};
use crate::error::KernelError;
use crate::format::FormatVariant;
use crate::geometry::Extent2d;
use crate::sampler::SampleKernel;
use image_dds::ddsfile::{AlphaMode, D3D10ResourceDimension, Dds, NewDxgiParams};
use rayon::prelude::*;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Capabilities the host device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub native_block_formats: bool,
    pub max_extent: u32,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            native_block_formats: true,
            max_extent: 16384,
        }
    }
}

/// Resource lifecycle events, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    CreateResource { id: u64 },
    DestroyResource { id: u64 },
    CreateView { resource: u64 },
    DestroyView { resource: u64 },
}

#[derive(Debug, Default)]
struct HostState {
    events: Vec<DeviceEvent>,
    next_id: u64,
    copies: usize,
}

type SharedState = Arc<Mutex<HostState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, HostState> {
    // A panicking test thread must not hide the log from the others
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host memory device
#[derive(Debug, Clone)]
pub struct HostDevice {
    caps: HostCapabilities,
    state: SharedState,
}

/// Rows of blocks (or texels) for one level
#[derive(Debug)]
struct LevelStore {
    extent: Extent2d,
    row_bytes: u64,
    rows: u32,
    data: Vec<u8>,
}

/// Mipmapped resource in host memory
#[derive(Debug)]
pub struct HostResource {
    id: u64,
    desc: ResourceDescriptor,
    unit_bytes: u32,
    levels: Vec<Mutex<LevelStore>>,
    state: SharedState,
}

/// Level handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLevel {
    index: u32,
    extent: Extent2d,
}

/// Sampling view borrowing a host resource
#[derive(Debug)]
pub struct HostView<'r> {
    resource: &'r HostResource,
    desc: SamplingViewDescriptor,
    state: SharedState,
}

impl HostDevice {
    pub fn new(caps: HostCapabilities) -> Self {
        Self {
            caps,
            state: SharedState::default(),
        }
    }

    /// Lifecycle events recorded so far
    pub fn events(&self) -> Vec<DeviceEvent> {
        lock(&self.state).events.clone()
    }

    /// Number of completed level copies
    pub fn copies(&self) -> usize {
        lock(&self.state).copies
    }
}

impl GpuDevice for HostDevice {
    type Resource = HostResource;
    type Level = HostLevel;
    type View<'r> = HostView<'r>;

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            native_block_formats: self.caps.native_block_formats,
            max_extent: self.caps.max_extent,
        }
    }

    fn create_mip_resource(&self, desc: &ResourceDescriptor) -> Result<HostResource, GpuError> {
        let unit_bytes = validate_resource(desc, &self.capabilities())?;

        let levels = (0..desc.level_count)
            .map(|i| {
                let extent = desc.extent.mip(i);
                let grid = element_grid(desc.format, extent);
                let row_bytes = grid.width as u64 * unit_bytes as u64;
                Mutex::new(LevelStore {
                    extent,
                    row_bytes,
                    rows: grid.height,
                    data: vec![0u8; (row_bytes * grid.height as u64) as usize],
                })
            })
            .collect();

        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.events.push(DeviceEvent::CreateResource { id });

        Ok(HostResource {
            id,
            desc: *desc,
            unit_bytes,
            levels,
            state: Arc::clone(&self.state),
        })
    }

    fn resolve_level(&self, resource: &HostResource, level: u32) -> Result<HostLevel, GpuError> {
        let store = resource
            .levels
            .get(level as usize)
            .ok_or(GpuError::LevelOutOfRange {
                level,
                level_count: resource.desc.level_count,
            })?;
        let extent = store.lock().unwrap_or_else(|p| p.into_inner()).extent;
        Ok(HostLevel {
            index: level,
            extent,
        })
    }

    fn level_extent(&self, level: &HostLevel) -> Extent2d {
        level.extent
    }

    fn copy_to_level(
        &self,
        resource: &HostResource,
        level: &HostLevel,
        copy: &BlockCopy,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let store = resource
            .levels
            .get(level.index as usize)
            .ok_or(GpuError::LevelOutOfRange {
                level: level.index,
                level_count: resource.desc.level_count,
            })?;
        let mut store = store.lock().unwrap_or_else(|p| p.into_inner());

        let level_grid = element_grid(resource.desc.format, store.extent);
        validate_copy(
            resource.desc.format,
            resource.unit_bytes,
            level.index,
            level_grid,
            copy,
            data.len(),
        )?;

        let dst_pitch = store.row_bytes as usize;
        let row = copy.row_bytes as usize;
        for r in 0..copy.rows as usize {
            let src = r * copy.src_pitch as usize;
            let dst = r * dst_pitch;
            store.data[dst..dst + row].copy_from_slice(&data[src..src + row]);
        }

        lock(&self.state).copies += 1;
        Ok(())
    }

    fn create_sampling_view<'r>(
        &'r self,
        resource: &'r HostResource,
        desc: &SamplingViewDescriptor,
    ) -> Result<HostView<'r>, GpuError> {
        validate_view(&resource.desc, resource.unit_bytes, desc)?;

        lock(&self.state).events.push(DeviceEvent::CreateView {
            resource: resource.id,
        });

        Ok(HostView {
            resource,
            desc: *desc,
            state: Arc::clone(&self.state),
        })
    }

    fn synchronize(&self) -> Result<(), GpuError> {
        // Host copies complete before copy_to_level returns
        Ok(())
    }
}

impl HostResource {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.desc
    }
}

impl Drop for HostResource {
    fn drop(&mut self) {
        lock(&self.state)
            .events
            .push(DeviceEvent::DestroyResource { id: self.id });
    }
}

impl<'r> HostView<'r> {
    pub fn descriptor(&self) -> &SamplingViewDescriptor {
        &self.desc
    }

    /// Stored bytes of one block, bypassing filtering
    pub fn block(&self, level: u32, bx: u32, by: u32) -> Option<Vec<u8>> {
        if level < self.desc.first_level || level > self.desc.last_level {
            return None;
        }
        let store = self.resource.levels.get(level as usize)?;
        let store = store.lock().unwrap_or_else(|p| p.into_inner());

        let unit = self.resource.unit_bytes as u64;
        if by >= store.rows || (bx as u64 + 1) * unit > store.row_bytes {
            return None;
        }
        let start = (by as u64 * store.row_bytes + bx as u64 * unit) as usize;
        Some(store.data[start..start + unit as usize].to_vec())
    }

    /// Level as seen through the view: its pixel extent and a tightly packed block grid
    ///
    /// Blocks the storage does not cover (possible when integer storage is read as
    /// a block format) read as zero.
    pub fn level_blocks(&self, level: u32) -> Option<(Extent2d, Vec<u8>)> {
        if level < self.desc.first_level || level > self.desc.last_level {
            return None;
        }
        let store = self.resource.levels.get(level as usize)?;
        let store = store.lock().unwrap_or_else(|p| p.into_inner());

        let extent = self.desc.extent.mip(level);
        let grid = extent.block_grid();
        let unit = self.resource.unit_bytes as u64;
        let row_bytes = grid.width as u64 * unit;
        let mut blocks = vec![0u8; (row_bytes * grid.height as u64) as usize];

        let copy_row = row_bytes.min(store.row_bytes) as usize;
        let copy_rows = grid.height.min(store.rows) as usize;
        for r in 0..copy_rows {
            let src = r * store.row_bytes as usize;
            let dst = r * row_bytes as usize;
            blocks[dst..dst + copy_row].copy_from_slice(&store.data[src..src + copy_row]);
        }

        Some((extent, blocks))
    }
}

impl Drop for HostView<'_> {
    fn drop(&mut self) {
        lock(&self.state).events.push(DeviceEvent::DestroyView {
            resource: self.resource.id,
        });
    }
}

/// CPU reference implementation of the mip drawing kernel
///
/// Point-samples the requested level at every output pixel center and packs
/// RGBA8 little-endian into each `u32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostKernel;

impl HostKernel {
    fn decode_level(
        view: &HostView<'_>,
        level: u32,
    ) -> Result<image::RgbaImage, KernelError> {
        let desc = view.descriptor();
        let (extent, blocks) = view.level_blocks(level).ok_or(KernelError::LevelOutOfRange {
            level,
            first: desc.first_level,
            last: desc.last_level,
        })?;

        let variant = FormatVariant::from_texture_format(desc.format).ok_or_else(|| {
            KernelError::Decode {
                level,
                message: format!("no decoder for {:?}", desc.format),
            }
        })?;

        let params = NewDxgiParams {
            width: extent.width,
            height: extent.height,
            depth: None,
            format: variant.descriptor().dxgi_format,
            mipmap_levels: Some(1),
            array_layers: None,
            caps2: None,
            is_cubemap: false,
            resource_dimension: D3D10ResourceDimension::Texture2D,
            alpha_mode: AlphaMode::Straight,
        };
        let mut dds = Dds::new_dxgi(params).map_err(|e| KernelError::Decode {
            level,
            message: e.to_string(),
        })?;
        dds.data = blocks;

        image_dds::image_from_dds(&dds, 0).map_err(|e| KernelError::Decode {
            level,
            message: e.to_string(),
        })
    }
}

impl SampleKernel<HostDevice> for HostKernel {
    fn sample(
        &self,
        view: &HostView<'_>,
        level: u32,
        output: &mut [u32],
        extent: Extent2d,
    ) -> Result<(), KernelError> {
        let needed = extent.area();
        if output.len() as u64 != needed || extent.is_empty() {
            return Err(KernelError::OutputSize {
                len: output.len(),
                extent,
                needed,
            });
        }

        let image = Self::decode_level(view, level)?;
        let (lw, lh) = image.dimensions();
        let lut = view.descriptor().degamma.then(srgb_to_linear_table);

        debug!("Host kernel: level {} ({}x{}) -> {}", level, lw, lh, extent);

        output
            .par_chunks_mut(extent.width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                let v = (y as f32 + 0.5) / extent.height as f32;
                let ty = ((v * lh as f32) as u32).min(lh - 1);
                for (x, out) in row.iter_mut().enumerate() {
                    let u = (x as f32 + 0.5) / extent.width as f32;
                    let tx = ((u * lw as f32) as u32).min(lw - 1);
                    let mut px = image.get_pixel(tx, ty).0;
                    if let Some(lut) = &lut {
                        for c in &mut px[..3] {
                            *c = lut[*c as usize];
                        }
                    }
                    *out = u32::from_le_bytes(px);
                }
            });

        Ok(())
    }
}

/// 8-bit sRGB to 8-bit linear lookup
fn srgb_to_linear_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let c = i as f32 / 255.0;
        let linear = if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        };
        *entry = (linear * 255.0).round() as u8;
    }
    table
}
