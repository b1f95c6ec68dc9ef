//! wgpu compute kernel for drawing mip levels
//!
//! The kernel source is WGSL with a `draw_mip` entry point and the binding
//! layout of the built-in `draw_mip.wgsl`. A replacement module can be loaded
//! from disk; it must keep the same bindings.

use super::{GpuError, WgpuDevice, WgpuView};
use crate::error::KernelError;
use crate::geometry::Extent2d;
use crate::sampler::SampleKernel;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wgpu::{
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, ComputePipeline, Device, Queue,
};

/// Built-in kernel source
pub const BUILTIN_KERNEL: &str = include_str!("draw_mip.wgsl");

const BUILTIN_KERNEL_NAME: &str = "<built-in draw_mip.wgsl>";
const ENTRY_POINT: &str = "draw_mip";
const WORKGROUP_SIZE: u32 = 8;

/// Compute pipeline drawing one level per dispatch
pub struct WgpuKernel {
    device: Device,
    queue: Queue,
    pipeline: ComputePipeline,
}

impl WgpuKernel {
    /// Build the kernel from `kernel_path`, or the built-in source when `None`
    pub fn new(device: &WgpuDevice, kernel_path: Option<&Path>) -> Result<Self, KernelError> {
        let source = match kernel_path {
            Some(path) => {
                info!("Loading kernel module {}", path.display());
                std::fs::read_to_string(path).map_err(|source| KernelError::Load {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => BUILTIN_KERNEL.to_string(),
        };

        let module_path = kernel_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(BUILTIN_KERNEL_NAME));

        // Invalid WGSL or a missing entry point is captured, not raised as a panic
        let scope = device.device().push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device
            .device()
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("bcmip draw_mip"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let pipeline = device
            .device()
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("bcmip draw_mip pipeline"),
                layout: None,
                module: &module,
                entry_point: Some(ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
        compile_result(&module_path, pollster::block_on(scope.pop()))?;

        Ok(Self {
            device: device.device().clone(),
            queue: device.queue().clone(),
            pipeline,
        })
    }

    fn read_back(&self, buffer: &wgpu::Buffer, output: &mut [u32]) -> Result<(), GpuError> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| GpuError::Sync(e.to_string()))?;
        rx.recv()
            .map_err(|_| GpuError::Sync("map callback dropped".into()))?
            .map_err(|e| GpuError::Sync(e.to_string()))?;

        let data = slice.get_mapped_range();
        for (px, bytes) in output.iter_mut().zip(data.chunks_exact(4)) {
            *px = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        drop(data);
        buffer.unmap();
        Ok(())
    }
}

/// Map an error captured while building the pipeline
fn compile_result(path: &Path, captured: Option<wgpu::Error>) -> Result<(), KernelError> {
    match captured {
        Some(error) => Err(KernelError::Compile {
            path: path.to_path_buf(),
            message: error.to_string(),
        }),
        None => Ok(()),
    }
}

impl SampleKernel<WgpuDevice> for WgpuKernel {
    fn sample(
        &self,
        view: &WgpuView<'_>,
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

        let desc = view.descriptor();
        if level < desc.first_level || level > desc.last_level {
            return Err(KernelError::LevelOutOfRange {
                level,
                first: desc.first_level,
                last: desc.last_level,
            });
        }

        // The view's first level is lod 0
        let params: Vec<u8> = [level - desc.first_level, extent.width, extent.height, 0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let params_buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("bcmip draw_mip params"),
            size: params.len() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&params_buffer, 0, &params);

        let output_size = needed * 4;
        let output_buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("bcmip draw_mip output"),
            size: output_size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("bcmip draw_mip staging"),
            size: output_size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // A replacement module with other bindings fails here
        let scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bcmip draw_mip bindings"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view.texture_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(view.sampler()),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: output_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("bcmip draw_mip encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("bcmip draw_mip pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                extent.width.div_ceil(WORKGROUP_SIZE),
                extent.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(KernelError::Dispatch {
                level,
                message: error.to_string(),
            });
        }

        self.read_back(&staging_buffer, output)?;

        debug!(
            "GPU kernel: level {} of {} storage -> {}",
            level,
            view.storage_extent(),
            extent
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        BlockCopy, FilterMode, GpuDevice, ResourceDescriptor, SamplingViewDescriptor,
    };
    use wgpu::TextureFormat;

    #[test]
    fn test_builtin_kernel_entry_point() {
        assert!(BUILTIN_KERNEL.contains(&format!("fn {}(", ENTRY_POINT)));
        let workgroup = format!("@workgroup_size({0}, {0})", WORKGROUP_SIZE);
        assert!(BUILTIN_KERNEL.contains(&workgroup));
    }

    #[test]
    fn test_compile_result_maps_captured_error() {
        let path = Path::new("kernels/bad.wgsl");
        assert!(compile_result(path, None).is_ok());

        let captured = wgpu::Error::Validation {
            source: Box::new(std::io::Error::other("entry point draw_mip not found")),
            description: "Shader validation error: entry point draw_mip not found".into(),
        };
        match compile_result(path, Some(captured)) {
            Err(KernelError::Compile { path: p, message }) => {
                assert_eq!(p, PathBuf::from("kernels/bad.wgsl"));
                assert!(message.contains("draw_mip not found"), "{}", message);
            }
            other => panic!("expected a compile error, got {:?}", other),
        }
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_invalid_kernel_module_is_an_error() {
        let device = WgpuDevice::new().expect("Failed to create device");
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("bad.wgsl");
        std::fs::write(&path, "fn not_the_entry_point() {}").unwrap();

        let err = match WgpuKernel::new(&device, Some(&path)) {
            Err(e) => e,
            Ok(_) => panic!("a module without draw_mip must be rejected"),
        };
        assert!(matches!(err, KernelError::Compile { .. }));
    }

    #[test]
    #[ignore] // Requires GPU
    fn test_draw_solid_bc1_block() {
        let device = WgpuDevice::new().expect("Failed to create device");
        if !device.capabilities().native_block_formats {
            return;
        }
        let extent = Extent2d::new(4, 4);
        let res = device
            .create_mip_resource(&ResourceDescriptor {
                format: TextureFormat::Bc1RgbaUnorm,
                channel_count: 4,
                extent,
                level_count: 1,
            })
            .unwrap();
        let level = device.resolve_level(&res, 0).unwrap();
        let copy = BlockCopy {
            src_pitch: 8,
            row_bytes: 8,
            rows: 1,
            texel_extent: extent,
        };
        device
            .copy_to_level(&res, &level, &copy, &[0x00, 0xF8, 0x00, 0xF8, 0, 0, 0, 0])
            .unwrap();
        device.synchronize().unwrap();

        let view = device
            .create_sampling_view(
                &res,
                &SamplingViewDescriptor {
                    format: TextureFormat::Bc1RgbaUnorm,
                    extent,
                    normalized_coords: true,
                    filter: FilterMode::Nearest,
                    mip_filter: FilterMode::Nearest,
                    degamma: false,
                    first_level: 0,
                    last_level: 0,
                },
            )
            .unwrap();

        let kernel = WgpuKernel::new(&device, None).unwrap();
        let mut out = vec![0u32; 64];
        kernel.sample(&view, 0, &mut out, Extent2d::new(8, 8)).unwrap();
        assert_eq!(out[0].to_le_bytes(), [255, 0, 0, 255]);
    }
}
