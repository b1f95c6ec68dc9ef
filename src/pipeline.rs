//! End-to-end verification run
//!
//! Parse, provision, transfer, synchronize, then sample every usable level
//! to an image. Teardown is reverse acquisition order: the sampling view is
//! released before the resource, the resource before the device.

use crate::container::{self, CompressedTexture};
use crate::error::PipelineError;
use crate::format::FormatVariant;
use crate::geometry::Extent2d;
use crate::gpu::GpuDevice;
use crate::layout::{PolicyKind, PolicySelection};
use crate::provision::provision;
use crate::sampler::{output_path, view_descriptor, write_png, SampleKernel};
use crate::transfer::transfer_all;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub policy: PolicyKind,
    pub variant: FormatVariant,
    pub extent: Extent2d,
    /// Levels declared by the container
    pub level_count: u32,
    /// Levels provisioned, transferred and sampled
    pub usable_levels: u32,
    pub bytes_transferred: u64,
    /// One image per usable level, ascending
    pub outputs: Vec<PathBuf>,
}

/// Images written by the current run, removed unless the run completes
struct OutputSet {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl OutputSet {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn commit(mut self) -> Vec<PathBuf> {
        self.committed = true;
        std::mem::take(&mut self.paths)
    }
}

impl Drop for OutputSet {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove partial output {}: {}", path.display(), e);
            }
        }
    }
}

/// Provisioning and verification pipeline bound to one device and kernel
pub struct Pipeline<D: GpuDevice, K: SampleKernel<D>> {
    device: D,
    kernel: K,
    policy: PolicyKind,
    output_dir: PathBuf,
    output_extent: Extent2d,
}

impl<D: GpuDevice, K: SampleKernel<D>> Pipeline<D, K> {
    /// Bind a device and kernel; the policy is resolved here, once
    pub fn new(
        device: D,
        kernel: K,
        policy: PolicySelection,
        output_dir: impl Into<PathBuf>,
        output_extent: Extent2d,
    ) -> Self {
        let caps = device.capabilities();
        let policy = policy.resolve(caps.native_block_formats);
        info!(
            "Layout policy: {} (native block formats: {})",
            policy, caps.native_block_formats
        );

        Self {
            device,
            kernel,
            policy,
            output_dir: output_dir.into(),
            output_extent,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Parse a container file and run it
    pub fn run_file(&self, path: &Path) -> Result<RunReport, PipelineError> {
        info!("Loading {}", path.display());
        let texture = container::parse(path)?;
        self.run(texture)
    }

    /// Provision, transfer and sample a parsed texture
    pub fn run(&self, texture: CompressedTexture) -> Result<RunReport, PipelineError> {
        let policy = self.policy.policy();
        let CompressedTexture {
            extent,
            format,
            levels,
        } = texture;
        let level_count = levels.len() as u32;

        info!(
            "{} {} with {} levels, {} policy",
            extent, format.variant, level_count, self.policy
        );

        let provisioned = provision(&self.device, extent, level_count, &format, policy)?;
        let usable_levels = provisioned.usable_level_count();

        let bytes_transferred =
            transfer_all(&self.device, &provisioned, levels, extent, &format, policy)?;

        self.device.synchronize().map_err(PipelineError::Sync)?;

        let view_desc = view_descriptor(extent, usable_levels, &format, policy);
        debug!("Sampling view: {:?}", view_desc);
        let view = self
            .device
            .create_sampling_view(&provisioned.resource, &view_desc)
            .map_err(PipelineError::View)?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| PipelineError::Output {
            path: self.output_dir.clone(),
            source: image::ImageError::IoError(e),
        })?;

        let mut written = OutputSet::new();
        let mut pixels = vec![0u32; self.output_extent.area() as usize];
        for level in 0..usable_levels {
            self.kernel
                .sample(&view, level, &mut pixels, self.output_extent)
                .map_err(|source| PipelineError::Kernel { level, source })?;

            let path = output_path(&self.output_dir, policy.output_tag(), level);
            write_png(&path, &pixels, self.output_extent).map_err(|source| {
                PipelineError::Output {
                    path: path.clone(),
                    source,
                }
            })?;
            written.push(path);
        }

        drop(view);
        drop(provisioned);

        let outputs = written.commit();
        info!(
            "Verified {} of {} levels ({} bytes transferred) into {}",
            usable_levels,
            level_count,
            bytes_transferred,
            self.output_dir.display()
        );

        Ok(RunReport {
            policy: self.policy,
            variant: format.variant,
            extent,
            level_count,
            usable_levels,
            bytes_transferred,
            outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests::{build_dds, build_full_chain, patterned_payload};
    use crate::container::{parse_bytes, CompressedLevel};
    use crate::error::{KernelError, TransferError};
    use crate::geometry::level_byte_size;
    use crate::gpu::{DeviceEvent, HostCapabilities, HostDevice, HostKernel, HostView};
    use crate::layout::{Emulated, LayoutPolicy, Native};
    use crate::sampler::tests::StubKernel;
    use image_dds::ddsfile::DxgiFormat;
    use tempfile::TempDir;

    const SMALL: Extent2d = Extent2d::new(8, 8);

    fn host() -> HostDevice {
        HostDevice::new(HostCapabilities::default())
    }

    fn pipeline(
        device: HostDevice,
        policy: PolicySelection,
        dir: &Path,
    ) -> Pipeline<HostDevice, StubKernel> {
        Pipeline::new(device, StubKernel, policy, dir, SMALL)
    }

    fn texture(width: u32, height: u32, variant: FormatVariant) -> CompressedTexture {
        parse_bytes(&build_full_chain(width, height, variant)).unwrap()
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Fails once it reaches `fail_at`
    struct FailingKernel {
        fail_at: u32,
    }

    impl SampleKernel<HostDevice> for FailingKernel {
        fn sample(
            &self,
            view: &HostView<'_>,
            level: u32,
            output: &mut [u32],
            extent: Extent2d,
        ) -> Result<(), KernelError> {
            if level == self.fail_at {
                return Err(KernelError::Decode {
                    level,
                    message: "injected".into(),
                });
            }
            StubKernel.sample(view, level, output, extent)
        }
    }

    #[test]
    fn test_scenario_a_native_and_emulated_level_counts() {
        let temp = TempDir::new().unwrap();

        let native = pipeline(host(), PolicySelection::Native, temp.path());
        let report = native.run(texture(1024, 1024, FormatVariant::BC4Unorm)).unwrap();
        assert_eq!(report.level_count, 11);
        assert_eq!(report.usable_levels, 11);
        assert_eq!(report.outputs.len(), 11);

        let emulated = pipeline(host(), PolicySelection::Emulated, temp.path());
        let report = emulated.run(texture(1024, 1024, FormatVariant::BC4Unorm)).unwrap();
        assert_eq!(report.usable_levels, 9);
        assert_eq!(
            report.outputs.last().unwrap().file_name().unwrap(),
            "emulated_mip_08.png"
        );
    }

    #[test]
    fn test_scenario_b_non_power_of_two_native() {
        let temp = TempDir::new().unwrap();
        let bytes = build_full_chain(37, 27, FormatVariant::BC1Unorm);
        let tex = parse_bytes(&bytes).unwrap();
        let expected: u64 = tex.levels.iter().map(|l| l.byte_size() as u64).sum();

        let p = pipeline(host(), PolicySelection::Native, temp.path());
        let report = p.run(tex).unwrap();
        assert_eq!(report.usable_levels, 6);
        assert_eq!(report.bytes_transferred, expected);
        assert_eq!(p.device().copies(), 6);
    }

    #[test]
    fn test_scenario_c_short_level_aborts_without_outputs() {
        let temp = TempDir::new().unwrap();
        let mut tex = texture(64, 64, FormatVariant::BC3Unorm);
        tex.levels[3].payload.truncate(40);

        let p = pipeline(host(), PolicySelection::Native, temp.path());
        let err = p.run(tex).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transfer(TransferError::PayloadTooSmall { level: 3, .. })
        ));
        assert_eq!(p.device().copies(), 3);
        assert!(files_in(temp.path()).is_empty());
        assert_eq!(
            p.device().events(),
            vec![
                DeviceEvent::CreateResource { id: 0 },
                DeviceEvent::DestroyResource { id: 0 },
            ]
        );
    }

    #[test]
    fn test_scenario_d_unsupported_format_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("rgba.dds");
        std::fs::write(
            &input,
            build_dds(4, 4, 1, DxgiFormat::R8G8B8A8_UNorm, vec![0u8; 64]),
        )
        .unwrap();

        let out = temp.path().join("out");
        let p = pipeline(host(), PolicySelection::Auto, &out);
        let err = p.run_file(&input).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
        assert!(err.is_pre_gpu());
        assert!(p.device().events().is_empty());
        assert!(!out.exists());
    }

    #[test]
    fn test_teardown_order() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(host(), PolicySelection::Native, temp.path());
        p.run(texture(16, 16, FormatVariant::BC7Unorm)).unwrap();
        assert_eq!(
            p.device().events(),
            vec![
                DeviceEvent::CreateResource { id: 0 },
                DeviceEvent::CreateView { resource: 0 },
                DeviceEvent::DestroyView { resource: 0 },
                DeviceEvent::DestroyResource { id: 0 },
            ]
        );
    }

    #[test]
    fn test_policy_tags_do_not_collide() {
        let temp = TempDir::new().unwrap();
        pipeline(host(), PolicySelection::Native, temp.path())
            .run(texture(16, 16, FormatVariant::BC1Unorm))
            .unwrap();
        pipeline(host(), PolicySelection::Emulated, temp.path())
            .run(texture(16, 16, FormatVariant::BC1Unorm))
            .unwrap();

        assert_eq!(
            files_in(temp.path()),
            vec![
                "emulated_mip_00.png",
                "emulated_mip_01.png",
                "emulated_mip_02.png",
                "native_mip_00.png",
                "native_mip_01.png",
                "native_mip_02.png",
                "native_mip_03.png",
                "native_mip_04.png",
            ]
        );
    }

    #[test]
    fn test_auto_policy_follows_capabilities() {
        let temp = TempDir::new().unwrap();
        let legacy = HostDevice::new(HostCapabilities {
            native_block_formats: false,
            ..HostCapabilities::default()
        });
        let p = pipeline(legacy, PolicySelection::Auto, temp.path());
        assert_eq!(p.policy(), PolicyKind::Emulated);
        let report = p.run(texture(32, 32, FormatVariant::BC5Unorm)).unwrap();
        assert_eq!(report.usable_levels, 4);

        let p = pipeline(host(), PolicySelection::Auto, temp.path());
        assert_eq!(p.policy(), PolicyKind::Native);
    }

    #[test]
    fn test_kernel_failure_removes_partial_outputs() {
        let temp = TempDir::new().unwrap();
        let p = Pipeline::new(
            host(),
            FailingKernel { fail_at: 2 },
            PolicySelection::Native,
            temp.path(),
            SMALL,
        );
        let err = p.run(texture(16, 16, FormatVariant::BC1Unorm)).unwrap_err();
        assert!(matches!(err, PipelineError::Kernel { level: 2, .. }));
        assert!(files_in(temp.path()).is_empty());
    }

    #[test]
    fn test_outputs_hold_kernel_pixels() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(host(), PolicySelection::Native, temp.path());
        let report = p.run(texture(8, 8, FormatVariant::BC4Unorm)).unwrap();

        let img = image::open(&report.outputs[2]).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (SMALL.width, SMALL.height));
        assert_eq!(
            u32::from_le_bytes(img.get_pixel(5, 3).0),
            StubKernel::pixel(2, 5, 3)
        );
    }

    /// Stored blocks read back through the view equal the source payload
    fn assert_round_trip(policy: &dyn LayoutPolicy, variant: FormatVariant, base: Extent2d) {
        let device = host();
        let fmt = variant.descriptor();
        let count = crate::geometry::full_chain_len(base);
        let data = patterned_payload(base, count, fmt.block_stride);

        let mut offset = 0usize;
        let levels: Vec<CompressedLevel> = (0..count)
            .map(|index| {
                let extent = base.mip(index);
                let size = level_byte_size(extent, fmt.block_stride) as usize;
                let payload = data[offset..offset + size].to_vec();
                offset += size;
                CompressedLevel {
                    index,
                    extent,
                    payload,
                }
            })
            .collect();
        let originals = levels.clone();

        let tex = provision(&device, base, count, &fmt, policy).unwrap();
        transfer_all(&device, &tex, levels, base, &fmt, policy).unwrap();
        let view_desc = view_descriptor(base, tex.usable_level_count(), &fmt, policy);
        let view = device.create_sampling_view(&tex.resource, &view_desc).unwrap();

        let stride = fmt.block_stride as usize;
        for level in 0..tex.usable_level_count() {
            let original = &originals[level as usize];
            let stored = device.level_extent(&tex.levels[level as usize]);
            // Native stores pixels, emulated stores the block grid directly
            let grid = if policy.kind() == PolicyKind::Native {
                stored.block_grid()
            } else {
                stored
            };
            let host_row = original.extent.block_grid().width as usize * stride;
            for by in 0..grid.height {
                for bx in 0..grid.width {
                    let start = by as usize * host_row + bx as usize * stride;
                    assert_eq!(
                        view.block(level, bx, by).unwrap(),
                        original.payload[start..start + stride].to_vec(),
                        "{} level {} block ({}, {})",
                        policy.kind(),
                        level,
                        bx,
                        by
                    );
                }
            }
        }
    }

    #[test]
    fn test_round_trip_native() {
        assert_round_trip(&Native, FormatVariant::BC1Unorm, Extent2d::new(37, 27));
        assert_round_trip(&Native, FormatVariant::BC7UnormSrgb, Extent2d::new(64, 32));
    }

    #[test]
    fn test_round_trip_emulated() {
        assert_round_trip(&Emulated, FormatVariant::BC4Snorm, Extent2d::new(37, 27));
        assert_round_trip(&Emulated, FormatVariant::BC6HUfloat, Extent2d::new(128, 128));
    }

    #[test]
    fn test_host_kernel_end_to_end() {
        let temp = TempDir::new().unwrap();
        // 8x8 BC1, every block solid red, single level
        let block = [0x00u8, 0xF8, 0x00, 0xF8, 0, 0, 0, 0];
        let data: Vec<u8> = block.iter().copied().cycle().take(4 * 8).collect();
        let input = temp.path().join("red.dds");
        std::fs::write(&input, build_dds(8, 8, 1, DxgiFormat::BC1_UNorm, data)).unwrap();

        let out = temp.path().join("out");
        let p = Pipeline::new(host(), HostKernel, PolicySelection::Native, &out, SMALL);
        let report = p.run_file(&input).unwrap();
        assert_eq!(report.outputs.len(), 1);

        let img = image::open(&report.outputs[0]).unwrap().to_rgba8();
        assert!(img.pixels().all(|p| p.0 == [255, 0, 0, 255]));
    }
}
