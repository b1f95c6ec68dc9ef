//! Verification sampling and image output
//!
//! A kernel draws one mip level through a sampling view into a packed RGBA8
//! buffer; the buffer is then written as a PNG named after the layout policy
//! and level so runs under both policies can share an output directory.

use crate::error::KernelError;
use crate::format::FormatDescriptor;
use crate::geometry::Extent2d;
use crate::gpu::{FilterMode, GpuDevice, SamplingViewDescriptor};
use crate::layout::LayoutPolicy;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default output image size
pub const DEFAULT_OUTPUT_EXTENT: Extent2d = Extent2d::new(1024, 1024);

/// Draws one level of a sampling view into an RGBA8 buffer
///
/// `output` holds `extent.area()` pixels, row-major, each packed as
/// little-endian `[r, g, b, a]`. The call blocks until the buffer is filled.
pub trait SampleKernel<D: GpuDevice> {
    fn sample(
        &self,
        view: &D::View<'_>,
        level: u32,
        output: &mut [u32],
        extent: Extent2d,
    ) -> Result<(), KernelError>;
}

/// Sampling view over every usable level
///
/// Point sampling within and across levels, normalized coordinates, gamma
/// decode when the format carries display gamma.
pub fn view_descriptor(
    base: Extent2d,
    usable_levels: u32,
    format: &FormatDescriptor,
    policy: &dyn LayoutPolicy,
) -> SamplingViewDescriptor {
    SamplingViewDescriptor {
        format: format.view_format,
        extent: policy.sample_view_extent(base),
        normalized_coords: true,
        filter: FilterMode::Nearest,
        mip_filter: FilterMode::Nearest,
        degamma: format.degamma,
        first_level: 0,
        last_level: usable_levels.saturating_sub(1),
    }
}

/// Output file for one level, e.g. `native_mip_03.png`
pub fn output_path(dir: &Path, tag: &str, level: u32) -> PathBuf {
    dir.join(format!("{}_mip_{:02}.png", tag, level))
}

/// Write packed RGBA8 pixels as a PNG, replacing `path` only once complete
pub fn write_png(path: &Path, pixels: &[u32], extent: Extent2d) -> Result<(), image::ImageError> {
    let bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
    let img = image::RgbaImage::from_raw(extent.width, extent.height, bytes).ok_or_else(|| {
        image::ImageError::Parameter(image::error::ParameterError::from_kind(
            image::error::ParameterErrorKind::DimensionMismatch,
        ))
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        img.write_to(&mut writer, image::ImageFormat::Png)?;
        writer.flush()?;
    }
    temp.persist(path).map_err(|e| image::ImageError::IoError(e.error))?;

    debug!("Wrote {} ({})", path.display(), extent);
    Ok(())
}
