//! Block-compressed DDS container parsing
//!
//! Reads the header, resolves the compression tag and splits the payload into
//! one owned buffer per mip level. Level 0 is full resolution and every
//! following level halves both dimensions down to 1x1.

use crate::format::{self, FormatDescriptor, UnsupportedFormatError};
use crate::geometry::{full_chain_len, level_byte_size, Extent2d};
use image_dds::ddsfile::{Caps2, Dds, MiscFlag};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One mip level's compressed blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedLevel {
    /// 0 = full resolution
    pub index: u32,
    pub extent: Extent2d,
    pub payload: Vec<u8>,
}

impl CompressedLevel {
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }
}

/// A parsed block-compressed texture with its full level payloads
#[derive(Debug, Clone)]
pub struct CompressedTexture {
    pub extent: Extent2d,
    pub format: FormatDescriptor,
    pub levels: Vec<CompressedLevel>,
}

impl CompressedTexture {
    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Hand the level payloads over, releasing the texture
    pub fn into_levels(self) -> Vec<CompressedLevel> {
        self.levels
    }
}

/// Malformed or unsupported container
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid DDS header")]
    Header(#[from] image_dds::ddsfile::Error),

    #[error("unrecognized DDS pixel format: {0}")]
    UnknownFormat(String),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedFormatError),

    #[error("texture has zero extent ({0})")]
    EmptyExtent(Extent2d),

    #[error("only single 2D textures are supported, found {0}")]
    UnsupportedLayout(String),

    #[error("{declared} mip levels declared but a {extent} texture has at most {max}")]
    TooManyLevels {
        declared: u32,
        max: u32,
        extent: Extent2d,
    },

    #[error("level {level} has zero byte size for extent {extent}")]
    EmptyLevel { level: u32, extent: Extent2d },

    #[error("payload truncated at level {level}: needs {expected} bytes, {available} left")]
    Truncated {
        level: u32,
        expected: u64,
        available: u64,
    },
}

impl ContainerError {
    /// True when the container is well-formed but its format has no table entry
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self, ContainerError::Unsupported(_))
    }
}

/// Parse a DDS file from disk
pub fn parse(path: &Path) -> Result<CompressedTexture, ContainerError> {
    let data = std::fs::read(path).map_err(|source| ContainerError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Read {} bytes from {}", data.len(), path.display());
    parse_bytes(&data)
}

/// Parse a DDS file held in memory
pub fn parse_bytes(data: &[u8]) -> Result<CompressedTexture, ContainerError> {
    let dds = Dds::read(Cursor::new(data))?;

    let image_format = image_dds::dds_image_format(&dds)
        .map_err(|e| ContainerError::UnknownFormat(format!("{:?}", e)))?;
    let format = format::lookup(image_format)?;

    let extent = Extent2d::new(dds.get_width(), dds.get_height());
    if extent.is_empty() {
        return Err(ContainerError::EmptyExtent(extent));
    }

    if dds.get_depth() > 1 {
        return Err(ContainerError::UnsupportedLayout(format!(
            "volume texture with depth {}",
            dds.get_depth()
        )));
    }

    let cube_dx10 = dds
        .header10
        .as_ref()
        .is_some_and(|h| h.misc_flag.contains(MiscFlag::TEXTURECUBE));
    if cube_dx10 || dds.header.caps2.contains(Caps2::CUBEMAP) {
        return Err(ContainerError::UnsupportedLayout("cube map".to_string()));
    }
    if dds.get_num_array_layers() > 1 {
        return Err(ContainerError::UnsupportedLayout(format!(
            "{} array layers",
            dds.get_num_array_layers()
        )));
    }

    let declared = dds.header.mip_map_count.unwrap_or(1).max(1);
    let max = full_chain_len(extent);
    if declared > max {
        return Err(ContainerError::TooManyLevels {
            declared,
            max,
            extent,
        });
    }

    let levels = split_levels(&dds.data, extent, declared, format.block_stride)?;

    debug!(
        "Parsed {} {} with {} levels ({} payload bytes)",
        extent,
        format.variant,
        levels.len(),
        dds.data.len()
    );

    Ok(CompressedTexture {
        extent,
        format,
        levels,
    })
}

/// Split a contiguous payload into per-level buffers
fn split_levels(
    payload: &[u8],
    extent: Extent2d,
    level_count: u32,
    block_stride: u32,
) -> Result<Vec<CompressedLevel>, ContainerError> {
    let mut levels = Vec::with_capacity(level_count as usize);
    let mut offset = 0usize;

    for index in 0..level_count {
        let level_extent = extent.mip(index);
        let size = level_byte_size(level_extent, block_stride);
        if size == 0 {
            return Err(ContainerError::EmptyLevel {
                level: index,
                extent: level_extent,
            });
        }

        let available = (payload.len() - offset) as u64;
        if size > available {
            return Err(ContainerError::Truncated {
                level: index,
                expected: size,
                available,
            });
        }

        let end = offset + size as usize;
        levels.push(CompressedLevel {
            index,
            extent: level_extent,
            payload: payload[offset..end].to_vec(),
        });
        offset = end;
    }

    if offset < payload.len() {
        debug!("Ignoring {} trailing payload bytes", payload.len() - offset);
    }

    Ok(levels)
}
