//! Pipeline configuration
//!
//! Defines everything a run needs. The device, kernel and policy are built
//! from this once and passed into the pipeline.

use crate::geometry::Extent2d;
use crate::layout::PolicySelection;
use crate::sampler::DEFAULT_OUTPUT_EXTENT;
use std::path::PathBuf;

/// Which device backend runs the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceSelection {
    /// GPU adapter through wgpu
    #[default]
    Wgpu,
    /// CPU-resident device model and reference kernel
    Host,
}

/// Configuration for a verification run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the DDS container
    pub input: PathBuf,

    /// Directory receiving one PNG per usable level
    pub output_dir: PathBuf,

    /// Layout policy request, resolved against the device
    pub policy: PolicySelection,

    pub device: DeviceSelection,

    /// Adapter index for the wgpu backend (auto-select when `None`)
    pub gpu_index: Option<usize>,

    /// WGSL kernel module replacing the built-in one
    pub kernel_path: Option<PathBuf>,

    /// Size of every output image
    pub output_extent: Extent2d,
}

impl PipelineConfig {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            policy: PolicySelection::default(),
            device: DeviceSelection::default(),
            gpu_index: None,
            kernel_path: None,
            output_extent: DEFAULT_OUTPUT_EXTENT,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.input.is_file() {
            return Err(ConfigError::InputNotFound(self.input.clone()));
        }

        if self.output_dir.exists() && !self.output_dir.is_dir() {
            return Err(ConfigError::OutputNotDirectory(self.output_dir.clone()));
        }

        if self.output_extent.is_empty() {
            return Err(ConfigError::EmptyOutputExtent(self.output_extent));
        }

        if let Some(kernel) = &self.kernel_path {
            if !kernel.is_file() {
                return Err(ConfigError::KernelNotFound(kernel.clone()));
            }
        }

        Ok(())
    }
}

/// Parse a `WIDTHxHEIGHT` size
pub fn parse_extent(s: &str) -> Result<Extent2d, ConfigError> {
    let invalid = || ConfigError::InvalidExtent(s.to_string());
    let (w, h) = s
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(invalid)?;
    let width = w.trim().parse::<u32>().map_err(|_| invalid())?;
    let height = h.trim().parse::<u32>().map_err(|_| invalid())?;
    let extent = Extent2d::new(width, height);
    if extent.is_empty() {
        return Err(ConfigError::EmptyOutputExtent(extent));
    }
    Ok(extent)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Output path is not a directory: {0}")]
    OutputNotDirectory(PathBuf),

    #[error("Output extent must be non-zero, got {0}")]
    EmptyOutputExtent(Extent2d),

    #[error("Invalid size '{0}', expected WIDTHxHEIGHT")]
    InvalidExtent(String),

    #[error("Kernel module not found: {0}")]
    KernelNotFound(PathBuf),
}
