//! Pipeline error taxonomy
//!
//! Every stage reports its own error kind. GPU failures are wrapped with the
//! operation that raised them so the final message names the failing call.

use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::format::UnsupportedFormatError;
use crate::geometry::Extent2d;
use crate::gpu::GpuError;
use std::path::PathBuf;

/// Failure of a level transfer
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("level {level}: payload holds {available} bytes but the transfer needs {required}")]
    PayloadTooSmall {
        level: u32,
        required: u64,
        available: u64,
    },

    #[error("level {level}: device block grid {device} exceeds host block grid {host}")]
    GeometryMismatch {
        level: u32,
        device: Extent2d,
        host: Extent2d,
    },

    #[error("copy to level {level} failed")]
    Copy {
        level: u32,
        #[source]
        source: GpuError,
    },
}

/// Failure of the sampling kernel
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("failed to load kernel module {path}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel module {path} rejected: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("kernel dispatch for level {level} rejected: {message}")]
    Dispatch { level: u32, message: String },

    #[error("output buffer holds {len} pixels, extent {extent} needs {needed}")]
    OutputSize {
        len: usize,
        extent: Extent2d,
        needed: u64,
    },

    #[error("level {level} is outside the view's mip range {first}..={last}")]
    LevelOutOfRange { level: u32, first: u32, last: u32 },

    #[error("failed to decode level {level}: {message}")]
    Decode { level: u32, message: String },

    #[error(transparent)]
    Device(#[from] GpuError),
}

/// Any failure that aborts a pipeline run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("invalid container")]
    Format(#[source] ContainerError),

    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormatError),

    #[error("create mipmapped resource ({operation}) failed")]
    ResourceCreation {
        operation: String,
        #[source]
        source: GpuError,
    },

    #[error("resolve level {level} of mipmapped resource failed")]
    Subresource {
        level: u32,
        #[source]
        source: GpuError,
    },

    #[error("transfer failed")]
    Transfer(#[from] TransferError),

    #[error("synchronize device failed")]
    Sync(#[source] GpuError),

    #[error("create sampling view failed")]
    View(#[source] GpuError),

    #[error("sample level {level} failed")]
    Kernel {
        level: u32,
        #[source]
        source: KernelError,
    },

    #[error("write {path} failed")]
    Output {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl From<ContainerError> for PipelineError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Unsupported(e) => PipelineError::UnsupportedFormat(e),
            other => PipelineError::Format(other),
        }
    }
}

impl PipelineError {
    /// True for failures raised before any GPU resource exists
    pub fn is_pre_gpu(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_)
                | PipelineError::Format(_)
                | PipelineError::UnsupportedFormat(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_container_maps_to_unsupported_format() {
        let err: PipelineError =
            ContainerError::Unsupported(UnsupportedFormatError("Rgba8Unorm".into())).into();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
        assert!(err.is_pre_gpu());

        let err: PipelineError = ContainerError::EmptyExtent(Extent2d::new(0, 4)).into();
        assert!(matches!(err, PipelineError::Format(_)));
    }

    #[test]
    fn test_messages_name_the_operation() {
        let err = PipelineError::Subresource {
            level: 3,
            source: GpuError::LevelOutOfRange {
                level: 3,
                level_count: 2,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("resolve level 3"), "{}", msg);
        assert!(!err.is_pre_gpu());

        let err = PipelineError::Transfer(TransferError::PayloadTooSmall {
            level: 3,
            required: 16,
            available: 8,
        });
        assert_eq!(err.to_string(), "transfer failed");
        let source = std::error::Error::source(&err).map(|e| e.to_string());
        assert!(source.unwrap().contains("needs 16"));
    }

    #[test]
    fn test_config_error_is_pre_gpu() {
        let err = PipelineError::from(ConfigError::InputNotFound(PathBuf::from("none.dds")));
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.is_pre_gpu());
        assert_eq!(err.to_string(), "invalid configuration");
    }

    #[test]
    fn test_reason_reported_once_in_chain() {
        let reason = "level 3: payload holds 40 bytes but the transfer needs 64";
        let err = anyhow::Error::from(PipelineError::Transfer(TransferError::PayloadTooSmall {
            level: 3,
            required: 64,
            available: 40,
        }))
        .context("Failed to verify tex.dds");
        let report = format!("{:?}", err);
        assert_eq!(report.matches(reason).count(), 1, "{}", report);

        let err = anyhow::Error::from(PipelineError::Kernel {
            level: 2,
            source: KernelError::Decode {
                level: 2,
                message: "bad block".into(),
            },
        });
        let report = format!("{:?}", err);
        assert_eq!(report.matches("bad block").count(), 1, "{}", report);
        assert!(report.starts_with("sample level 2 failed"), "{}", report);

        let err = anyhow::Error::from(PipelineError::Sync(GpuError::Sync("lost".into())));
        let report = format!("{:?}", err);
        assert_eq!(report.matches("lost").count(), 1, "{}", report);
    }
}
