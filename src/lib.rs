//! bcmip - block-compressed mip provisioning
//!
//! Places a block-compressed texture and its full mip chain on the GPU under
//! either the native or the emulated storage layout, then samples every usable
//! level back into images to verify the upload.

pub mod config;
pub mod container;
pub mod error;
pub mod format;
pub mod geometry;
pub mod gpu;
pub mod layout;
pub mod pipeline;
pub mod provision;
pub mod sampler;
pub mod transfer;

pub use config::{DeviceSelection, PipelineConfig};
pub use error::PipelineError;
pub use layout::{PolicyKind, PolicySelection};
pub use pipeline::{Pipeline, RunReport};
