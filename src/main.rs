//! bcmip - block-compressed mip provisioning and verification

use anyhow::{Context, Result};
use bcmip::config::parse_extent;
use bcmip::container;
use bcmip::geometry::Extent2d;
use bcmip::gpu::{
    list_gpus, GpuDevice, HostCapabilities, HostDevice, HostKernel, WgpuDevice, WgpuKernel,
};
use bcmip::layout::{Emulated, LayoutPolicy, Native};
use bcmip::sampler::{SampleKernel, DEFAULT_OUTPUT_EXTENT};
use bcmip::{
    DeviceSelection, Pipeline, PipelineConfig, PipelineError, PolicySelection, RunReport,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bcmip")]
#[command(version)]
#[command(about = "Provision block-compressed mip chains on the GPU and verify them by sampling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG for finer control)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a DDS texture and write one image per usable mip level
    Render {
        /// Path to the .dds file
        input: PathBuf,

        /// Directory for the level images
        #[arg(short, long, default_value = "mip_output")]
        output: PathBuf,

        /// Storage layout (auto picks native when the device supports it)
        #[arg(long, value_enum, env = "BCMIP_POLICY", default_value = "auto")]
        policy: PolicySelection,

        /// Device backend
        #[arg(long, value_enum, env = "BCMIP_DEVICE", default_value = "wgpu")]
        device: DeviceSelection,

        /// GPU adapter index (see list-gpus)
        #[arg(long)]
        gpu_index: Option<usize>,

        /// WGSL kernel module replacing the built-in one
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// Output image size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_extent)]
        size: Option<Extent2d>,
    },

    /// Show the layout of a DDS texture
    Info {
        /// Path to the .dds file
        input: PathBuf,
    },

    /// List available GPU adapters
    ListGpus,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "bcmip=debug" } else { "bcmip=info" };
    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(directive.parse()?)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Render {
            input,
            output,
            policy,
            device,
            gpu_index,
            kernel,
            size,
        } => {
            let mut config = PipelineConfig::new(input, output);
            config.policy = policy;
            config.device = device;
            config.gpu_index = gpu_index;
            config.kernel_path = kernel;
            config.output_extent = size.unwrap_or(DEFAULT_OUTPUT_EXTENT);
            config.validate().map_err(PipelineError::from)?;

            let report = match config.device {
                DeviceSelection::Wgpu => {
                    let device = WgpuDevice::with_gpu_index(config.gpu_index)
                        .context("Failed to initialize GPU device")?;
                    info!("Using GPU: {}", device.info());
                    let kernel = WgpuKernel::new(&device, config.kernel_path.as_deref())?;
                    let pipeline = Pipeline::new(
                        device,
                        kernel,
                        config.policy,
                        &config.output_dir,
                        config.output_extent,
                    );
                    run(&pipeline, &config)?
                }
                DeviceSelection::Host => {
                    if config.kernel_path.is_some() {
                        warn!("--kernel is ignored by the host device");
                    }
                    let pipeline = Pipeline::new(
                        HostDevice::new(HostCapabilities::default()),
                        HostKernel,
                        config.policy,
                        &config.output_dir,
                        config.output_extent,
                    );
                    run(&pipeline, &config)?
                }
            };

            println!("\n=== Verification Summary ===");
            println!("Texture:  {} {}", report.extent, report.variant);
            println!("Policy:   {}", report.policy);
            println!(
                "Levels:   {} of {} sampled",
                report.usable_levels, report.level_count
            );
            println!("Uploaded: {} bytes", report.bytes_transferred);
            for path in &report.outputs {
                println!("  {}", path.display());
            }
        }

        Commands::Info { input } => {
            let texture = container::parse(&input)
                .with_context(|| format!("Failed to parse {}", input.display()))?;
            let fmt = texture.format;

            println!("=== Texture Information ===");
            println!("File:          {}", input.display());
            println!("Extent:        {}", texture.extent);
            println!("Format:        {}", fmt.variant);
            println!("Storage:       {:?}", fmt.storage_format);
            println!("View:          {:?}", fmt.view_format);
            println!("Channels:      {}", fmt.channel_count);
            println!("Block stride:  {} bytes", fmt.block_stride);
            println!("Degamma:       {}", fmt.degamma);
            println!("Levels:        {}", texture.level_count());
            println!(
                "Usable:        {} native, {} emulated",
                Native.usable_level_count(texture.level_count()),
                Emulated.usable_level_count(texture.level_count())
            );
            println!();
            for level in &texture.levels {
                println!(
                    "  mip {:2}  {:>11}  {:>9} bytes",
                    level.index,
                    level.extent.to_string(),
                    level.byte_size()
                );
            }
        }

        Commands::ListGpus => {
            let gpus = list_gpus();
            if gpus.is_empty() {
                println!("No GPU adapters found");
            }
            for gpu in gpus {
                println!("[{}] {}", gpu.adapter_index, gpu);
            }
        }
    }

    Ok(())
}

fn run<D: GpuDevice, K: SampleKernel<D>>(
    pipeline: &Pipeline<D, K>,
    config: &PipelineConfig,
) -> Result<RunReport> {
    pipeline
        .run_file(&config.input)
        .with_context(|| format!("Failed to verify {}", config.input.display()))
}
