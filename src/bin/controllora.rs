//! Builds adapted ControlNets from a base UNet and inspects their checkpoints
//!
//! Usage:
//!   controllora init --config run.yaml
//!   controllora inspect out/diffusion_pytorch_model.safetensors

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use log::info;

use controllora::checkpoint::{self, CONFIG_METADATA_KEY};
use controllora::config::parse_device;
use controllora::models::params::is_adapter_path;
use controllora::{load_run_config, ControlLoraConfig, ControlLoraModel, UNet2DConditionModel};

#[derive(Parser, Debug)]
#[command(author, version, about = "ControlNet with low-rank adapters tied to a base UNet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an adapted ControlNet from the UNet in a run config and save it
    Init {
        /// Path to the run configuration YAML file
        #[arg(long)]
        config: PathBuf,

        /// Device override (cpu, cuda, cuda:1)
        #[arg(long)]
        device: Option<String>,
    },

    /// List the tensors and configuration stored in a checkpoint
    Inspect {
        /// safetensors file written by `init` or `save_checkpoint`
        checkpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    controllora::logging::init_logger();

    match Cli::parse().command {
        Commands::Init { config, device } => init(config, device),
        Commands::Inspect { checkpoint } => inspect(checkpoint),
    }
}

fn init(config_path: PathBuf, device_override: Option<String>) -> Result<()> {
    let run = load_run_config(&config_path)?;
    let device = match device_override {
        Some(name) => parse_device(&name)?,
        None => run.device()?,
    };
    let dtype = run.dtype()?;
    let (unet_config, unet_weights) = run.unet.paths()?;

    info!("Starting init with config: {}", config_path.display());
    let unet = UNet2DConditionModel::load(&unet_config, &unet_weights, &device, dtype)
        .with_context(|| format!("Failed to load UNet from {}", unet_weights.display()))?;

    let model = ControlLoraModel::from_unet(&unet, run.control_lora.clone())
        .context("Failed to build the adapted ControlNet")?;

    let state = model.state_dict();
    let adapters = state.keys().filter(|k| is_adapter_path(k)).count();
    let trainable: usize = model
        .trainable_parameters()
        .values()
        .map(|var| var.elem_count())
        .sum();
    info!(
        "{} persisted tensors ({} adapter), {} trainable values",
        state.len(),
        adapters,
        trainable
    );

    model
        .save_pretrained(&run.output_dir)
        .with_context(|| format!("Failed to write {}", run.output_dir.display()))?;
    info!("Init completed successfully");
    Ok(())
}

fn inspect(path: PathBuf) -> Result<()> {
    let (state, metadata) = checkpoint::load(&path, &Device::Cpu)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;

    for (name, tensor) in &state {
        println!("{name:<90} {:?} {:?}", tensor.dims(), tensor.dtype());
    }

    let adapters = state.keys().filter(|k| is_adapter_path(k)).count();
    println!();
    println!("{} tensors: {} adapter, {} other", state.len(), adapters, state.len() - adapters);

    match metadata.get(CONFIG_METADATA_KEY) {
        Some(raw) => {
            let config: ControlLoraConfig =
                serde_json::from_str(raw).context("Embedded configuration is not valid")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => println!("No embedded configuration"),
    }
    Ok(())
}
