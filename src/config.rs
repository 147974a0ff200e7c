//! YAML run configuration for the `controllora` tool

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::control_lora::FromUnetOptions;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunConfig {
    pub unet: UNetSource,
    #[serde(default)]
    pub control_lora: FromUnetOptions,
    pub output_dir: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

/// Where the base UNet comes from: a diffusers `unet/` directory, or an
/// explicit config/weights pair.
#[derive(Debug, Serialize, Deserialize)]
pub struct UNetSource {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub weights: Option<PathBuf>,
}

impl UNetSource {
    /// Resolved `(config.json, weights)` paths.
    pub fn paths(&self) -> Result<(PathBuf, PathBuf)> {
        match (&self.dir, &self.config, &self.weights) {
            (_, Some(config), Some(weights)) => Ok((config.clone(), weights.clone())),
            (Some(dir), None, None) => Ok((
                dir.join(crate::models::unet::CONFIG_NAME),
                dir.join(crate::models::unet::WEIGHTS_NAME),
            )),
            _ => bail!("unet needs either `dir` or both `config` and `weights`"),
        }
    }
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_dtype() -> String {
    "f32".to_string()
}

impl RunConfig {
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    pub fn dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }
}

pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RunConfig = serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// `cpu`, `cuda` or `cuda:<ordinal>`.
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("Invalid CUDA ordinal in device `{other}`"))?;
                Ok(Device::new_cuda(ordinal)?)
            }
            None => bail!("Unknown device `{other}`"),
        },
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" | "fp16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => bail!("Unsupported dtype `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ChannelOrder;

    #[test]
    fn test_load_run_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.yaml");
        fs::write(
            &path,
            r#"
unet:
  dir: /models/sd15/unet
control_lora:
  conditioning_embedding_out_channels: [16, 32, 96, 256]
  controlnet_conditioning_channel_order: bgr
  adapter_linear_rank: 16
  use_conditioning_latent: true
output_dir: out/controllora
dtype: bf16
"#,
        )?;
        let config = load_run_config(&path)?;
        assert_eq!(config.control_lora.lora_linear_rank, 16);
        assert_eq!(config.control_lora.lora_conv2d_rank, 0);
        assert_eq!(config.control_lora.controlnet_conditioning_channel_order, ChannelOrder::Bgr);
        assert!(config.control_lora.use_conditioning_latent);
        assert_eq!(config.dtype()?, DType::BF16);
        assert!(config.device()?.is_cpu());
        let (cfg, weights) = config.unet.paths()?;
        assert_eq!(cfg, PathBuf::from("/models/sd15/unet/config.json"));
        assert!(weights.ends_with("diffusion_pytorch_model.safetensors"));
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_device("tpu").is_err());
        assert!(parse_device("cuda:x").is_err());
        assert!(parse_dtype("int8").is_err());
        let source = UNetSource {
            dir: None,
            config: Some(PathBuf::from("c.json")),
            weights: None,
        };
        assert!(source.paths().is_err());
    }
}
