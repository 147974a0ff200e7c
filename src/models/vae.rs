//! Image encoders used for latent conditioning

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use log::info;

/// Encodes images into scaled-down latents.
///
/// Implementations return a sample of the latent distribution, before the
/// scaling factor is applied.
pub trait LatentEncoder: Send + Sync {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;

    fn scaling_factor(&self) -> f64;

    fn block_out_channels(&self) -> &[usize];

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Spatial reduction between image and latent.
    fn downsample_factor(&self) -> usize {
        1 << self.block_out_channels().len().saturating_sub(1)
    }
}

/// The SD/SDXL KL autoencoder, encoder half only in practice.
pub struct ConditioningVae {
    vae: AutoEncoderKL,
    block_out_channels: Vec<usize>,
    scaling_factor: f64,
    device: Device,
    dtype: DType,
}

impl ConditioningVae {
    /// SD 1.x/2.x layout with a 0.18215 scaling factor.
    pub fn sd_config() -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }

    pub fn new(vb: VarBuilder, config: AutoEncoderKLConfig, scaling_factor: f64) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let block_out_channels = config.block_out_channels.clone();
        let vae = AutoEncoderKL::new(vb, 3, 3, config)?;
        Ok(Self {
            vae,
            block_out_channels,
            scaling_factor,
            device,
            dtype,
        })
    }

    pub fn from_safetensors(
        path: impl AsRef<Path>,
        config: AutoEncoderKLConfig,
        scaling_factor: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading conditioning VAE from {}", path.display());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
        Self::new(vb, config, scaling_factor)
    }
}

impl LatentEncoder for ConditioningVae {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        self.vae.encode(images)?.sample()
    }

    fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    fn block_out_channels(&self) -> &[usize] {
        &self.block_out_channels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
