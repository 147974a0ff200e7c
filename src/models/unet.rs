//! Conditional 2D UNet, the base network ControlNet residuals are fed into

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use indexmap::IndexMap;
use log::info;
use serde::{Deserialize, Serialize};

use super::attention::attention_bias;
use super::blocks::{build_down_blocks, build_up_blocks, BlockContext, DownBlock2D, MidBlock2DCrossAttn, UpBlock2D};
use super::config::*;
use super::embeddings::{AddedConditions, TrunkEmbeddings};
use super::layers::{conv_config, Activation, Conv2d, Norm, ParamFactory};
use super::params::{self, join, Layer, LayerMut, LoadReport, ParamTree, StateDict};
use crate::error::{config_err, ControlLoraError, Result};

pub const CONFIG_NAME: &str = "config.json";
pub const WEIGHTS_NAME: &str = "diffusion_pytorch_model.safetensors";

/// diffusers `UNet2DConditionModel` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    #[serde(default)]
    pub sample_size: Option<usize>,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_in_channels")]
    pub out_channels: usize,
    #[serde(default)]
    pub center_input_sample: bool,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_down_block_types")]
    pub down_block_types: Vec<DownBlockType>,
    #[serde(default = "default_mid_block_type")]
    pub mid_block_type: Option<MidBlockType>,
    #[serde(default = "default_up_block_types")]
    pub up_block_types: Vec<UpBlockType>,
    #[serde(default = "default_only_cross_attention")]
    pub only_cross_attention: PerBlock<bool>,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_one")]
    pub downsample_padding: usize,
    #[serde(default = "default_scale_factor")]
    pub mid_block_scale_factor: f64,
    #[serde(default)]
    pub act_fn: Activation,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_cross_attention_dim")]
    pub cross_attention_dim: usize,
    #[serde(default = "default_transformer_layers")]
    pub transformer_layers_per_block: PerBlock<usize>,
    #[serde(default)]
    pub encoder_hid_dim: Option<usize>,
    #[serde(default)]
    pub encoder_hid_dim_type: Option<EncoderHidDimType>,
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: PerBlock<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<PerBlock<usize>>,
    #[serde(default)]
    pub use_linear_projection: bool,
    #[serde(default)]
    pub class_embed_type: Option<ClassEmbedType>,
    #[serde(default)]
    pub addition_embed_type: Option<AdditionEmbedType>,
    #[serde(default)]
    pub addition_time_embed_dim: Option<usize>,
    #[serde(default)]
    pub num_class_embeds: Option<usize>,
    #[serde(default)]
    pub upcast_attention: bool,
    #[serde(default)]
    pub resnet_time_scale_shift: TimeScaleShift,
    #[serde(default)]
    pub projection_class_embeddings_input_dim: Option<usize>,
    #[serde(default)]
    pub time_cond_proj_dim: Option<usize>,
}

fn default_up_block_types() -> Vec<UpBlockType> {
    vec![
        UpBlockType::UpBlock2D,
        UpBlockType::CrossAttnUpBlock2D,
        UpBlockType::CrossAttnUpBlock2D,
        UpBlockType::CrossAttnUpBlock2D,
    ]
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            sample_size: None,
            in_channels: default_in_channels(),
            out_channels: default_in_channels(),
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            down_block_types: default_down_block_types(),
            mid_block_type: default_mid_block_type(),
            up_block_types: default_up_block_types(),
            only_cross_attention: default_only_cross_attention(),
            block_out_channels: default_block_out_channels(),
            layers_per_block: default_layers_per_block(),
            downsample_padding: 1,
            mid_block_scale_factor: 1.0,
            act_fn: Activation::Silu,
            norm_num_groups: default_norm_num_groups(),
            norm_eps: default_norm_eps(),
            cross_attention_dim: default_cross_attention_dim(),
            transformer_layers_per_block: default_transformer_layers(),
            encoder_hid_dim: None,
            encoder_hid_dim_type: None,
            attention_head_dim: default_attention_head_dim(),
            num_attention_heads: None,
            use_linear_projection: false,
            class_embed_type: None,
            addition_embed_type: None,
            addition_time_embed_dim: None,
            num_class_embeds: None,
            upcast_attention: false,
            resnet_time_scale_shift: TimeScaleShift::Default,
            projection_class_embeddings_input_dim: None,
            time_cond_proj_dim: None,
        }
    }
}

impl UNetConfig {
    pub fn trunk(&self) -> Result<TrunkConfig> {
        let n = self.block_out_channels.len();
        let heads = self
            .num_attention_heads
            .as_ref()
            .unwrap_or(&self.attention_head_dim)
            .resolve(n, "num_attention_heads")?;
        let trunk = TrunkConfig {
            in_channels: self.in_channels,
            block_out_channels: self.block_out_channels.clone(),
            down_block_types: self.down_block_types.clone(),
            mid_block_type: self.mid_block_type,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            act_fn: self.act_fn,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            transformer_layers_per_block: self
                .transformer_layers_per_block
                .resolve(n, "transformer_layers_per_block")?,
            num_attention_heads: heads,
            only_cross_attention: self.only_cross_attention.resolve(n, "only_cross_attention")?,
            use_linear_projection: self.use_linear_projection,
            upcast_attention: self.upcast_attention,
            resnet_time_scale_shift: self.resnet_time_scale_shift,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            class_embed_type: self.class_embed_type,
            num_class_embeds: self.num_class_embeds,
            projection_class_embeddings_input_dim: self.projection_class_embeddings_input_dim,
            addition_embed_type: self.addition_embed_type,
            addition_time_embed_dim: self.addition_time_embed_dim,
            encoder_hid_dim: self.encoder_hid_dim,
            encoder_hid_dim_type: self.encoder_hid_dim_type,
            time_cond_proj_dim: self.time_cond_proj_dim,
        };
        trunk.validate()?;
        if self.up_block_types.len() != n {
            return Err(config_err(format!(
                "`up_block_types` has {} entries, `block_out_channels` has {n}",
                self.up_block_types.len()
            )));
        }
        if self.mid_block_type.is_none() {
            return Err(config_err("a UNet without a mid block is not supported"));
        }
        Ok(trunk)
    }
}

/// UNet forward inputs.
#[derive(Debug, Clone, Copy)]
pub struct UNetInput<'a> {
    pub sample: &'a Tensor,
    pub timestep: &'a Tensor,
    pub encoder_hidden_states: &'a Tensor,
    pub class_labels: Option<&'a Tensor>,
    pub timestep_cond: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Tensor>,
    pub added_cond: Option<&'a AddedConditions>,
    /// ControlNet residuals, one per skip connection.
    pub down_block_additional_residuals: Option<&'a [Tensor]>,
    pub mid_block_additional_residual: Option<&'a Tensor>,
}

impl<'a> UNetInput<'a> {
    pub fn new(sample: &'a Tensor, timestep: &'a Tensor, encoder_hidden_states: &'a Tensor) -> Self {
        Self {
            sample,
            timestep,
            encoder_hidden_states,
            class_labels: None,
            timestep_cond: None,
            attention_mask: None,
            added_cond: None,
            down_block_additional_residuals: None,
            mid_block_additional_residual: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UNet2DConditionModel {
    conv_in: Conv2d,
    embeddings: TrunkEmbeddings,
    down_blocks: Vec<DownBlock2D>,
    up_blocks: Vec<UpBlock2D>,
    mid_block: MidBlock2DCrossAttn,
    conv_norm_out: Norm,
    conv_out: Conv2d,
    config: UNetConfig,
    device: Device,
    dtype: DType,
}

impl UNet2DConditionModel {
    pub fn new(config: &UNetConfig, device: &Device, dtype: DType) -> Result<Self> {
        let trunk = config.trunk()?;
        let pf = ParamFactory::new(device, dtype);
        let first = trunk.block_out_channels[0];
        let model = Self {
            conv_in: Conv2d::new(trunk.in_channels, first, 3, conv_config(1, 1), true, &pf)?,
            embeddings: TrunkEmbeddings::new(&trunk, &pf)?,
            down_blocks: build_down_blocks(&trunk, &pf)?,
            up_blocks: build_up_blocks(&trunk, &config.up_block_types, &pf)?,
            mid_block: MidBlock2DCrossAttn::new(&trunk, &pf)?,
            conv_norm_out: Norm::group(trunk.norm_num_groups, first, trunk.norm_eps, &pf)?,
            conv_out: Conv2d::new(first, config.out_channels, 3, conv_config(1, 1), true, &pf)?,
            config: config.clone(),
            device: device.clone(),
            dtype,
        };
        info!(
            "Built UNet: {:?} channels, {} parameter tensors",
            config.block_out_channels,
            params::named_parameters(&model).len()
        );
        Ok(model)
    }

    /// Builds the UNet from a `config.json` and loads its weights strictly.
    pub fn load(
        config_path: impl AsRef<Path>,
        weights_path: impl AsRef<Path>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config_path = config_path.as_ref();
        let weights_path = weights_path.as_ref();
        info!("Loading UNet config from {}", config_path.display());
        let config: UNetConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let mut model = Self::new(&config, device, dtype)?;

        info!("Loading UNet weights from {}", weights_path.display());
        let tensors = candle_core::safetensors::load(weights_path, device)?;
        // safetensors come back unordered; sort so reports are stable.
        let mut state: StateDict = tensors.into_iter().collect::<IndexMap<_, _>>();
        state.sort_keys();
        model.load_state_dict(&state, true)?;
        Ok(model)
    }

    /// Reads a diffusers `unet/` directory.
    pub fn from_pretrained(dir: impl AsRef<Path>, device: &Device, dtype: DType) -> Result<Self> {
        let dir = dir.as_ref();
        Self::load(dir.join(CONFIG_NAME), dir.join(WEIGHTS_NAME), device, dtype)
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn state_dict(&self) -> StateDict {
        params::state_dict(self)
    }

    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<LoadReport> {
        params::load_state_dict(self, state, strict)
    }

    pub fn forward(&self, input: &UNetInput) -> Result<Tensor> {
        let batch = input.sample.dim(0)?;
        let dtype = input.sample.dtype();
        let (_, _, height, width) = input.sample.dims4()?;

        // Upsamplers need explicit sizes when the input is not a multiple of
        // the overall downsampling factor.
        let num_upsamplers = self.up_blocks.len().saturating_sub(1);
        let factor = 1usize << num_upsamplers;
        let forward_upsample_size = height % factor != 0 || width % factor != 0;

        let sample = if self.config.center_input_sample {
            input.sample.affine(2.0, -1.0)?
        } else {
            input.sample.clone()
        };

        let temb = self.embeddings.embed(
            input.timestep,
            batch,
            dtype,
            input.timestep_cond,
            input.class_labels,
            input.added_cond,
        )?;
        let encoder_hidden_states = self
            .embeddings
            .project_encoder_hidden_states(input.encoder_hidden_states)?;
        let bias = match input.attention_mask {
            Some(mask) => Some(attention_bias(mask, dtype)?),
            None => None,
        };
        let ctx = BlockContext {
            temb: &temb,
            encoder_hidden_states: &encoder_hidden_states,
            encoder_attention_bias: bias.as_ref(),
        };

        let mut xs = self.conv_in.forward(&sample)?;
        let mut skips = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, states) = block.forward(&xs, &ctx)?;
            skips.extend(states);
            xs = out;
        }

        if let Some(residuals) = input.down_block_additional_residuals {
            if residuals.len() != skips.len() {
                return Err(ControlLoraError::MissingInput(
                    "one ControlNet residual per skip connection",
                ));
            }
            skips = skips
                .iter()
                .zip(residuals)
                .map(|(skip, res)| skip + res)
                .collect::<candle_core::Result<Vec<_>>>()?;
        }

        xs = self.mid_block.forward(&xs, &ctx)?;
        if let Some(res) = input.mid_block_additional_residual {
            xs = (xs + res)?;
        }

        let last = self.up_blocks.len() - 1;
        for (i, block) in self.up_blocks.iter().enumerate() {
            let split = skips.len() - block.num_resnets();
            let block_skips = skips.split_off(split);
            let upsample_size = match skips.last() {
                Some(next) if i != last && forward_upsample_size => {
                    let (_, _, h, w) = next.dims4()?;
                    Some((h, w))
                }
                _ => None,
            };
            xs = block.forward(&xs, &block_skips, upsample_size, &ctx)?;
        }

        let xs = self.config.act_fn.apply(&self.conv_norm_out.forward(&xs)?)?;
        Ok(self.conv_out.forward(&xs)?)
    }
}

impl ParamTree for UNet2DConditionModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.conv_in.visit(&join(prefix, "conv_in"), f);
        self.embeddings.visit(prefix, f);
        self.down_blocks.visit(&join(prefix, "down_blocks"), f);
        self.up_blocks.visit(&join(prefix, "up_blocks"), f);
        self.mid_block.visit(&join(prefix, "mid_block"), f);
        self.conv_norm_out.visit(&join(prefix, "conv_norm_out"), f);
        self.conv_out.visit(&join(prefix, "conv_out"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        self.conv_in.visit_mut(&join(prefix, "conv_in"), f)?;
        self.embeddings.visit_mut(prefix, f)?;
        self.down_blocks.visit_mut(&join(prefix, "down_blocks"), f)?;
        self.up_blocks.visit_mut(&join(prefix, "up_blocks"), f)?;
        self.mid_block.visit_mut(&join(prefix, "mid_block"), f)?;
        self.conv_norm_out.visit_mut(&join(prefix, "conv_norm_out"), f)?;
        self.conv_out.visit_mut(&join(prefix, "conv_out"), f)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> UNetConfig {
        UNetConfig {
            block_out_channels: vec![32, 64],
            down_block_types: vec![DownBlockType::CrossAttnDownBlock2D, DownBlockType::DownBlock2D],
            up_block_types: vec![UpBlockType::UpBlock2D, UpBlockType::CrossAttnUpBlock2D],
            layers_per_block: 1,
            cross_attention_dim: 32,
            attention_head_dim: PerBlock::Uniform(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let unet = UNet2DConditionModel::new(&tiny_config(), &dev, DType::F32)?;
        let sample = Tensor::randn(0f32, 1f32, (1, 4, 16, 16), &dev)?;
        let t = Tensor::new(&[999f32], &dev)?;
        let ctx = Tensor::randn(0f32, 1f32, (1, 5, 32), &dev)?;
        let out = unet.forward(&UNetInput::new(&sample, &t, &ctx))?;
        assert_eq!(out.dims(), &[1, 4, 16, 16]);

        // Odd sizes go through the explicit upsample size path.
        let sample = Tensor::randn(0f32, 1f32, (1, 4, 15, 15), &dev)?;
        let out = unet.forward(&UNetInput::new(&sample, &t, &ctx))?;
        assert_eq!(out.dims(), &[1, 4, 15, 15]);
        Ok(())
    }

    #[test]
    fn test_zero_residuals_leave_output_unchanged() -> Result<()> {
        let dev = Device::Cpu;
        let unet = UNet2DConditionModel::new(&tiny_config(), &dev, DType::F32)?;
        let sample = Tensor::randn(0f32, 1f32, (1, 4, 16, 16), &dev)?;
        let t = Tensor::new(&[10f32], &dev)?;
        let ctx = Tensor::randn(0f32, 1f32, (1, 5, 32), &dev)?;
        let plain = unet.forward(&UNetInput::new(&sample, &t, &ctx))?;

        let residuals = vec![
            Tensor::zeros((1, 32, 16, 16), DType::F32, &dev)?,
            Tensor::zeros((1, 32, 16, 16), DType::F32, &dev)?,
            Tensor::zeros((1, 32, 8, 8), DType::F32, &dev)?,
            Tensor::zeros((1, 64, 8, 8), DType::F32, &dev)?,
        ];
        let mid = Tensor::zeros((1, 64, 8, 8), DType::F32, &dev)?;
        let mut input = UNetInput::new(&sample, &t, &ctx);
        input.down_block_additional_residuals = Some(&residuals);
        input.mid_block_additional_residual = Some(&mid);
        let controlled = unet.forward(&input)?;
        let diff = (plain - controlled)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        input.down_block_additional_residuals = Some(&residuals[..2]);
        assert!(unet.forward(&input).is_err());
        Ok(())
    }

    #[test]
    fn test_param_names_follow_diffusers() -> Result<()> {
        let unet = UNet2DConditionModel::new(&tiny_config(), &Device::Cpu, DType::F32)?;
        let state = unet.state_dict();
        for key in [
            "conv_in.weight",
            "time_embedding.linear_1.weight",
            "down_blocks.0.attentions.0.transformer_blocks.0.attn2.to_k.weight",
            "down_blocks.0.downsamplers.0.conv.weight",
            "mid_block.attentions.0.proj_in.weight",
            "mid_block.resnets.1.conv2.weight",
            "up_blocks.0.upsamplers.0.conv.weight",
            "up_blocks.1.attentions.1.transformer_blocks.0.ff.net.0.proj.weight",
            "conv_norm_out.weight",
            "conv_out.bias",
        ] {
            assert!(state.contains_key(key), "missing {key}");
        }
        Ok(())
    }

    #[test]
    fn test_load_reads_diffusers_layout() -> Result<()> {
        let dev = Device::Cpu;
        let unet = UNet2DConditionModel::new(&tiny_config(), &dev, DType::F32)?;
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(CONFIG_NAME), serde_json::to_string(unet.config())?)?;
        let tensors: std::collections::HashMap<String, Tensor> = unet.state_dict().into_iter().collect();
        candle_core::safetensors::save(&tensors, dir.path().join(WEIGHTS_NAME))?;

        let loaded = UNet2DConditionModel::from_pretrained(dir.path(), &dev, DType::F32)?;
        let a = unet.state_dict();
        let b = loaded.state_dict();
        let w = "down_blocks.0.resnets.0.conv1.weight";
        let diff = (&a[w] - &b[w])?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(a.len(), b.len());
        Ok(())
    }
}
