//! ControlNet conditioning network
//!
//! A copy of the UNet encoder half (time embeddings, `conv_in`, down blocks,
//! mid block) plus a small conditioning-image embedding and zero-initialised
//! 1x1 convolutions that turn every intermediate state into a residual for the
//! UNet.

use candle_core::{DType, Device, Module, Tensor};
use log::info;
use serde::{Deserialize, Serialize};

use super::attention::attention_bias;
use super::blocks::{build_down_blocks, BlockContext, DownBlock2D, MidBlock2DCrossAttn};
use super::config::*;
use super::embeddings::{AddedConditions, TrunkEmbeddings};
use super::layers::{conv_config, Activation, Conv2d, ParamFactory};
use super::params::{self, join, Layer, LayerMut, LoadReport, ParamTree, StateDict};
use crate::error::{config_err, Result};

/// diffusers `ControlNetModel` configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_conditioning_channels")]
    pub conditioning_channels: usize,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_down_block_types")]
    pub down_block_types: Vec<DownBlockType>,
    #[serde(default = "default_mid_block_type")]
    pub mid_block_type: Option<MidBlockType>,
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
    pub controlnet_conditioning_channel_order: ChannelOrder,
    #[serde(default = "default_conditioning_embedding_out_channels")]
    pub conditioning_embedding_out_channels: Vec<usize>,
    #[serde(default)]
    pub global_pool_conditions: bool,
    /// Only used by `text_image` addition embeddings, which are not built.
    #[serde(default = "default_addition_heads")]
    pub addition_embed_type_num_heads: usize,
    #[serde(default)]
    pub time_cond_proj_dim: Option<usize>,
}

fn default_conditioning_channels() -> usize {
    3
}

fn default_addition_heads() -> usize {
    64
}

fn default_conditioning_embedding_out_channels() -> Vec<usize> {
    vec![16, 32, 96, 256]
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            conditioning_channels: default_conditioning_channels(),
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            down_block_types: default_down_block_types(),
            mid_block_type: default_mid_block_type(),
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
            controlnet_conditioning_channel_order: ChannelOrder::Rgb,
            conditioning_embedding_out_channels: default_conditioning_embedding_out_channels(),
            global_pool_conditions: false,
            addition_embed_type_num_heads: default_addition_heads(),
            time_cond_proj_dim: None,
        }
    }
}

impl ControlNetConfig {
    /// Resolves per-block options and validates the architecture.
    pub fn trunk(&self) -> Result<TrunkConfig> {
        let n = self.block_out_channels.len();
        // diffusers passes `attention_head_dim` as the head count when
        // `num_attention_heads` is unset.
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
        if self.mid_block_type.is_none() {
            return Err(config_err("a ControlNet needs a mid block"));
        }
        if self.conditioning_embedding_out_channels.is_empty() {
            return Err(config_err("`conditioning_embedding_out_channels` must not be empty"));
        }
        Ok(trunk)
    }
}

/// Small conv stack turning the conditioning image into a `conv_in`-sized
/// feature map.
#[derive(Debug, Clone)]
pub struct ControlNetConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ControlNetConditioningEmbedding {
    pub fn new(
        conditioning_channels: usize,
        block_out_channels: &[usize],
        embedding_channels: usize,
        pf: &ParamFactory,
    ) -> candle_core::Result<Self> {
        let conv_in = Conv2d::new(
            conditioning_channels,
            block_out_channels[0],
            3,
            conv_config(1, 1),
            true,
            pf,
        )?;
        let mut blocks = Vec::with_capacity((block_out_channels.len() - 1) * 2);
        for pair in block_out_channels.windows(2) {
            let (channel_in, channel_out) = (pair[0], pair[1]);
            blocks.push(Conv2d::new(channel_in, channel_in, 3, conv_config(1, 1), true, pf)?);
            blocks.push(Conv2d::new(channel_in, channel_out, 3, conv_config(1, 2), true, pf)?);
        }
        let last = block_out_channels[block_out_channels.len() - 1];
        let conv_out = Conv2d::zeroed(last, embedding_channels, 3, conv_config(1, 1), pf)?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ControlNetConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = candle_nn::ops::silu(&self.conv_in.forward(xs)?)?;
        for block in &self.blocks {
            xs = candle_nn::ops::silu(&block.forward(&xs)?)?;
        }
        self.conv_out.forward(&xs)
    }
}

impl ParamTree for ControlNetConditioningEmbedding {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.conv_in.visit(&join(prefix, "conv_in"), f);
        self.blocks.visit(&join(prefix, "blocks"), f);
        self.conv_out.visit(&join(prefix, "conv_out"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        self.conv_in.visit_mut(&join(prefix, "conv_in"), f)?;
        self.blocks.visit_mut(&join(prefix, "blocks"), f)?;
        self.conv_out.visit_mut(&join(prefix, "conv_out"), f)
    }
}

/// Forward inputs, mirroring the diffusers ControlNet call.
#[derive(Debug, Clone, Copy)]
pub struct ControlNetInput<'a> {
    pub sample: &'a Tensor,
    pub timestep: &'a Tensor,
    pub encoder_hidden_states: &'a Tensor,
    pub controlnet_cond: &'a Tensor,
    pub conditioning_scale: f64,
    pub class_labels: Option<&'a Tensor>,
    pub timestep_cond: Option<&'a Tensor>,
    /// `(batch, key_len)` keep-mask over the encoder hidden states.
    pub attention_mask: Option<&'a Tensor>,
    pub added_cond: Option<&'a AddedConditions>,
    pub guess_mode: bool,
}

impl<'a> ControlNetInput<'a> {
    pub fn new(
        sample: &'a Tensor,
        timestep: &'a Tensor,
        encoder_hidden_states: &'a Tensor,
        controlnet_cond: &'a Tensor,
    ) -> Self {
        Self {
            sample,
            timestep,
            encoder_hidden_states,
            controlnet_cond,
            conditioning_scale: 1.0,
            class_labels: None,
            timestep_cond: None,
            attention_mask: None,
            added_cond: None,
            guess_mode: false,
        }
    }
}

/// Residuals for the UNet skip connections and mid block.
#[derive(Debug, Clone)]
pub struct ControlNetOutput {
    pub down_block_res_samples: Vec<Tensor>,
    pub mid_block_res_sample: Tensor,
}

#[derive(Debug, Clone)]
pub struct ControlNetModel {
    conv_in: Conv2d,
    embeddings: TrunkEmbeddings,
    controlnet_cond_embedding: Option<ControlNetConditioningEmbedding>,
    down_blocks: Vec<DownBlock2D>,
    controlnet_down_blocks: Vec<Conv2d>,
    mid_block: MidBlock2DCrossAttn,
    controlnet_mid_block: Conv2d,
    channel_order: ChannelOrder,
    global_pool_conditions: bool,
    device: Device,
    dtype: DType,
}

impl ControlNetModel {
    pub fn new(config: &ControlNetConfig, device: &Device, dtype: DType) -> Result<Self> {
        let trunk = config.trunk()?;
        let pf = ParamFactory::new(device, dtype);
        let first = trunk.block_out_channels[0];

        let conv_in = Conv2d::new(trunk.in_channels, first, 3, conv_config(1, 1), true, &pf)?;
        let embeddings = TrunkEmbeddings::new(&trunk, &pf)?;
        let controlnet_cond_embedding = ControlNetConditioningEmbedding::new(
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            first,
            &pf,
        )?;
        let down_blocks = build_down_blocks(&trunk, &pf)?;

        let mut controlnet_down_blocks = vec![Conv2d::zeroed(first, first, 1, conv_config(0, 1), &pf)?];
        for (i, block) in down_blocks.iter().enumerate() {
            let channels = trunk.block_out_channels[i];
            for _ in 0..block.num_states() {
                controlnet_down_blocks.push(Conv2d::zeroed(channels, channels, 1, conv_config(0, 1), &pf)?);
            }
        }
        let mid_channels = trunk.block_out_channels[trunk.block_out_channels.len() - 1];

        let model = Self {
            conv_in,
            embeddings,
            controlnet_cond_embedding: Some(controlnet_cond_embedding),
            down_blocks,
            controlnet_down_blocks,
            mid_block: MidBlock2DCrossAttn::new(&trunk, &pf)?,
            controlnet_mid_block: Conv2d::zeroed(mid_channels, mid_channels, 1, conv_config(0, 1), &pf)?,
            channel_order: config.controlnet_conditioning_channel_order,
            global_pool_conditions: config.global_pool_conditions,
            device: device.clone(),
            dtype,
        };
        info!(
            "Built ControlNet: {} down blocks, {} residuals, {} parameter tensors",
            model.down_blocks.len(),
            model.controlnet_down_blocks.len() + 1,
            params::named_parameters(&model).len()
        );
        Ok(model)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn has_class_embedding(&self) -> bool {
        self.embeddings.has_class_embedding()
    }

    pub fn has_conditioning_embedding(&self) -> bool {
        self.controlnet_cond_embedding.is_some()
    }

    /// Drops the conditioning-image embedding; the conditioning input then
    /// contributes nothing to `conv_in`'s output.
    pub fn disable_conditioning_embedding(&mut self) {
        self.controlnet_cond_embedding = None;
    }

    pub fn state_dict(&self) -> StateDict {
        params::state_dict(self)
    }

    pub fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<LoadReport> {
        params::load_state_dict(self, state, strict)
    }

    pub fn forward(&self, input: &ControlNetInput) -> Result<ControlNetOutput> {
        let sample = input.sample;
        let batch = sample.dim(0)?;
        let dtype = sample.dtype();

        let cond = match self.channel_order {
            ChannelOrder::Rgb => input.controlnet_cond.clone(),
            ChannelOrder::Bgr => flip_channels(input.controlnet_cond)?,
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

        let mut xs = self.conv_in.forward(sample)?;
        if let Some(cond_embedding) = &self.controlnet_cond_embedding {
            xs = (xs + cond_embedding.forward(&cond)?)?;
        }

        let mut down_states = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, states) = block.forward(&xs, &ctx)?;
            down_states.extend(states);
            xs = out;
        }
        let xs = self.mid_block.forward(&xs, &ctx)?;

        let mut down_block_res_samples = down_states
            .iter()
            .zip(self.controlnet_down_blocks.iter())
            .map(|(state, zero_conv)| zero_conv.forward(state))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mut mid_block_res_sample = self.controlnet_mid_block.forward(&xs)?;

        if input.guess_mode && !self.global_pool_conditions {
            // Scales rise from 0.1 for the shallowest residual to 1.0 for the mid block.
            let n = down_block_res_samples.len();
            for (i, res) in down_block_res_samples.iter_mut().enumerate() {
                let scale = 10f64.powf(-1.0 + i as f64 / n as f64) * input.conditioning_scale;
                *res = res.affine(scale, 0.0)?;
            }
            mid_block_res_sample = mid_block_res_sample.affine(input.conditioning_scale, 0.0)?;
        } else if input.conditioning_scale != 1.0 {
            for res in down_block_res_samples.iter_mut() {
                *res = res.affine(input.conditioning_scale, 0.0)?;
            }
            mid_block_res_sample = mid_block_res_sample.affine(input.conditioning_scale, 0.0)?;
        }

        if self.global_pool_conditions {
            for res in down_block_res_samples.iter_mut() {
                *res = spatial_mean(res)?;
            }
            mid_block_res_sample = spatial_mean(&mid_block_res_sample)?;
        }

        Ok(ControlNetOutput {
            down_block_res_samples,
            mid_block_res_sample,
        })
    }
}

impl ParamTree for ControlNetModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, Layer<'_>)) {
        self.conv_in.visit(&join(prefix, "conv_in"), f);
        self.embeddings.visit(prefix, f);
        self.controlnet_cond_embedding.visit(&join(prefix, "controlnet_cond_embedding"), f);
        self.down_blocks.visit(&join(prefix, "down_blocks"), f);
        self.controlnet_down_blocks.visit(&join(prefix, "controlnet_down_blocks"), f);
        self.mid_block.visit(&join(prefix, "mid_block"), f);
        self.controlnet_mid_block.visit(&join(prefix, "controlnet_mid_block"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, LayerMut<'_>) -> Result<()>,
    ) -> Result<()> {
        self.conv_in.visit_mut(&join(prefix, "conv_in"), f)?;
        self.embeddings.visit_mut(prefix, f)?;
        self.controlnet_cond_embedding
            .visit_mut(&join(prefix, "controlnet_cond_embedding"), f)?;
        self.down_blocks.visit_mut(&join(prefix, "down_blocks"), f)?;
        self.controlnet_down_blocks.visit_mut(&join(prefix, "controlnet_down_blocks"), f)?;
        self.mid_block.visit_mut(&join(prefix, "mid_block"), f)?;
        self.controlnet_mid_block.visit_mut(&join(prefix, "controlnet_mid_block"), f)
    }
}

fn flip_channels(xs: &Tensor) -> candle_core::Result<Tensor> {
    let channels = xs.dim(1)? as u32;
    let order: Vec<u32> = (0..channels).rev().collect();
    xs.index_select(&Tensor::new(order.as_slice(), xs.device())?, 1)
}

fn spatial_mean(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.mean_keepdim(3)?.mean_keepdim(2)
}
